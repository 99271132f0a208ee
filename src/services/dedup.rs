//! Dedup and path-healing engine
//!
//! Decides whether a previously recorded library entry can be reused instead
//! of re-downloading. Works entirely against the datastore and the
//! filesystem; never touches the network. Races between two workers chasing
//! the same not-yet-downloaded track are not prevented here — they resolve
//! downstream when entry creation hits the uniqueness conflict and the
//! pipeline re-runs this lookup.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::db::{Database, SongRecord, SourceKind};

use super::filesystem::{PathResolution, relative_to_root, resolve_library_path};

/// Normalize a submitted link into the canonical form used as the dedup key.
///
/// - Catalog links collapse to `https://open.spotify.com/<type>/<id>`,
///   dropping locale prefixes and tracking parameters.
/// - Video links collapse to `https://www.youtube.com/watch?v=<id>` across
///   the `youtu.be` / `shorts` / `watch` spellings.
/// - Audio-share links keep their path but lose query/fragment noise.
pub fn canonical_source_url(kind: SourceKind, raw: &str) -> Result<String> {
    let parsed = Url::parse(raw.trim())?;

    match kind {
        SourceKind::Catalog => {
            let segments: Vec<&str> = parsed
                .path_segments()
                .map(|s| s.filter(|p| !p.is_empty()).collect())
                .unwrap_or_default();
            // Locale prefixes like /intl-de/track/<id> are noise
            let segments: Vec<&str> = segments
                .into_iter()
                .filter(|s| !s.starts_with("intl-"))
                .collect();
            match segments.as_slice() {
                [kind_seg, id, ..]
                    if matches!(*kind_seg, "track" | "album" | "playlist" | "artist") =>
                {
                    Ok(format!("https://open.spotify.com/{kind_seg}/{id}"))
                }
                _ => anyhow::bail!("unsupported catalog URL shape: {raw}"),
            }
        }
        SourceKind::Video => {
            let host = parsed.host_str().unwrap_or_default();
            let video_id = if host.ends_with("youtu.be") {
                parsed
                    .path_segments()
                    .and_then(|mut s| s.next())
                    .map(|s| s.to_string())
            } else if parsed.path().starts_with("/shorts/") {
                parsed
                    .path_segments()
                    .and_then(|mut s| s.nth(1))
                    .map(|s| s.to_string())
            } else {
                parsed
                    .query_pairs()
                    .find(|(k, _)| k.as_ref() == "v")
                    .map(|(_, v)| v.into_owned())
            };
            match video_id.filter(|id| !id.is_empty()) {
                Some(id) => Ok(format!("https://www.youtube.com/watch?v={id}")),
                None => anyhow::bail!("unsupported video URL shape: {raw}"),
            }
        }
        SourceKind::AudioShare => {
            let mut stripped = parsed.clone();
            stripped.set_query(None);
            stripped.set_fragment(None);
            let mut s = stripped.to_string();
            while s.ends_with('/') {
                s.pop();
            }
            Ok(s)
        }
    }
}

/// Entry reuse decisions against the recorded library.
pub struct DedupEngine {
    db: Database,
    allowed_roots: Vec<PathBuf>,
}

impl DedupEngine {
    pub fn new(db: Database, allowed_roots: Vec<PathBuf>) -> Self {
        Self { db, allowed_roots }
    }

    /// Find a recorded entry for this source whose file still exists.
    ///
    /// Walks candidates newest-first through the path-safety check:
    /// - healed → stored path is updated if it drifted, entry returned
    /// - missing → stale entry deleted, next candidate tried
    /// - ambiguous → entry left untouched and skipped, never deleted
    pub async fn find_reusable(
        &self,
        user_id: Uuid,
        source_kind: SourceKind,
        canonical_url: &str,
    ) -> Result<Option<SongRecord>> {
        let candidates = self
            .db
            .songs()
            .find_by_source(user_id, source_kind, canonical_url)
            .await?;

        for mut candidate in candidates {
            let stored = Path::new(&candidate.file_path).to_path_buf();
            match resolve_library_path(&stored, &self.allowed_roots) {
                PathResolution::Healed(real) => {
                    if real != stored {
                        let relative = self
                            .allowed_roots
                            .iter()
                            .find_map(|root| relative_to_root(&real, root))
                            .map(|p| p.to_string_lossy().to_string())
                            .unwrap_or_else(|| candidate.relative_path.clone());

                        info!(
                            song_id = %candidate.id,
                            stored = %stored.display(),
                            healed = %real.display(),
                            "Healing drifted library path"
                        );
                        self.db
                            .songs()
                            .update_file_path(candidate.id, &real.to_string_lossy(), &relative)
                            .await?;
                        candidate.file_path = real.to_string_lossy().to_string();
                        candidate.relative_path = relative;
                    }
                    return Ok(Some(candidate));
                }
                PathResolution::Missing => {
                    info!(
                        song_id = %candidate.id,
                        path = %stored.display(),
                        "Recorded file is gone, deleting stale entry"
                    );
                    if let Err(e) = self.db.songs().delete(candidate.id).await {
                        warn!(song_id = %candidate.id, error = %e, "Failed to delete stale entry");
                    }
                }
                PathResolution::Ambiguous => {
                    debug!(
                        song_id = %candidate.id,
                        path = %stored.display(),
                        "Cannot verify recorded path against allowed roots, skipping"
                    );
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CreateSong;

    fn song_at(user: Uuid, url: &str, path: &Path, relative: &str) -> CreateSong {
        CreateSong {
            user_id: user,
            source_kind: SourceKind::Catalog,
            source_url: url.to_string(),
            file_path: path.to_string_lossy().to_string(),
            relative_path: relative.to_string(),
            title: "Time".into(),
            artist: "Pink Floyd".into(),
            album: None,
            track_number: None,
            disc_number: None,
            year: None,
            duration_secs: None,
            quality: None,
            task_id: None,
            playlist_id: None,
        }
    }

    #[test]
    fn test_catalog_urls_collapse_to_id() {
        let url = canonical_source_url(
            SourceKind::Catalog,
            "https://open.spotify.com/intl-de/track/4u7EnebtmKWzUH433cf5Qv?si=abc123&nd=1",
        )
        .unwrap();
        assert_eq!(url, "https://open.spotify.com/track/4u7EnebtmKWzUH433cf5Qv");

        assert!(canonical_source_url(SourceKind::Catalog, "https://open.spotify.com/").is_err());
    }

    #[test]
    fn test_video_url_spellings_converge() {
        for raw in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://youtu.be/dQw4w9WgXcQ?si=xyz",
            "https://www.youtube.com/shorts/dQw4w9WgXcQ",
        ] {
            assert_eq!(
                canonical_source_url(SourceKind::Video, raw).unwrap(),
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            );
        }
    }

    #[test]
    fn test_share_urls_lose_query_noise() {
        let url = canonical_source_url(
            SourceKind::AudioShare,
            "https://soundcloud.com/artist/some-track?in=artist/sets/list&utm_source=share#t=10",
        )
        .unwrap();
        assert_eq!(url, "https://soundcloud.com/artist/some-track");
    }

    #[tokio::test]
    async fn test_existing_entry_is_returned_unmutated() {
        let db = Database::connect_in_memory().await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let real_root = root.path().canonicalize().unwrap();
        let file = real_root.join("time.flac");
        tokio::fs::write(&file, b"x").await.unwrap();

        let user = Uuid::new_v4();
        let url = "https://open.spotify.com/track/abc";
        db.songs()
            .create(song_at(user, url, &file, "time.flac"))
            .await
            .unwrap();

        let engine = DedupEngine::new(db.clone(), vec![real_root.clone()]);
        let reused = engine
            .find_reusable(user, SourceKind::Catalog, url)
            .await
            .unwrap()
            .expect("entry should be reusable");
        assert_eq!(reused.file_path, file.to_string_lossy());
    }

    #[tokio::test]
    async fn test_drifted_path_is_healed_and_persisted() {
        let db = Database::connect_in_memory().await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let real_root = root.path().canonicalize().unwrap();
        let new_dir = real_root.join("Pink Floyd");
        tokio::fs::create_dir_all(&new_dir).await.unwrap();
        tokio::fs::write(new_dir.join("time.flac"), b"x").await.unwrap();

        let user = Uuid::new_v4();
        let url = "https://open.spotify.com/track/abc";
        let stored = real_root.join("old-spot").join("time.flac");
        db.songs()
            .create(song_at(user, url, &stored, "old-spot/time.flac"))
            .await
            .unwrap();

        let engine = DedupEngine::new(db.clone(), vec![real_root.clone()]);
        let reused = engine
            .find_reusable(user, SourceKind::Catalog, url)
            .await
            .unwrap()
            .expect("entry should be healed");

        assert!(reused.file_path.ends_with("Pink Floyd/time.flac"));
        // The heal was persisted
        let persisted = db.songs().get(reused.id).await.unwrap().unwrap();
        assert_eq!(persisted.file_path, reused.file_path);
        assert_eq!(persisted.relative_path, "Pink Floyd/time.flac");
    }

    #[tokio::test]
    async fn test_missing_file_deletes_entry() {
        let db = Database::connect_in_memory().await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let real_root = root.path().canonicalize().unwrap();

        let user = Uuid::new_v4();
        let url = "https://open.spotify.com/track/abc";
        let stored = real_root.join("gone.flac");
        let created = db
            .songs()
            .create(song_at(user, url, &stored, "gone.flac"))
            .await
            .unwrap();

        let engine = DedupEngine::new(db.clone(), vec![real_root.clone()]);
        let reused = engine
            .find_reusable(user, SourceKind::Catalog, url)
            .await
            .unwrap();

        assert!(reused.is_none());
        assert!(db.songs().get(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_path_is_skipped_never_deleted() {
        let db = Database::connect_in_memory().await.unwrap();
        let root = tempfile::tempdir().unwrap();
        let real_root = root.path().canonicalize().unwrap();

        let user = Uuid::new_v4();
        let url = "https://open.spotify.com/track/abc";
        // Stored path is outside every allowed root
        let stored = PathBuf::from("/mnt/unplugged-disk/music/time.flac");
        let created = db
            .songs()
            .create(song_at(user, url, &stored, "time.flac"))
            .await
            .unwrap();

        let engine = DedupEngine::new(db.clone(), vec![real_root.clone()]);
        let reused = engine
            .find_reusable(user, SourceKind::Catalog, url)
            .await
            .unwrap();

        assert!(reused.is_none());
        // Entry untouched
        let persisted = db.songs().get(created.id).await.unwrap().unwrap();
        assert_eq!(persisted.file_path, stored.to_string_lossy());
    }
}
