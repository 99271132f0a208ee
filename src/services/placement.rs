//! File placement engine
//!
//! Computes a safe, organized, collision-free destination for a finished
//! asset and moves it into the managed library:
//! `music/<Artist>/<Year> - <Album>/[<Disc>-]<Track> - <Title>.<ext>`.
//! Placement is the only code that mutates the library tree.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info};

use super::text_utils::{collapse_whitespace, truncate_chars};

/// Longest allowed path segment, in characters
const MAX_SEGMENT_CHARS: usize = 120;

/// How many `(n)` suffixes to try before falling back to a timestamp
const MAX_COLLISION_SUFFIX: u32 = 50;

/// Metadata driving the destination layout
#[derive(Debug, Clone, Default)]
pub struct PlacementMetadata {
    pub artist: String,
    pub album: String,
    pub title: String,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
}

/// A file successfully moved into the library
#[derive(Debug, Clone)]
pub struct PlacedFile {
    pub absolute_path: PathBuf,
    /// Path relative to the managed storage root
    pub relative_path: PathBuf,
}

/// Computes destinations under one managed storage root and moves files there.
pub struct PlacementEngine {
    storage_root: PathBuf,
}

impl PlacementEngine {
    pub fn new(storage_root: PathBuf) -> Self {
        Self { storage_root }
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    /// Move a finished temp file into its organized library location.
    ///
    /// Refuses with an error when the computed destination would escape the
    /// storage root. On name collision an incrementing ` (2)`, ` (3)`, …
    /// suffix is applied until a free name is found.
    pub async fn place(&self, source: &Path, metadata: &PlacementMetadata, extension: &str) -> Result<PlacedFile> {
        let relative = build_relative_path(metadata, extension);
        let absolute = self.resolve_destination(&relative)?;

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let absolute = free_destination(&absolute).await;
        move_file(source, &absolute).await?;

        let relative = absolute
            .strip_prefix(&self.storage_root)
            .map(|p| p.to_path_buf())
            .unwrap_or(relative);

        info!(
            path = %absolute.display(),
            "Filed track into library"
        );

        Ok(PlacedFile {
            absolute_path: absolute,
            relative_path: relative,
        })
    }

    /// Join a relative destination onto the storage root, refusing anything
    /// that would land outside it.
    fn resolve_destination(&self, relative: &Path) -> Result<PathBuf> {
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!(
                "unsafe destination path {:?}: refusing to place outside the storage root",
                relative
            );
        }

        let absolute = self.storage_root.join(relative);
        if !absolute.starts_with(&self.storage_root) {
            bail!(
                "destination {} falls outside the storage root {}",
                absolute.display(),
                self.storage_root.display()
            );
        }
        Ok(absolute)
    }
}

/// Compute the library-relative destination for a track.
pub fn build_relative_path(metadata: &PlacementMetadata, extension: &str) -> PathBuf {
    let artist = sanitize_segment(&metadata.artist, "Unknown Artist");
    let album = sanitize_segment(&metadata.album, "Singles");
    let title = sanitize_segment(&metadata.title, "Unknown title");

    let album_dir = match metadata.year {
        Some(year) => format!("{year} - {album}"),
        None => album,
    };

    let file_stem = match (metadata.disc_number, metadata.track_number) {
        (Some(disc), Some(track)) if disc > 1 => format!("{disc}-{track:02} - {title}"),
        (_, Some(track)) => format!("{track:02} - {title}"),
        _ => title,
    };

    let ext = extension.trim_start_matches('.');
    PathBuf::from("music")
        .join(artist)
        .join(album_dir)
        .join(format!("{file_stem}.{ext}"))
}

/// Sanitize one path segment: strip filesystem-illegal characters, collapse
/// whitespace, cap length, and substitute `fallback` when nothing is left.
fn sanitize_segment(raw: &str, fallback: &str) -> String {
    let cleaned = collapse_whitespace(&sanitize_filename::sanitize(raw));
    let cleaned = truncate_chars(&cleaned, MAX_SEGMENT_CHARS);
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

/// Find a destination that does not already exist, appending ` (2)`, ` (3)`, …
/// and finally a timestamp when the suffix space is exhausted.
async fn free_destination(wanted: &Path) -> PathBuf {
    if !wanted.exists() {
        return wanted.to_path_buf();
    }

    let stem = wanted
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("track");
    let ext = wanted.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = wanted.parent().unwrap_or_else(|| Path::new(""));

    for n in 2..=MAX_COLLISION_SUFFIX {
        let candidate = parent.join(format!("{stem} ({n}).{ext}"));
        if !candidate.exists() {
            debug!(path = %candidate.display(), "Destination collision, using suffixed name");
            return candidate;
        }
    }

    parent.join(format!("{stem} ({}).{ext}", Utc::now().timestamp_millis()))
}

/// Move a file, falling back to copy-then-delete when rename fails across
/// storage devices.
async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(source, dest)
                .await
                .with_context(|| format!("failed to copy {} to {}", source.display(), dest.display()))?;
            tokio::fs::remove_file(source)
                .await
                .with_context(|| format!("failed to remove {}", source.display()))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn metadata() -> PlacementMetadata {
        PlacementMetadata {
            artist: "Pink Floyd".into(),
            album: "The Dark Side of the Moon".into(),
            title: "Time".into(),
            track_number: Some(4),
            disc_number: Some(1),
            year: Some(1973),
        }
    }

    #[test]
    fn test_relative_path_shape() {
        let rel = build_relative_path(&metadata(), "flac");
        assert_eq!(
            rel,
            PathBuf::from("music/Pink Floyd/1973 - The Dark Side of the Moon/04 - Time.flac")
        );
    }

    #[test]
    fn test_disc_prefix_only_beyond_disc_one() {
        let mut meta = metadata();
        meta.disc_number = Some(2);
        let rel = build_relative_path(&meta, "flac");
        assert!(rel.to_string_lossy().ends_with("2-04 - Time.flac"));
    }

    #[test]
    fn test_blank_fields_fall_back() {
        let meta = PlacementMetadata {
            artist: "   ".into(),
            album: String::new(),
            title: "///".into(),
            track_number: None,
            disc_number: None,
            year: None,
        };
        let rel = build_relative_path(&meta, "mp3");
        assert_eq!(
            rel,
            PathBuf::from("music/Unknown Artist/Singles/Unknown title.mp3")
        );
    }

    #[test]
    fn test_illegal_characters_are_stripped() {
        let meta = PlacementMetadata {
            artist: "AC/DC".into(),
            album: "Back in Black?".into(),
            title: "Hells: Bells".into(),
            track_number: Some(1),
            disc_number: None,
            year: Some(1980),
        };
        let rel = build_relative_path(&meta, "flac");
        let s = rel.to_string_lossy();
        assert!(!s.contains('?'));
        assert!(!s.contains(':'));
        assert_eq!(rel.components().count(), 4); // music / artist / album / file
    }

    #[test]
    fn test_long_segments_are_capped() {
        let meta = PlacementMetadata {
            title: "x".repeat(500),
            ..metadata()
        };
        let rel = build_relative_path(&meta, "flac");
        let file = rel.file_name().unwrap().to_string_lossy().to_string();
        assert!(file.chars().count() <= MAX_SEGMENT_CHARS + 16);
    }

    #[tokio::test]
    async fn test_place_moves_file() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("temp.flac");
        tokio::fs::write(&source, b"audio").await.unwrap();

        let engine = PlacementEngine::new(root.path().to_path_buf());
        let placed = engine.place(&source, &metadata(), "flac").await.unwrap();

        assert!(placed.absolute_path.exists());
        assert!(!source.exists());
        assert_eq!(
            placed.relative_path,
            PathBuf::from("music/Pink Floyd/1973 - The Dark Side of the Moon/04 - Time.flac")
        );
        assert_eq!(tokio::fs::read(&placed.absolute_path).await.unwrap(), b"audio");
    }

    #[tokio::test]
    async fn test_collisions_get_distinct_paths() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let engine = PlacementEngine::new(root.path().to_path_buf());

        let first_src = scratch.path().join("a.flac");
        let second_src = scratch.path().join("b.flac");
        tokio::fs::write(&first_src, b"first").await.unwrap();
        tokio::fs::write(&second_src, b"second").await.unwrap();

        let first = engine.place(&first_src, &metadata(), "flac").await.unwrap();
        let second = engine.place(&second_src, &metadata(), "flac").await.unwrap();

        assert_ne!(first.absolute_path, second.absolute_path);
        assert!(second
            .absolute_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains("(2)"));
        // Neither overwrote the other
        assert_eq!(tokio::fs::read(&first.absolute_path).await.unwrap(), b"first");
        assert_eq!(tokio::fs::read(&second.absolute_path).await.unwrap(), b"second");
    }

    #[test]
    fn test_traversal_components_are_refused() {
        let engine = PlacementEngine::new(PathBuf::from("/srv/library"));
        let err = engine
            .resolve_destination(Path::new("music/../../etc/passwd"))
            .unwrap_err();
        assert!(err.to_string().contains("outside the storage root"));
    }
}
