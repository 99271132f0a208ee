//! Audio extraction collaborator
//!
//! Wraps the external `yt-dlp` process. Two capabilities are consumed:
//! metadata probing of any submitted link (single track or playlist) and the
//! actual byte download for direct-link sources. Catalog-backed sources only
//! use the metadata half; their bytes come from a provider match.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Metadata for one extractable track
#[derive(Debug, Clone)]
pub struct ExtractedTrack {
    pub url: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: Option<String>,
    pub duration_secs: Option<u32>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<u32>,
    pub thumbnail_url: Option<String>,
}

/// What a submitted link turned out to be
#[derive(Debug, Clone)]
pub enum SourceMetadata {
    Single(ExtractedTrack),
    Playlist {
        title: Option<String>,
        entries: Vec<ExtractedTrack>,
    },
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    track: Option<String>,
    artist: Option<String>,
    artists: Option<Vec<String>>,
    creator: Option<String>,
    uploader: Option<String>,
    album: Option<String>,
    duration: Option<f64>,
    track_number: Option<u32>,
    disc_number: Option<u32>,
    release_year: Option<u32>,
    upload_date: Option<String>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    entries: Option<Vec<RawInfo>>,
}

/// External yt-dlp process wrapper
pub struct ExtractorService {
    ytdlp_path: String,
}

impl ExtractorService {
    pub fn new(ytdlp_path: String) -> Self {
        Self { ytdlp_path }
    }

    /// Probe a link for track/playlist metadata without downloading anything.
    pub async fn probe(&self, url: &str) -> Result<SourceMetadata> {
        let output = Command::new(&self.ytdlp_path)
            .args(["-J", "--no-warnings", "--skip-download"])
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("metadata extraction failed: {}", stderr.trim());
        }

        let raw: RawInfo =
            serde_json::from_slice(&output.stdout).context("unparseable extractor output")?;
        parse_source_metadata(raw, url)
    }

    /// Download the best audio stream of a direct-link source into `dest_dir`.
    /// Returns the path of the produced file.
    pub async fn download_audio(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let template = dest_dir.join("%(id)s.%(ext)s");
        let output = Command::new(&self.ytdlp_path)
            .args(["-f", "bestaudio/best", "-x", "--no-playlist", "--no-warnings"])
            .args(["--print", "after_move:filepath", "--no-simulate"])
            .arg("-o")
            .arg(&template)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("audio download failed: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| PathBuf::from(l.trim()))
            .filter(|p| p.exists());

        match path {
            Some(p) => {
                debug!(url = %url, path = %p.display(), "Extractor produced audio file");
                Ok(p)
            }
            None => bail!("extractor reported success but produced no file"),
        }
    }
}

fn parse_source_metadata(raw: RawInfo, fallback_url: &str) -> Result<SourceMetadata> {
    if raw.kind.as_deref() == Some("playlist") || raw.entries.is_some() {
        let title = raw.title.clone();
        let entries = raw
            .entries
            .unwrap_or_default()
            .into_iter()
            .filter_map(|e| parse_track(e, None))
            .collect::<Vec<_>>();
        if entries.is_empty() {
            bail!("playlist contains no extractable entries");
        }
        return Ok(SourceMetadata::Playlist { title, entries });
    }

    match parse_track(raw, Some(fallback_url)) {
        Some(track) => Ok(SourceMetadata::Single(track)),
        None => bail!("no track metadata in extractor output"),
    }
}

fn parse_track(raw: RawInfo, fallback_url: Option<&str>) -> Option<ExtractedTrack> {
    let url = raw
        .webpage_url
        .clone()
        .or_else(|| fallback_url.map(|s| s.to_string()))
        .or(raw.id.clone())?;

    // Prefer the tagged track title over the page title
    let title = raw.track.clone().or(raw.title.clone())?;

    let artists = raw
        .artists
        .clone()
        .filter(|a| !a.is_empty())
        .or_else(|| {
            raw.artist
                .as_ref()
                .map(|a| a.split(',').map(|s| s.trim().to_string()).collect())
        })
        .or_else(|| raw.creator.clone().map(|c| vec![c]))
        .or_else(|| raw.uploader.clone().map(|u| vec![u]))
        .unwrap_or_default();

    let year = raw.release_year.or_else(|| {
        raw.upload_date
            .as_deref()
            .and_then(|d| d.get(0..4))
            .and_then(|y| y.parse().ok())
    });

    Some(ExtractedTrack {
        url,
        title,
        artists,
        album: raw.album,
        duration_secs: raw.duration.map(|d| d.round() as u32),
        track_number: raw.track_number,
        disc_number: raw.disc_number,
        year,
        thumbnail_url: raw.thumbnail,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_track() {
        let raw: RawInfo = serde_json::from_str(
            r#"{
                "id": "dQw4w9WgXcQ",
                "title": "Artist - Song (Official Video)",
                "track": "Song",
                "artist": "Artist One, Artist Two",
                "album": "Album",
                "duration": 212.4,
                "track_number": 3,
                "upload_date": "20091025",
                "thumbnail": "https://img.example.com/t.jpg",
                "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
            }"#,
        )
        .unwrap();

        let meta = parse_source_metadata(raw, "https://example.com").unwrap();
        let SourceMetadata::Single(track) = meta else {
            panic!("expected single track");
        };
        assert_eq!(track.title, "Song");
        assert_eq!(track.artists, vec!["Artist One", "Artist Two"]);
        assert_eq!(track.duration_secs, Some(212));
        assert_eq!(track.year, Some(2009));
        assert_eq!(track.track_number, Some(3));
    }

    #[test]
    fn test_parse_playlist() {
        let raw: RawInfo = serde_json::from_str(
            r#"{
                "_type": "playlist",
                "title": "Road Trip",
                "entries": [
                    {"title": "One", "uploader": "Someone", "duration": 100, "webpage_url": "https://w/1"},
                    {"title": "Two", "uploader": "Someone", "duration": 200, "webpage_url": "https://w/2"}
                ]
            }"#,
        )
        .unwrap();

        let meta = parse_source_metadata(raw, "https://example.com/playlist").unwrap();
        let SourceMetadata::Playlist { title, entries } = meta else {
            panic!("expected playlist");
        };
        assert_eq!(title.as_deref(), Some("Road Trip"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].artists, vec!["Someone"]);
    }

    #[test]
    fn test_entry_without_title_is_dropped() {
        let raw: RawInfo = serde_json::from_str(
            r#"{
                "_type": "playlist",
                "title": "Partly broken",
                "entries": [
                    {"title": "Good", "webpage_url": "https://w/1"},
                    {"webpage_url": "https://w/2"}
                ]
            }"#,
        )
        .unwrap();

        let meta = parse_source_metadata(raw, "x://y").unwrap();
        let SourceMetadata::Playlist { entries, .. } = meta else {
            panic!("expected playlist");
        };
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_empty_playlist_is_an_error() {
        let raw: RawInfo = serde_json::from_str(r#"{"_type": "playlist", "entries": []}"#).unwrap();
        assert!(parse_source_metadata(raw, "x://y").is_err());
    }
}
