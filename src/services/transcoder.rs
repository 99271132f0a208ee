//! Transcoding collaborator
//!
//! Wraps the external `ffmpeg` process: (input file, target codec/quality) →
//! output file or a diagnostic error. Also probes finished files with lofty
//! so the recorded metadata reflects the actual asset on disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use lofty::prelude::*;
use lofty::probe::Probe;
use tokio::process::Command;
use tracing::debug;

/// Technical properties read back from a finished audio file
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioFileInfo {
    pub duration_secs: Option<u64>,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate_hz: Option<u32>,
    pub bit_depth: Option<u8>,
}

/// External ffmpeg process wrapper
pub struct TranscoderService {
    ffmpeg_path: String,
}

impl TranscoderService {
    pub fn new(ffmpeg_path: String) -> Self {
        Self { ffmpeg_path }
    }

    /// Transcode `input` into `target_format` at `target_quality`, writing a
    /// sibling file in `dest_dir`. Returns the output path.
    pub async fn transcode(
        &self,
        input: &Path,
        dest_dir: &Path,
        target_format: &str,
        target_quality: &str,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("track");
        let output_path = dest_dir.join(format!("{stem}.{target_format}"));

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-y", "-i"])
            .arg(input)
            .args(["-vn", "-map_metadata", "0"])
            .args(codec_args(target_format, target_quality))
            .arg(&output_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        debug!(
            input = %input.display(),
            output = %output_path.display(),
            format = %target_format,
            quality = %target_quality,
            "Transcoding"
        );

        let output = cmd.output().await.context("failed to spawn ffmpeg")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            bail!("transcode failed (exit {:?}): {}", output.status.code(), tail);
        }

        Ok(output_path)
    }

    /// Read technical properties from a finished file. Failures are reported,
    /// not fatal; callers fall back to provider-reported metadata.
    pub async fn probe_file(&self, path: &Path) -> Result<AudioFileInfo> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let tagged = Probe::open(&path)
                .with_context(|| format!("cannot open {}", path.display()))?
                .read()
                .with_context(|| format!("cannot read tags from {}", path.display()))?;
            let props = tagged.properties();
            Ok(AudioFileInfo {
                duration_secs: Some(props.duration().as_secs()),
                bitrate_kbps: props.audio_bitrate(),
                sample_rate_hz: props.sample_rate(),
                bit_depth: props.bit_depth(),
            })
        })
        .await
        .context("probe task panicked")?
    }
}

/// ffmpeg codec arguments per target format/quality
fn codec_args(target_format: &str, target_quality: &str) -> Vec<String> {
    let bitrate = match target_quality {
        "standard" => "192k",
        _ => "320k",
    };

    match target_format {
        "flac" => vec!["-c:a".into(), "flac".into()],
        "wav" => vec!["-c:a".into(), "pcm_s16le".into()],
        "opus" => vec!["-c:a".into(), "libopus".into(), "-b:a".into(), bitrate.into()],
        "ogg" => vec!["-c:a".into(), "libvorbis".into(), "-b:a".into(), bitrate.into()],
        "m4a" | "aac" => vec!["-c:a".into(), "aac".into(), "-b:a".into(), bitrate.into()],
        // mp3 and anything unrecognized
        _ => vec!["-c:a".into(), "libmp3lame".into(), "-b:a".into(), bitrate.into()],
    }
}

/// Whether a downloaded file already satisfies the target and the transcode
/// step can be skipped.
pub fn can_skip_transcode(source: &Path, target_format: &str, prefer_source_codec: bool) -> bool {
    let source_ext = source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match source_ext {
        Some(ext) if ext == target_format.to_lowercase() => true,
        Some(_) => prefer_source_codec,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_args_by_format() {
        assert_eq!(codec_args("flac", "lossless"), vec!["-c:a", "flac"]);
        assert_eq!(
            codec_args("mp3", "standard"),
            vec!["-c:a", "libmp3lame", "-b:a", "192k"]
        );
        assert_eq!(
            codec_args("opus", "high"),
            vec!["-c:a", "libopus", "-b:a", "320k"]
        );
    }

    #[test]
    fn test_can_skip_transcode() {
        assert!(can_skip_transcode(Path::new("a.flac"), "flac", false));
        assert!(can_skip_transcode(Path::new("a.FLAC"), "flac", false));
        assert!(!can_skip_transcode(Path::new("a.opus"), "flac", false));
        assert!(can_skip_transcode(Path::new("a.opus"), "flac", true));
        assert!(!can_skip_transcode(Path::new("noext"), "flac", true));
    }
}
