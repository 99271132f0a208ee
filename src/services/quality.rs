//! Audio quality ranking
//!
//! Providers describe streams with their own labels (Qobuz format ids, Tidal
//! audio quality strings). Everything is folded into one ordinal ladder so
//! that matches from different providers can be compared: when two providers
//! both have the wanted track, the higher rung wins and similarity only
//! breaks ties.

use serde::{Deserialize, Serialize};

/// Ordinal audio quality ladder, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AudioQuality {
    /// Lossy, typical 128-160 kbps
    Standard,
    /// Lossy, 320 kbps class
    High,
    /// Lossless 16-bit / 44.1 kHz
    Lossless,
    /// Hi-res up to 24-bit / 96 kHz
    HiRes96,
    /// Hi-res up to 24-bit / 192 kHz
    HiRes192,
}

impl AudioQuality {
    /// Numeric rank; strictly increasing along the ladder.
    pub fn rank(&self) -> u8 {
        match self {
            AudioQuality::Standard => 0,
            AudioQuality::High => 1,
            AudioQuality::Lossless => 2,
            AudioQuality::HiRes96 => 3,
            AudioQuality::HiRes192 => 4,
        }
    }

    /// Parse a provider-reported quality label.
    ///
    /// Understands Qobuz format ids ("5", "6", "7", "27"), Tidal quality
    /// strings ("LOW", "HIGH", "LOSSLESS", "HI_RES", "HI_RES_LOSSLESS") and a
    /// few generic spellings. Unknown labels fall back to `Standard`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_uppercase().as_str() {
            "5" | "LOW" | "MP3" | "MP3_128" | "AAC_96" | "STANDARD" => AudioQuality::Standard,
            "6" | "HIGH" | "MP3_320" | "AAC_320" => AudioQuality::High,
            "LOSSLESS" | "FLAC" | "CD" | "FLAC_16" => AudioQuality::Lossless,
            "7" | "HI_RES" | "HIRES" | "FLAC_24_96" => AudioQuality::HiRes96,
            "27" | "HI_RES_LOSSLESS" | "HI_RES_MAX" | "FLAC_24_192" => AudioQuality::HiRes192,
            _ => AudioQuality::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioQuality::Standard => "standard",
            AudioQuality::High => "high",
            AudioQuality::Lossless => "lossless",
            AudioQuality::HiRes96 => "hi_res_96",
            AudioQuality::HiRes192 => "hi_res_192",
        }
    }
}

impl std::fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
