//! Shared text normalization utilities
//!
//! Normalization used by the track matcher and the file placement engine.

use once_cell::sync::Lazy;
use regex::Regex;

static BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\([^)]*\)|\[[^\]]*\]|\{[^}]*\}").expect("bracket regex"));

/// Normalize a track/album/artist string for comparison.
///
/// - Lowercase
/// - Remove bracketed content (e.g. "(Remastered 2011)", "[Live]")
/// - Remove quotes, normalize dashes
/// - Separators to spaces, collapse whitespace
pub fn normalize_for_match(s: &str) -> String {
    let without_brackets = BRACKETED.replace_all(s, "");

    without_brackets
        .to_lowercase()
        .replace(['\'', '"', '`'], "")
        .replace(['–', '—'], "-")
        .replace(['-', '_', '.', ',', ':', ';', '!', '?', '&', '/'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate a string to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect::<String>().trim_end().to_string()
}
