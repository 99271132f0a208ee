//! Track similarity scoring
//!
//! Scores how well a provider search hit matches the wanted track. Each
//! sub-score is on a 0-100 scale; the weighted total is what the resolver
//! filters and sorts on.
//!
//! Weighting: title 40%, artist 30%, album 20%, duration 10%. Missing
//! metadata (no duration, no album) contributes a neutral 50 to its
//! sub-score — absence is not evidence of mismatch.

use super::text_utils::normalize_for_match;

/// Candidates scoring at or above this are considered likely matches.
pub const LIKELY_MATCH_THRESHOLD: f64 = 45.0;

/// Per-field similarity breakdown for a candidate.
#[derive(Debug, Clone, Copy)]
pub struct MatchScore {
    pub total: f64,
    pub title: f64,
    pub artist: f64,
    pub album: f64,
    pub duration: f64,
}

impl MatchScore {
    pub fn is_likely(&self) -> bool {
        self.total >= LIKELY_MATCH_THRESHOLD
    }
}

/// Score a candidate track against the wanted track.
///
/// `target_artists` may list several artists; the artist sub-score is the
/// best similarity any of them achieves against the candidate's artist.
pub fn score_track(
    target_title: &str,
    target_artists: &[String],
    target_album: Option<&str>,
    target_duration_secs: Option<u32>,
    candidate_title: &str,
    candidate_artist: &str,
    candidate_album: Option<&str>,
    candidate_duration_secs: Option<u32>,
) -> MatchScore {
    let title = string_similarity(target_title, candidate_title);

    let artist = target_artists
        .iter()
        .map(|a| string_similarity(a, candidate_artist))
        .fold(0.0_f64, f64::max);

    let album = match (target_album, candidate_album) {
        (Some(a), Some(b)) if !a.trim().is_empty() && !b.trim().is_empty() => {
            string_similarity(a, b)
        }
        _ => 50.0,
    };

    let duration = duration_similarity(target_duration_secs, candidate_duration_secs);

    let total = 0.4 * title + 0.3 * artist + 0.2 * album + 0.1 * duration;

    MatchScore {
        total: total.clamp(0.0, 100.0),
        title,
        artist,
        album,
        duration,
    }
}

/// String similarity on a 0-100 scale.
///
/// Exact normalized match scores 100, substring containment either way 90,
/// otherwise a word-overlap score: every word pair across the two strings
/// awards 1.0 for an exact match, 0.8 when one word contains the other, 0.6
/// when both words are longer than three characters and within edit
/// distance 1, summed and divided by the larger word count.
pub fn string_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_for_match(a);
    let b = normalize_for_match(b);

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 100.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 90.0;
    }

    let words_a: Vec<&str> = a.split_whitespace().collect();
    let words_b: Vec<&str> = b.split_whitespace().collect();

    let mut matches = 0.0_f64;
    for wa in &words_a {
        for wb in &words_b {
            if wa == wb {
                matches += 1.0;
            } else if wa.contains(wb) || wb.contains(wa) {
                matches += 0.8;
            } else if wa.len() > 3 && wb.len() > 3 && strsim::levenshtein(wa, wb) <= 1 {
                matches += 0.6;
            }
        }
    }

    let larger = words_a.len().max(words_b.len()) as f64;
    ((matches / larger) * 100.0).clamp(0.0, 100.0)
}

/// Duration similarity banded by absolute difference in seconds.
///
/// ≤3s → 100, ≤7s → 80, ≤15s → 60, ≤30s → 30, else 0. When either side has
/// no duration the sub-score is a neutral 50.
pub fn duration_similarity(target: Option<u32>, candidate: Option<u32>) -> f64 {
    let (Some(t), Some(c)) = (target, candidate) else {
        return 50.0;
    };
    let diff = t.abs_diff(c);
    match diff {
        0..=3 => 100.0,
        4..=7 => 80.0,
        8..=15 => 60.0,
        16..=30 => 30.0,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artists(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_track_scores_max_contributions() {
        let score = score_track(
            "Time",
            &artists(&["Pink Floyd"]),
            Some("The Dark Side of the Moon"),
            Some(413),
            "Time",
            "Pink Floyd",
            Some("The Dark Side of the Moon"),
            Some(413),
        );
        assert_eq!(score.title, 100.0);
        assert_eq!(score.artist, 100.0);
        assert_eq!(score.album, 100.0);
        assert_eq!(score.duration, 100.0);
        assert_eq!(score.total, 100.0);
    }

    #[test]
    fn test_score_always_within_bounds() {
        let score = score_track(
            "aaa aaa aaa",
            &artists(&["aaa"]),
            Some("aaa aaa"),
            Some(100),
            "aaa",
            "aaa",
            Some("aaa"),
            Some(100),
        );
        assert!(score.total >= 0.0 && score.total <= 100.0);
        assert!(score.title <= 100.0);

        let nothing = score_track("x", &artists(&["y"]), Some("z"), Some(0), "q", "w", Some("e"), Some(600));
        assert!(nothing.total >= 0.0);
    }

    #[test]
    fn test_containment_scores_90() {
        assert_eq!(string_similarity("Time", "Time (2011 Remaster)"), 100.0); // bracket stripped
        assert_eq!(string_similarity("Speak to Me", "Speak to Me Breathe"), 90.0);
    }

    #[test]
    fn test_word_overlap_with_typo() {
        // "breathe" vs "breathy" is edit distance 1 with both words > 3 chars
        let s = string_similarity("breathe slow", "breathy slow");
        assert!(s > 50.0 && s < 90.0, "got {s}");
    }

    #[test]
    fn test_duration_banding() {
        assert_eq!(duration_similarity(Some(200), Some(200)), 100.0);
        assert_eq!(duration_similarity(Some(200), Some(203)), 100.0);
        assert_eq!(duration_similarity(Some(200), Some(206)), 80.0);
        assert_eq!(duration_similarity(Some(200), Some(212)), 60.0);
        assert_eq!(duration_similarity(Some(200), Some(228)), 30.0);
        assert_eq!(duration_similarity(Some(200), Some(231)), 0.0);
        assert_eq!(duration_similarity(None, Some(200)), 50.0);
        assert_eq!(duration_similarity(Some(200), None), 50.0);
    }

    #[test]
    fn test_multiple_artists_takes_best() {
        let score = score_track(
            "Under Pressure",
            &artists(&["Queen", "David Bowie"]),
            None,
            None,
            "Under Pressure",
            "David Bowie",
            None,
            None,
        );
        assert_eq!(score.artist, 100.0);
    }

    #[test]
    fn test_blank_album_is_neutral() {
        let score = score_track(
            "Time",
            &artists(&["Pink Floyd"]),
            None,
            None,
            "Time",
            "Pink Floyd",
            Some("Singles Collection"),
            None,
        );
        assert_eq!(score.album, 50.0);
    }

    #[test]
    fn test_likely_threshold() {
        let good = score_track(
            "Comfortably Numb",
            &artists(&["Pink Floyd"]),
            Some("The Wall"),
            Some(382),
            "Comfortably Numb",
            "Pink Floyd",
            Some("The Wall (Deluxe)"),
            Some(384),
        );
        assert!(good.is_likely());

        let bad = score_track(
            "Comfortably Numb",
            &artists(&["Pink Floyd"]),
            Some("The Wall"),
            Some(382),
            "Barbie Girl",
            "Aqua",
            Some("Aquarium"),
            Some(197),
        );
        assert!(!bad.is_likely());
    }
}
