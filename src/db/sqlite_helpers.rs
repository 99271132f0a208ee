//! SQLite helper utilities for type conversion
//!
//! SQLite has no native UUID, timestamp, or JSON types; everything is stored
//! as TEXT. This module holds the conversions plus the uniqueness-conflict
//! detector the acquisition pipeline relies on.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use uuid::Uuid;

// ============================================================================
// UUID helpers
// ============================================================================

/// Convert a UUID to a SQLite-compatible string
#[inline]
pub fn uuid_to_str(id: Uuid) -> String {
    id.to_string()
}

/// Parse a SQLite string back to a UUID
#[inline]
pub fn str_to_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| anyhow!("Invalid UUID '{}': {}", s, e))
}

// ============================================================================
// Timestamp helpers (stored as RFC 3339 TEXT)
// ============================================================================

/// Current UTC time as an RFC 3339 string for SQLite storage
#[inline]
pub fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse an RFC 3339 string from SQLite back to a DateTime
#[inline]
pub fn str_to_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow!("Invalid timestamp '{}': {}", s, e))
}

/// Parse an optional RFC 3339 string to an optional DateTime
#[inline]
pub fn str_to_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(str_to_datetime).transpose()
}

// ============================================================================
// Error classification
// ============================================================================

/// Whether a sqlx error is a UNIQUE constraint violation.
///
/// The dedup design resolves insert races by catching this case distinctly
/// and re-querying for the row the concurrent winner created, so it must not
/// be confused with any other write failure.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_CONSTRAINT_UNIQUE = 2067, SQLITE_CONSTRAINT_PRIMARYKEY = 1555
            matches!(db_err.code().as_deref(), Some("2067") | Some("1555"))
                || db_err.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(str_to_uuid(&uuid_to_str(id)).unwrap(), id);
        assert!(str_to_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn test_datetime_round_trip() {
        let now = now_str();
        let parsed = str_to_datetime(&now).unwrap();
        assert_eq!(parsed.to_rfc3339(), now);
        assert!(str_to_datetime("yesterday").is_err());
        assert_eq!(str_to_datetime_opt(None).unwrap(), None);
    }
}
