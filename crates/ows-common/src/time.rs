//! Timestamp handling for layer dates and index queries.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// The ISO format used across the index protocol and coverage filenames,
/// millisecond precision with a literal Z: `2020-01-15T00:00:00.000Z`.
pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp in the wire format.
pub fn format_iso(t: &DateTime<Utc>) -> String {
    t.format(ISO_FORMAT).to_string()
}

/// Parse a timestamp. Accepts the millisecond wire format as well as
/// second-precision and RFC 3339 variants seen from older clients.
pub fn parse_iso(s: &str) -> Result<DateTime<Utc>, TimeParseError> {
    let s = s.trim();
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, ISO_FORMAT) {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ") {
        return Ok(Utc.from_utc_datetime(&ndt));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    Err(TimeParseError::InvalidFormat(s.to_string()))
}

/// Most recent timestamp of an ascending date list, used to resolve an
/// absent `time` parameter.
pub fn latest_date(dates: &[String]) -> Result<DateTime<Utc>, TimeParseError> {
    let last = dates.last().ok_or(TimeParseError::NoDates)?;
    parse_iso(last)
}

#[derive(Debug, Error)]
pub enum TimeParseError {
    #[error("Invalid time format: {0}")]
    InvalidFormat(String),

    #[error("Layer has no dates")]
    NoDates,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_wire_format_roundtrip() {
        let t = parse_iso("2020-01-15T00:00:00.000Z").unwrap();
        assert_eq!(format_iso(&t), "2020-01-15T00:00:00.000Z");
    }

    #[test]
    fn test_parse_second_precision() {
        let t = parse_iso("2020-01-15T12:30:00Z").unwrap();
        assert_eq!(t.hour(), 12);
        assert_eq!(t.minute(), 30);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_iso("not-a-date").is_err());
    }

    #[test]
    fn test_latest_date() {
        let dates = vec![
            "2020-01-01T00:00:00.000Z".to_string(),
            "2020-01-15T00:00:00.000Z".to_string(),
        ];
        let t = latest_date(&dates).unwrap();
        assert_eq!(format_iso(&t), "2020-01-15T00:00:00.000Z");
        assert!(latest_date(&[]).is_err());
    }
}
