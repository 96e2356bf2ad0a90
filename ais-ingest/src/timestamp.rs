//! Lenient parsing of the observation time carried in stream metadata.
//!
//! The feed has used several encodings over time: epoch seconds, epoch milliseconds, RFC 3339,
//! and a `2024-01-01 12:00:00.123456789 +0000 UTC` layout. Anything else is treated as
//! unknown, never as "now".
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Epoch values below this are seconds, at or above it milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e12;

pub fn parse_observed_at(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => from_epoch(number.as_f64()?),
        Value::String(text) => parse_text(text.trim()),
        _ => None,
    }
}

fn from_epoch(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }

    let millis = if raw < EPOCH_MILLIS_THRESHOLD {
        raw * 1000.0
    } else {
        raw
    };

    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn parse_text(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }

    if let Ok(raw) = text.parse::<f64>() {
        return from_epoch(raw);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    let text = text.strip_suffix(" UTC").unwrap_or(text);
    if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(parsed.with_timezone(&Utc));
    }

    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    DateTime::parse_from_rfc2822(text)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn millis(value: Value) -> Option<i64> {
        parse_observed_at(&value).map(|at| at.timestamp_millis())
    }

    #[test]
    fn test_epoch_seconds_and_millis() {
        assert_eq!(millis(json!(1_700_000_000)), Some(1_700_000_000_000));
        assert_eq!(millis(json!(1_700_000_000_123i64)), Some(1_700_000_000_123));
        assert_eq!(millis(json!(1_700_000_000.5)), Some(1_700_000_000_500));
        assert_eq!(millis(json!("1700000000")), Some(1_700_000_000_000));
    }

    #[test]
    fn test_feed_layout() {
        assert_eq!(
            millis(json!("2023-11-14 22:13:20.123456789 +0000 UTC")),
            Some(1_700_000_000_123)
        );
        assert_eq!(
            millis(json!("2023-11-14 22:13:20 +0000 UTC")),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_rfc3339_and_naive() {
        assert_eq!(
            millis(json!("2023-11-14T22:13:20.123Z")),
            Some(1_700_000_000_123)
        );
        assert_eq!(
            millis(json!("2023-11-15T00:13:20+02:00")),
            Some(1_700_000_000_000)
        );
        assert_eq!(millis(json!("2023-11-14 22:13:20")), Some(1_700_000_000_000));
    }

    #[test]
    fn test_unparsable_is_unknown() {
        assert_eq!(millis(json!("yesterday-ish")), None);
        assert_eq!(millis(json!("")), None);
        assert_eq!(millis(json!(null)), None);
        assert_eq!(millis(json!(-5)), None);
        assert_eq!(millis(json!({"seconds": 1})), None);
    }
}
