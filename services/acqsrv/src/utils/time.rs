//! Time utilities
//!
//! Consistent timestamp handling: bus payloads carry ISO-8601 UTC with
//! millisecond precision, internal bookkeeping uses epoch milliseconds.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC timestamp formatted for bus payloads
///
/// Millisecond precision with a `Z` suffix, e.g. `2024-05-01T12:00:00.123Z`.
pub fn bus_timestamp() -> String {
    format_bus_timestamp(Utc::now())
}

/// Format an existing timestamp for bus payloads
pub fn format_bus_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current epoch time in milliseconds
pub fn epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_timestamp_shape() {
        let ts = bus_timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2024-05-01T12:00:00.123Z".len());
    }

    #[test]
    fn test_format_is_stable() {
        let ts = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_bus_timestamp(ts), "2024-05-01T12:00:00.123Z");
    }
}
