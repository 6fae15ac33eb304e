//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Timestamp as milliseconds since the Unix epoch (persisted expiration format)
pub fn to_epoch_millis(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

/// Parse epoch milliseconds back into a timestamp
///
/// Returns None for values chrono cannot represent.
pub fn from_epoch_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// File-name-safe timestamp: `YYYY-MM-DD-HH-MM-SS`
pub fn file_stamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d-%H-%M-%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_now_returns_recent_timestamp() {
        let timestamp = now();
        assert!(timestamp.timestamp() > 946_684_800); // 2000-01-01 00:00:00 UTC
        assert!(timestamp.timestamp() < 4_102_444_800); // 2100-01-01 00:00:00 UTC
    }

    #[test]
    fn test_millis_to_duration() {
        assert_eq!(millis_to_duration(0), Duration::ZERO);
        assert_eq!(millis_to_duration(500), Duration::from_millis(500));
        assert_eq!(millis_to_duration(10_000), Duration::from_secs(10));
    }

    #[test]
    fn test_epoch_millis_roundtrip_keeps_millisecond_precision() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
            + chrono::Duration::milliseconds(123);
        let millis = to_epoch_millis(ts);
        assert_eq!(millis, 1_709_294_400_123);
        assert_eq!(from_epoch_millis(millis), Some(ts));
    }

    #[test]
    fn test_from_epoch_millis_out_of_range() {
        assert_eq!(from_epoch_millis(i64::MAX), None);
    }

    #[test]
    fn test_file_stamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 12, 31, 23, 5, 9).unwrap();
        assert_eq!(file_stamp(ts), "2024-12-31-23-05-09");
    }
}
