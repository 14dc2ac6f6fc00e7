//! Wire encoding for symbol and trace timestamps.
//!
//! Timestamps travel as strings holding base64-encoded decimal
//! milliseconds since the Unix epoch. Time-range search buckets them to
//! UTC days so `time_gte`/`time_between` filters compare whole days.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};

/// Encode a UTC instant as base64("<millis>").
pub fn encode(ts: DateTime<Utc>) -> String {
    STANDARD.encode(ts.timestamp_millis().to_string())
}

/// Encode the current instant.
pub fn now() -> String {
    encode(Utc::now())
}

/// Decode a base64 millisecond stamp back to a UTC instant.
///
/// Returns `None` for anything that is not base64-wrapped decimal millis.
pub fn decode(stamp: &str) -> Option<DateTime<Utc>> {
    let raw = STANDARD.decode(stamp.as_bytes()).ok()?;
    let text = std::str::from_utf8(&raw).ok()?;
    let millis: i64 = text.trim().parse().ok()?;
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Days since the Unix epoch, UTC. The unit of time-range comparison.
pub fn utc_day(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis().div_euclid(86_400_000)
}

/// Decode a stamp straight to its UTC day bucket.
pub fn decode_day(stamp: &str) -> Option<i64> {
    decode(stamp).map(utc_day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let stamp = encode(ts);
        assert_eq!(decode(&stamp), Some(ts));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not-base64!").is_none());
        assert!(decode(&STANDARD.encode("not-a-number")).is_none());
        assert!(decode("").is_none());
    }

    #[test]
    fn day_bucketing_is_utc() {
        // 23:59 and 00:01 the next day land in adjacent buckets.
        let late = Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2024, 6, 16, 0, 1, 0).unwrap();
        assert_eq!(utc_day(early) - utc_day(late), 1);
    }

    #[test]
    fn same_day_same_bucket() {
        let a = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 1).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 6, 15, 23, 59, 59).unwrap();
        assert_eq!(utc_day(a), utc_day(b));
    }
}
