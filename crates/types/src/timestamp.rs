//! The shifted-timestamp codec.
//!
//! Wall-clock time maps to a 64-bit integer packed as
//! `(seconds << 20) + microsecond_remainder`. Big-endian byte comparison of
//! the packed form preserves chronological ordering for post-epoch times,
//! which makes it usable directly as the intra-object sort key. Pre-epoch
//! times are legal but lossy at sub-second precision.

use chrono::DateTime;

use crate::types::Timestamp;

/// Bit offset of the seconds component in a shifted timestamp.
pub const SECONDS_BIT_OFFSET: u32 = 20;

/// Mask of the microsecond-remainder component.
const USEC_MASK: i64 = (1 << SECONDS_BIT_OFFSET) - 1;

/// Converts wall-clock time into a shifted timestamp.
///
/// Division truncates toward zero, so pre-epoch times with a fractional
/// second produce a negative remainder. Sub-microsecond precision is
/// discarded.
pub fn shift_time(value: Timestamp) -> i64 {
    let micros = value.timestamp_micros();
    let sec = micros / 1_000_000;
    let usec = micros % 1_000_000;
    (sec << SECONDS_BIT_OFFSET) + usec
}

/// Converts wall-clock time into the big-endian byte form used as the
/// event addressing prefix.
pub fn shift_time_bytes(value: Timestamp) -> [u8; 8] {
    (shift_time(value) as u64).to_be_bytes()
}

/// Converts a shifted timestamp back into wall-clock time.
pub fn unshift_time(value: i64) -> Timestamp {
    let usec = value & USEC_MASK;
    let sec = value >> SECONDS_BIT_OFFSET;
    DateTime::from_timestamp(sec, (usec * 1_000) as u32).unwrap_or_default()
}

/// Converts a big-endian shifted timestamp back into wall-clock time.
pub fn unshift_time_bytes(value: [u8; 8]) -> Timestamp {
    unshift_time(u64::from_be_bytes(value) as i64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use proptest::prelude::*;

    fn parse(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_shift() {
        assert_eq!(shift_time(parse("1970-01-01T00:00:00Z")), 0);
        assert_eq!(shift_time(parse("1970-01-01T00:00:01Z")), 0x100000);
        assert_eq!(shift_time(parse("1969-12-31T23:59:59Z")), -0x100000);
        assert_eq!(shift_time(parse("1970-01-01T00:00:01.5Z")), 0x17a120);
    }

    #[test]
    fn test_unshift() {
        assert_eq!(unshift_time(0), parse("1970-01-01T00:00:00Z"));
        assert_eq!(unshift_time(0x100000), parse("1970-01-01T00:00:01Z"));
        assert_eq!(unshift_time(-0x100000), parse("1969-12-31T23:59:59Z"));
        assert_eq!(unshift_time(0x17a120), parse("1970-01-01T00:00:01.5Z"));
    }

    #[test]
    fn test_byte_form_round_trip() {
        let t = parse("2012-01-01T02:00:00.123456Z");
        assert_eq!(unshift_time_bytes(shift_time_bytes(t)), t);
    }

    #[test]
    fn test_sub_microsecond_precision_discarded() {
        let a = parse("2012-01-01T02:00:00.123456111Z");
        let b = parse("2012-01-01T02:00:00.123456222Z");
        assert_eq!(shift_time(a), shift_time(b));
        assert_eq!(unshift_time(shift_time(a)), parse("2012-01-01T02:00:00.123456Z"));
    }

    proptest! {
        // Round trip holds for all post-epoch times at microsecond
        // resolution (through the year 5138).
        #[test]
        fn prop_round_trip_micros(micros in 0i64..100_000_000_000_000_000) {
            let t = DateTime::from_timestamp_micros(micros).unwrap();
            prop_assert_eq!(unshift_time(shift_time(t)), t);
        }

        // Byte ordering matches chronological ordering post-epoch.
        #[test]
        fn prop_byte_order(a in 0i64..1_000_000_000_000_000, b in 0i64..1_000_000_000_000_000) {
            let ta = DateTime::from_timestamp_micros(a).unwrap();
            let tb = DateTime::from_timestamp_micros(b).unwrap();
            let (ba, bb) = (shift_time_bytes(ta), shift_time_bytes(tb));
            prop_assert_eq!(a.cmp(&b), ba.cmp(&bb));
        }
    }
}
