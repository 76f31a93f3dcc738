//! Conversion between wall-clock strings in the display timezone and UTC
//! instants.
//!
//! The offset at an instant is measured by rendering the instant in the
//! target zone and taking the difference of the two readings. `to_utc`
//! treats the wall-clock fields as a provisional UTC instant, measures the
//! offset there and subtracts it; if the offset at the corrected instant
//! differs (the provisional reading sat on the other side of a DST switch)
//! the second offset is used instead.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::model::Ms;

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];
const DISPLAY_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed local timestamp: {0:?}")]
    Malformed(String),
    #[error("instant out of representable range: {0}")]
    OutOfRange(Ms),
}

/// Parse `YYYY-MM-DDTHH:MM` (optionally `:SS`, which is dropped).
///
/// Blank input is `Ok(None)`: the value is intentionally absent. Anything
/// else that does not parse is an error.
pub fn parse_local(input: &str) -> Result<Option<NaiveDateTime>, CodecError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    for format in LOCAL_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Some(truncate_to_minute(parsed)));
        }
    }
    Err(CodecError::Malformed(trimmed.to_string()))
}

pub fn format_local(local: &NaiveDateTime) -> String {
    local.format(DISPLAY_FORMAT).to_string()
}

/// Offset of `tz` from UTC at `instant`, in milliseconds (local minus UTC).
pub fn offset_at(instant: Ms, tz: Tz) -> Result<Ms, CodecError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(instant).ok_or(CodecError::OutOfRange(instant))?;
    let local_reading = utc.with_timezone(&tz).naive_local().and_utc().timestamp_millis();
    Ok(local_reading - instant)
}

/// Wall-clock fields in `tz` to a UTC instant.
///
/// Wall times inside a spring-forward gap do not exist; they land one gap
/// length later. Wall times repeated by a fall-back switch resolve to one of
/// their two instants, both of which render back to the same fields.
pub fn to_utc(local: &NaiveDateTime, tz: Tz) -> Result<Ms, CodecError> {
    let provisional = local.and_utc().timestamp_millis();
    let first = offset_at(provisional, tz)?;
    let candidate = provisional - first;
    let second = offset_at(candidate, tz)?;
    if second == first {
        Ok(candidate)
    } else {
        Ok(provisional - second)
    }
}

/// UTC instant to wall-clock fields in `tz`, truncated to the minute.
pub fn to_local(instant: Ms, tz: Tz) -> Result<NaiveDateTime, CodecError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(instant).ok_or(CodecError::OutOfRange(instant))?;
    Ok(truncate_to_minute(utc.with_timezone(&tz).naive_local()))
}

/// Parse and convert in one step. Blank input is `Ok(None)`.
pub fn local_str_to_utc(input: &str, tz: Tz) -> Result<Option<Ms>, CodecError> {
    parse_local(input)?.map(|local| to_utc(&local, tz)).transpose()
}

pub fn utc_to_local_str(instant: Ms, tz: Tz) -> Result<String, CodecError> {
    to_local(instant, tz).map(|local| format_local(&local))
}

fn truncate_to_minute(value: NaiveDateTime) -> NaiveDateTime {
    value
        .with_second(0)
        .and_then(|v| v.with_nanosecond(0))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MADRID: Tz = chrono_tz::Europe::Madrid;
    const H: Ms = 3_600_000;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Ms {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp_millis()
    }

    fn round_trip(input: &str) -> String {
        let instant = local_str_to_utc(input, MADRID).unwrap().unwrap();
        utc_to_local_str(instant, MADRID).unwrap()
    }

    #[test]
    fn blank_is_absent_not_error() {
        assert_eq!(parse_local(""), Ok(None));
        assert_eq!(parse_local("   "), Ok(None));
    }

    #[test]
    fn malformed_inputs_fail() {
        for bad in ["2024-13-01T10:00", "2024-02-30T10:00", "2024-01-01", "tomorrow", "2024-01-01T25:00", "2024-ab-01T10:00"] {
            assert!(
                matches!(parse_local(bad), Err(CodecError::Malformed(_))),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn seconds_are_dropped() {
        let parsed = parse_local("2024-05-10T09:15:42").unwrap().unwrap();
        assert_eq!(format_local(&parsed), "2024-05-10T09:15");
    }

    #[test]
    fn winter_and_summer_offsets() {
        assert_eq!(offset_at(utc(2024, 1, 15, 12, 0), MADRID).unwrap(), H);
        assert_eq!(offset_at(utc(2024, 7, 15, 12, 0), MADRID).unwrap(), 2 * H);
    }

    #[test]
    fn to_utc_plain_days() {
        assert_eq!(local_str_to_utc("2024-01-15T09:00", MADRID).unwrap(), Some(utc(2024, 1, 15, 8, 0)));
        assert_eq!(local_str_to_utc("2024-07-15T09:00", MADRID).unwrap(), Some(utc(2024, 7, 15, 7, 0)));
    }

    #[test]
    fn spring_forward_day() {
        // 2024-03-31: 02:00 CET jumps to 03:00 CEST at 01:00 UTC.
        assert_eq!(local_str_to_utc("2024-03-31T01:30", MADRID).unwrap(), Some(utc(2024, 3, 31, 0, 30)));
        assert_eq!(local_str_to_utc("2024-03-31T03:30", MADRID).unwrap(), Some(utc(2024, 3, 31, 1, 30)));
        assert_eq!(local_str_to_utc("2024-03-31T10:00", MADRID).unwrap(), Some(utc(2024, 3, 31, 8, 0)));
    }

    #[test]
    fn spring_forward_gap_lands_after_switch() {
        let instant = local_str_to_utc("2024-03-31T02:30", MADRID).unwrap().unwrap();
        assert_eq!(instant, utc(2024, 3, 31, 1, 30));
        assert_eq!(utc_to_local_str(instant, MADRID).unwrap(), "2024-03-31T03:30");
    }

    #[test]
    fn fall_back_day() {
        // 2024-10-27: 03:00 CEST falls back to 02:00 CET at 01:00 UTC.
        assert_eq!(local_str_to_utc("2024-10-27T01:30", MADRID).unwrap(), Some(utc(2024, 10, 26, 23, 30)));
        assert_eq!(local_str_to_utc("2024-10-27T03:30", MADRID).unwrap(), Some(utc(2024, 10, 27, 2, 30)));
    }

    #[test]
    fn both_repeated_readings_render_alike() {
        let first = utc(2024, 10, 27, 0, 30);
        let second = utc(2024, 10, 27, 1, 30);
        assert_eq!(utc_to_local_str(first, MADRID).unwrap(), "2024-10-27T02:30");
        assert_eq!(utc_to_local_str(second, MADRID).unwrap(), "2024-10-27T02:30");
        // Encoding the shared reading yields only one of them.
        assert_eq!(local_str_to_utc("2024-10-27T02:30", MADRID).unwrap(), Some(second));
    }

    #[test]
    fn round_trip_across_dst_boundaries() {
        for input in [
            "2024-03-30T23:59",
            "2024-03-31T00:00",
            "2024-03-31T01:59",
            "2024-03-31T03:00",
            "2024-03-31T12:45",
            "2024-10-26T23:00",
            "2024-10-27T01:59",
            "2024-10-27T02:00",
            "2024-10-27T02:30",
            "2024-10-27T03:00",
            "2024-10-27T18:20",
        ] {
            assert_eq!(round_trip(input), input);
        }
    }

    #[test]
    fn round_trip_other_zone() {
        let tz: Tz = chrono_tz::America::New_York;
        let instant = local_str_to_utc("2024-11-03T09:00", tz).unwrap().unwrap();
        assert_eq!(utc_to_local_str(instant, tz).unwrap(), "2024-11-03T09:00");
    }

    #[test]
    fn to_local_truncates_seconds() {
        let instant = utc(2024, 1, 15, 8, 0) + 42_000;
        assert_eq!(utc_to_local_str(instant, MADRID).unwrap(), "2024-01-15T09:00");
    }

    #[test]
    fn out_of_range_instant() {
        assert!(matches!(to_local(Ms::MAX, MADRID), Err(CodecError::OutOfRange(_))));
    }
}
