use chrono::{Duration, NaiveDateTime, TimeZone, Utc};

pub const XMLTV_DATETIME_FMT: &str = "%Y%m%d%H%M%S";

/// One XMLTV timestamp, parsed. The wall digits and the numeric offset are
/// kept apart so the original rendering can be reproduced bit-exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XmltvTimestamp {
    pub wall: NaiveDateTime,
    pub offset_minutes: i32,
    pub utc_ms: i64,
}

/// Parses `YYYYMMDDhhmmss` optionally followed by whitespace and `+HHMM`,
/// `-HHMM` or `Z`. A missing offset is treated as UTC.
pub fn parse_xmltv_timestamp(raw: &str) -> Option<XmltvTimestamp> {
    let trimmed = raw.trim();
    if trimmed.len() < 14 || !trimmed.is_char_boundary(14) {
        return None;
    }
    let (digits, rest) = trimmed.split_at(14);
    let wall = NaiveDateTime::parse_from_str(digits, XMLTV_DATETIME_FMT).ok()?;
    let offset_minutes = parse_offset(rest.trim())?;
    let utc = wall - Duration::minutes(i64::from(offset_minutes));
    Some(XmltvTimestamp {
        wall,
        offset_minutes,
        utc_ms: Utc.from_utc_datetime(&utc).timestamp_millis(),
    })
}

fn parse_offset(tz_part: &str) -> Option<i32> {
    if tz_part.is_empty() || tz_part == "Z" {
        return Some(0);
    }
    if tz_part.len() != 5 {
        return None;
    }
    let sign = match &tz_part[0..1] {
        "-" => -1,
        "+" => 1,
        _ => return None,
    };
    let hours: i32 = tz_part[1..3].parse().ok()?;
    let mins: i32 = tz_part[3..5].parse().ok()?;
    Some(sign * (hours * 60 + mins))
}

pub fn format_offset(offset_minutes: i32) -> String {
    let sign = if offset_minutes < 0 { '-' } else { '+' };
    let abs = offset_minutes.abs();
    let hours = abs / 60;
    let mins = abs % 60;
    format!("{sign}{hours:02}{mins:02}")
}

pub fn format_xmltv(wall: &NaiveDateTime, offset_minutes: i32) -> String {
    format!("{} {}", wall.format(XMLTV_DATETIME_FMT), format_offset(offset_minutes))
}

/// Rewrites the numeric offset of an XMLTV timestamp to `+0000` without
/// touching the wall digits.
pub fn with_zero_offset(raw: &str) -> String {
    let trimmed = raw.trim();
    let digits = if trimmed.len() >= 14 && trimmed.is_char_boundary(14) {
        &trimmed[..14]
    } else {
        trimmed
    };
    format!("{digits} +0000")
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
