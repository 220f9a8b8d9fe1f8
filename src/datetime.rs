//! Datetime parsing and formatting for `type = "datetime"` columns.
//!
//! Column formats are written in the application style used by the source
//! schema (`Y-m-d`, `d/m/Y H:i`), not strftime. [`to_strftime`] translates
//! them; a format that already contains `%` is passed through unchanged.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Storage format for watermarks and `--since` values.
pub const WATERMARK_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a stored datetime value into UTC.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]`, `YYYY-MM-DDTHH:MM:SS`,
/// a bare `YYYY-MM-DD` (midnight), and integer Unix timestamps.
pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        Value::String(s) => parse_datetime_str(s),
        _ => None,
    }
}

pub fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Translate an application-style format (`Y-m-d H:i:s`) into a strftime string.
///
/// Backslash escapes the next character. Unknown letters are copied literally.
pub fn to_strftime(format: &str) -> String {
    if format.contains('%') {
        return format.to_string();
    }

    let mut out = String::with_capacity(format.len() * 2);
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        let mapped = match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                continue;
            }
            'Y' => "%Y",
            'y' => "%y",
            'm' => "%m",
            'n' => "%-m",
            'd' => "%d",
            'j' => "%-d",
            'H' => "%H",
            'G' => "%-H",
            'h' => "%I",
            'g' => "%-I",
            'i' => "%M",
            's' => "%S",
            'A' => "%p",
            'a' => "%P",
            'D' => "%a",
            'l' => "%A",
            'M' => "%b",
            'F' => "%B",
            'N' => "%u",
            'w' => "%w",
            'z' => "%j",
            'U' => "%s",
            'e' | 'T' => "%Z",
            'P' => "%:z",
            'O' => "%z",
            'c' => "%Y-%m-%dT%H:%M:%S%:z",
            other => {
                out.push(other);
                continue;
            }
        };
        out.push_str(mapped);
    }

    out
}

/// Format a stored datetime value with an application-style format.
///
/// Returns `None` when the value cannot be parsed as a datetime or the format
/// contains an invalid strftime specifier.
pub fn format_value(value: &Value, format: &str) -> Option<String> {
    use std::fmt::Write;

    let dt = parse_datetime(value)?;
    let mut out = String::new();
    write!(out, "{}", dt.format(&to_strftime(format))).ok()?;
    Some(out)
}

pub fn format_watermark(dt: DateTime<Utc>) -> String {
    dt.format(WATERMARK_FORMAT).to_string()
}

/// Human-friendly distance from `then` to `now`: "just now", "5 minutes ago", "2 days ago".
pub fn humanize_since(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds();
    let (amount, unit, future) = if secs < 0 {
        let (a, u) = bucket(-secs);
        (a, u, true)
    } else {
        let (a, u) = bucket(secs);
        (a, u, false)
    };

    if amount == 0 {
        return "just now".to_string();
    }

    let plural = if amount == 1 { "" } else { "s" };
    if future {
        format!("{} {}{} from now", amount, unit, plural)
    } else {
        format!("{} {}{} ago", amount, unit, plural)
    }
}

fn bucket(secs: i64) -> (i64, &'static str) {
    match secs {
        s if s < 1 => (0, "second"),
        s if s < 60 => (s, "second"),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 86_400 * 30 => (s / 86_400, "day"),
        s if s < 86_400 * 365 => (s / (86_400 * 30), "month"),
        s => (s / (86_400 * 365), "year"),
    }
}
