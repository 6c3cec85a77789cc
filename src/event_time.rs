//! Tolerant UTC normalization of offer event timestamps.
//!
//! Event timestamps arrive as text in mixed formats. Anything that cannot be
//! read as an instant normalizes to `None` instead of failing the batch.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Fixed UTC morning (7-9) and evening (17-19) demand windows.
pub const PEAK_HOURS_UTC: [u32; 6] = [7, 8, 9, 17, 18, 19];

// `%#z` also takes hour-only offsets such as `+07`.
const OFFSET_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%:z",
    "%Y-%m-%d %H:%M:%S%.f%#z",
    "%Y-%m-%dT%H:%M:%S%.f%#z",
];

const NAIVE_DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeParts {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
}

/// Parses `raw` into a UTC instant, trying each supported layout in turn.
pub fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(trimmed, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    let naive_text = strip_utc_suffix(trimmed);
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(naive_text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(naive_text, format) {
            return date
                .and_hms_opt(0, 0, 0)
                .map(|naive| Utc.from_utc_datetime(&naive));
        }
    }

    None
}

/// UTC hour of an ISO-like timestamp string, `None` when it does not parse.
pub fn robust_hour_of_iso_date(raw: &str) -> Option<u32> {
    parse_event_timestamp(raw).map(|ts| ts.hour())
}

pub fn time_parts(ts: &DateTime<Utc>) -> TimeParts {
    TimeParts {
        year: ts.year(),
        month: ts.month(),
        day: ts.day(),
        hour: ts.hour(),
        minute: ts.minute(),
    }
}

pub fn is_peak_hour(hour: Option<u32>) -> bool {
    hour.map(|h| PEAK_HOURS_UTC.contains(&h)).unwrap_or(false)
}

/// Canonical text form written back to the output table.
pub fn format_event_timestamp(ts: Option<&DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => ts.to_rfc3339(),
        None => String::new(),
    }
}

fn strip_utc_suffix(text: &str) -> &str {
    let stripped = text
        .strip_suffix(" UTC")
        .or_else(|| text.strip_suffix("UTC"))
        .or_else(|| text.strip_suffix('Z'))
        .or_else(|| text.strip_suffix('z'))
        .unwrap_or(text);
    stripped.trim_end()
}
