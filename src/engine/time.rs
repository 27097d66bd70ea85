use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc};

use crate::model::Ms;

/// Wall-clock formats accepted for reservation times, read in office time.
const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// An office's wall clock: a fixed offset from UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfficeClock {
    offset: FixedOffset,
}

impl Default for OfficeClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl OfficeClock {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// `None` when the offset is a day or more.
    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        let seconds = minutes.checked_mul(60)?;
        FixedOffset::east_opt(seconds).map(|offset| Self { offset })
    }

    /// Parse a client-supplied instant: unix milliseconds, RFC 3339, or a
    /// naive wall-clock time in this office.
    pub fn parse_instant(&self, raw: &str) -> Option<Ms> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw.parse().ok();
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.timestamp_millis());
        }
        NAIVE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .and_then(|naive| self.local_ms(naive))
    }

    pub fn parse_date(&self, raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
    }

    fn local_ms(&self, naive: NaiveDateTime) -> Option<Ms> {
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp_millis())
    }

    /// `hour:minute` on `date`, office time.
    pub fn at(&self, date: NaiveDate, hour: u32, minute: u32) -> Option<Ms> {
        self.local_ms(date.and_hms_opt(hour, minute, 0)?)
    }

    /// 00:00:00 and 23:59:59 of `date`.
    pub fn day_bounds(&self, date: NaiveDate) -> Option<(Ms, Ms)> {
        let start = self.at(date, 0, 0)?;
        let end = self.local_ms(date.and_hms_opt(23, 59, 59)?)?;
        Some((start, end))
    }

    /// Human form used in notification text, e.g. `06 Jan 2025, 10:00`.
    pub fn format(&self, ms: Ms) -> String {
        match DateTime::from_timestamp_millis(ms) {
            Some(utc) => utc.with_timezone(&self.offset).format("%d %b %Y, %H:%M").to_string(),
            None => ms.to_string(),
        }
    }

    pub fn to_rfc3339(&self, ms: Ms) -> String {
        match DateTime::from_timestamp_millis(ms) {
            Some(utc) => utc
                .with_timezone(&self.offset)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            None => ms.to_string(),
        }
    }
}
