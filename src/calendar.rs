use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Ms, Span};

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;
pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalendarError {
    #[error("bad time of day '{0}': expected HH:mm")]
    BadTimeFormat(String),
    #[error("time of day out of range: {0}")]
    OutOfRange(String),
}

/// Local time of day with minute precision, stored as minutes since midnight.
/// `24:00` is accepted so a window can end at the close of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        Self::from_minutes(hour * 60 + minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = CalendarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (h, m) = trimmed
            .split_once(':')
            .ok_or_else(|| CalendarError::BadTimeFormat(s.to_string()))?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(CalendarError::BadTimeFormat(s.to_string()));
        }
        let hour: u16 = h
            .parse()
            .map_err(|_| CalendarError::BadTimeFormat(s.to_string()))?;
        let minute: u16 = m
            .parse()
            .map_err(|_| CalendarError::BadTimeFormat(s.to_string()))?;
        if hour > 24 || (hour == 24 && minute != 0) {
            return Err(CalendarError::OutOfRange(s.to_string()));
        }
        Self::from_hm(hour, minute).ok_or_else(|| CalendarError::OutOfRange(s.to_string()))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Weekday of a date, 0 = Sunday .. 6 = Saturday.
pub fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Instant of local midnight for `date` at a fixed UTC offset.
pub fn local_midnight(date: NaiveDate, utc_offset_min: i32) -> Ms {
    let utc_midnight = date.and_time(NaiveTime::default()).and_utc().timestamp_millis();
    utc_midnight - Ms::from(utc_offset_min) * MINUTE_MS
}

/// The local calendar day `[midnight, next midnight)` as an absolute span.
pub fn local_day_span(date: NaiveDate, utc_offset_min: i32) -> Span {
    let start = local_midnight(date, utc_offset_min);
    Span::new(start, start + DAY_MS)
}

/// Local date that contains `instant`.
pub fn local_date(instant: Ms, utc_offset_min: i32) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(instant + Ms::from(utc_offset_min) * MINUTE_MS)
        .map(|dt| dt.date_naive())
}

/// Absolute span of a local time-of-day window on `date`.
pub fn window_on(date: NaiveDate, utc_offset_min: i32, start: TimeOfDay, end: TimeOfDay) -> Span {
    let midnight = local_midnight(date, utc_offset_min);
    Span::new(
        midnight + Ms::from(start.minutes()) * MINUTE_MS,
        midnight + Ms::from(end.minutes()) * MINUTE_MS,
    )
}

/// First instant of the UTC calendar month containing `now`.
pub fn month_start(now: Ms) -> Ms {
    DateTime::from_timestamp_millis(now)
        .and_then(|dt| dt.date_naive().with_day(1))
        .map_or(now, |first| local_midnight(first, 0))
}

/// Floor an instant to whole-minute precision.
pub fn floor_to_minute(instant: Ms) -> Ms {
    instant.div_euclid(MINUTE_MS) * MINUTE_MS
}
