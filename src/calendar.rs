use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, SecondsFormat};

use crate::limits::*;
use crate::model::*;

/// Monday through Friday; the window ends at Saturday 00:00.
pub const WORK_WEEK_DAYS: i64 = 5;

/// How a client names the week it wants: any calendar date or instant in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeekReference {
    Date(NaiveDate),
    Instant(Ms),
}

impl FromStr for WeekReference {
    type Err = CalendarError;

    /// Accepts `YYYY-MM-DD`, RFC 3339, or integer Unix milliseconds.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            let midnight = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
            if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&midnight) {
                return Err(CalendarError::OutOfRange(midnight));
            }
            return Ok(WeekReference::Date(date));
        }
        parse_instant(s).map(WeekReference::Instant)
    }
}

/// Parse an RFC 3339 timestamp or integer Unix milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, CalendarError> {
    let s = s.trim();
    let ms = match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => dt.timestamp_millis(),
        Err(_) => s
            .parse::<Ms>()
            .map_err(|_| CalendarError::Parse(s.to_string()))?,
    };
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
        return Err(CalendarError::OutOfRange(ms));
    }
    Ok(ms)
}

/// Week windows and the slot grid for one site: a fixed UTC offset and a
/// slot width that evenly divides a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCalendar {
    offset: FixedOffset,
    slot_ms: Ms,
}

impl SlotCalendar {
    pub fn new(offset: FixedOffset, slot_ms: Ms) -> Result<Self, CalendarError> {
        if !(MIN_SLOT_MS..=MAX_SLOT_MS).contains(&slot_ms) || DAY_MS % slot_ms != 0 {
            return Err(CalendarError::SlotWidth(slot_ms));
        }
        Ok(Self { offset, slot_ms })
    }

    /// Build from minutes east of UTC and slot width in minutes.
    pub fn from_minutes(utc_offset_minutes: i32, slot_minutes: u32) -> Result<Self, CalendarError> {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(CalendarError::Offset(utc_offset_minutes))?;
        Self::new(offset, slot_minutes as Ms * MINUTE_MS)
    }

    pub fn slot_ms(&self) -> Ms {
        self.slot_ms
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// `[Monday 00:00, Saturday 00:00)` of the week containing `reference`.
    /// Time of day never changes the result.
    pub fn week_window(&self, reference: WeekReference) -> Result<Span, CalendarError> {
        let date = match reference {
            WeekReference::Date(d) => d,
            WeekReference::Instant(t) => self.local_date(t)?,
        };
        self.week_window_for_date(date)
    }

    pub fn week_window_for_date(&self, date: NaiveDate) -> Result<Span, CalendarError> {
        let back = Days::new(date.weekday().num_days_from_monday() as u64);
        let monday = date.checked_sub_days(back).ok_or(CalendarError::OutOfRange(MIN_VALID_TIMESTAMP_MS))?;
        let start = self.local_midnight_ms(monday);
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
            return Err(CalendarError::OutOfRange(start));
        }
        Ok(Span::new(start, start + WORK_WEEK_DAYS * DAY_MS))
    }

    /// The calendar date `t` falls on in this calendar's offset.
    pub fn local_date(&self, t: Ms) -> Result<NaiveDate, CalendarError> {
        let utc = DateTime::from_timestamp_millis(t).ok_or(CalendarError::OutOfRange(t))?;
        Ok(utc.with_timezone(&self.offset).date_naive())
    }

    /// RFC 3339 rendering of `t` in this calendar's offset.
    pub fn format(&self, t: Ms) -> Result<String, CalendarError> {
        let utc = DateTime::from_timestamp_millis(t).ok_or(CalendarError::OutOfRange(t))?;
        Ok(utc
            .with_timezone(&self.offset)
            .to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    fn local_midnight_ms(&self, date: NaiveDate) -> Ms {
        // A fixed offset maps every local time to exactly one instant
        let local = date.and_time(NaiveTime::MIN).and_utc().timestamp_millis();
        local - self.offset.local_minus_utc() as Ms * 1000
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    Parse(String),
    OutOfRange(Ms),
    SlotWidth(Ms),
    Offset(i32),
}

impl std::fmt::Display for CalendarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalendarError::Parse(s) => write!(f, "not a date, RFC 3339 timestamp or ms value: {s}"),
            CalendarError::OutOfRange(t) => write!(f, "timestamp out of range: {t}"),
            CalendarError::SlotWidth(ms) => {
                write!(f, "slot width {ms}ms must divide a day and be between {MIN_SLOT_MS}ms and {MAX_SLOT_MS}ms")
            }
            CalendarError::Offset(m) => write!(f, "invalid UTC offset: {m} minutes"),
        }
    }
}

impl std::error::Error for CalendarError {}
