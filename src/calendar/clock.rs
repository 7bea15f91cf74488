use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::{Minutes, Span};

use super::{CalendarError, TimeWindow};

/// Longest forward transition searched past. Real zones skip at most an hour
/// or two.
const MAX_GAP_MINUTES: i64 = 180;

/// Interprets wall-clock minutes in the single business timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessClock {
    tz: Tz,
}

impl Default for BusinessClock {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Vancouver,
        }
    }
}

impl BusinessClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn tz_name(&self) -> &'static str {
        self.tz.name()
    }

    fn local_midnight(date: NaiveDate) -> NaiveDateTime {
        date.and_time(chrono::NaiveTime::MIN)
    }

    /// The UTC instant of `minutes` past local midnight on `date`.
    /// An ambiguous wall time resolves to its earlier occurrence; a wall time
    /// skipped by a forward transition resolves to the first minute after it.
    pub fn instant(&self, date: NaiveDate, minutes: Minutes) -> Result<DateTime<Utc>, CalendarError> {
        let local = Self::local_midnight(date) + Duration::minutes(minutes);
        (0..=MAX_GAP_MINUTES)
            .find_map(|skip| {
                self.tz
                    .from_local_datetime(&(local + Duration::minutes(skip)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| CalendarError::InvalidTime(format!("{local} does not exist in {}", self.tz.name())))
    }

    /// The instant window covering `span` on `date`.
    pub fn window(&self, date: NaiveDate, span: &Span) -> Result<TimeWindow, CalendarError> {
        Ok(TimeWindow {
            start: self.instant(date, span.start)?,
            end: self.instant(date, span.end)?,
        })
    }

    /// Local midnight to the next local midnight, widened by `margin` on both sides.
    pub fn day_window(&self, date: NaiveDate, margin: Minutes) -> Result<TimeWindow, CalendarError> {
        let margin = margin.max(0);
        self.window(date, &Span::new(-margin, crate::limits::MINUTES_PER_DAY + margin))
    }

    fn offset_seconds(&self, date: NaiveDate, instant: DateTime<Utc>) -> i64 {
        let local = instant.with_timezone(&self.tz).naive_local();
        (local - Self::local_midnight(date)).num_seconds()
    }

    /// Wall-clock minutes of `[start, end)` relative to local midnight on `date`,
    /// rounded outward to whole minutes. `None` when the interval is empty.
    pub fn local_span(&self, date: NaiveDate, start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Span> {
        let s = self.offset_seconds(date, start).div_euclid(60);
        let e = (self.offset_seconds(date, end) + 59).div_euclid(60);
        Span::try_new(s, e).ok()
    }
}
