//! Dual-source availability: the reservation store first, then the calendar.

pub mod availability;
mod conflict;


use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::calendar::{BusinessClock, CalendarError, CalendarService, TimeWindow};
use crate::limits::{DEFAULT_BUFFER_AFTER, DEFAULT_BUFFER_BEFORE, MINUTES_PER_DAY};
use crate::model::{Availability, CalendarEvent, Conflict, Minutes, ModelError, Reservation, SlotRequest, Source, Span};
use crate::observability::{AVAILABILITY_CHECKS_TOTAL, CALENDAR_FALLBACKS_TOTAL, CHECK_DURATION_SECONDS};
use crate::retry::predicates::{
    Predicate, any, database_temporary_errors, http_5xx_errors, network_errors, rate_limit_errors,
};
use crate::retry::{Retry, RetryPolicy};
use crate::store::{ReservationStore, StoreError};

/// What to answer when the database says free but the calendar cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarFailurePolicy {
    /// Trust the database alone. Risks a double booking.
    #[default]
    FavorAvailability,
    /// Refuse the slot until the calendar can confirm it.
    FailClosed,
}

impl CalendarFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalendarFailurePolicy::FavorAvailability => "allow",
            CalendarFailurePolicy::FailClosed => "block",
        }
    }
}

impl FromStr for CalendarFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "favor_availability" => Ok(CalendarFailurePolicy::FavorAvailability),
            "block" | "fail_closed" => Ok(CalendarFailurePolicy::FailClosed),
            other => Err(format!("unknown calendar failure policy {other:?} (expected allow or block)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckerSettings {
    pub buffer_before: Minutes,
    pub buffer_after: Minutes,
    pub on_calendar_failure: CalendarFailurePolicy,
    pub store_retry: RetryPolicy,
    pub calendar_retry: RetryPolicy,
}

impl Default for CheckerSettings {
    fn default() -> Self {
        Self {
            buffer_before: DEFAULT_BUFFER_BEFORE,
            buffer_after: DEFAULT_BUFFER_AFTER,
            on_calendar_failure: CalendarFailurePolicy::default(),
            store_retry: RetryPolicy::default(),
            calendar_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    Invalid(ModelError),
    /// The database leg failed after retries. There is no answer without it.
    Store(StoreError),
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::Invalid(e) => write!(f, "invalid request: {e}"),
            CheckError::Store(e) => write!(f, "availability check failed: {e}"),
        }
    }
}

impl std::error::Error for CheckError {}

impl From<ModelError> for CheckError {
    fn from(e: ModelError) -> Self {
        CheckError::Invalid(e)
    }
}

impl From<StoreError> for CheckError {
    fn from(e: StoreError) -> Self {
        CheckError::Store(e)
    }
}

/// Free time on one day, with the same provenance rules as a point check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FreeWindows {
    pub date: NaiveDate,
    pub windows: Vec<Span>,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ConflictChecker {
    store: Arc<dyn ReservationStore>,
    calendar: Arc<dyn CalendarService>,
    clock: BusinessClock,
    settings: CheckerSettings,
}

impl ConflictChecker {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        calendar: Arc<dyn CalendarService>,
        clock: BusinessClock,
        settings: CheckerSettings,
    ) -> Self {
        Self {
            store,
            calendar,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &CheckerSettings {
        &self.settings
    }

    pub fn clock(&self) -> &BusinessClock {
        &self.clock
    }

    /// Is `[date, start, end)` free?
    ///
    /// A database conflict answers immediately and the calendar is never
    /// read. Otherwise the buffered request is compared with the day's
    /// calendar events; if that read fails the configured
    /// [`CalendarFailurePolicy`] decides, and the verdict says so.
    pub async fn check(&self, request: &SlotRequest) -> Result<Availability, CheckError> {
        let started = std::time::Instant::now();
        Span::try_new(request.span.start, request.span.end)?;

        let db = self.check_database(request).await?;
        let verdict = if !db.is_empty() {
            debug!(date = %request.date, span = %request.span, conflicts = db.len(), "database conflict");
            Availability::ConflictFromDb { conflicts: db }
        } else {
            match self.check_calendar(request).await {
                Ok(conflicts) if conflicts.is_empty() => Availability::Available,
                Ok(conflicts) => Availability::ConflictFromCalendar { conflicts },
                Err(e) => self.on_calendar_failure(&e),
            }
        };

        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "source" => verdict.source().as_str()).increment(1);
        metrics::histogram!(CHECK_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            date = %request.date,
            span = %request.span,
            available = verdict.is_available(),
            source = verdict.source().as_str(),
            "availability checked"
        );
        Ok(verdict)
    }

    /// Database leg alone: exact times, no buffers.
    pub async fn check_database(&self, request: &SlotRequest) -> Result<Vec<Conflict>, StoreError> {
        let rows = self.active_reservations(request.date, request.exclude_id.as_deref()).await?;
        Ok(conflict::database_conflicts(&request.span, &rows))
    }

    /// Calendar leg alone: the request padded by the buffers.
    pub async fn check_calendar(&self, request: &SlotRequest) -> Result<Vec<Conflict>, CalendarError> {
        let padded = request.span.padded(self.settings.buffer_before, self.settings.buffer_after);
        let events = self.calendar_events(request.date, &padded).await?;
        Ok(conflict::calendar_conflicts(
            request.date,
            &padded,
            &events,
            &self.clock,
            request.exclude_id.as_deref(),
        ))
    }

    /// Sub-windows of `open` on `date` where a booking of at least
    /// `min_duration` would pass [`check`](Self::check).
    pub async fn free_windows(
        &self,
        date: NaiveDate,
        open: Span,
        min_duration: Minutes,
    ) -> Result<FreeWindows, CheckError> {
        let open = Span::try_new(open.start, open.end)?;
        let (before, after) = (self.settings.buffer_before, self.settings.buffer_after);

        let mut busy: Vec<Span> = self
            .active_reservations(date, None)
            .await?
            .iter()
            .map(|r| r.span)
            .collect();

        let (source, error) = match self.calendar_events(date, &open.padded(before, after)).await {
            Ok(events) => {
                // A request starting within `after` of an event's end, or ending
                // within `before` of its start, would collide once padded.
                busy.extend(
                    events
                        .iter()
                        .filter_map(|e| conflict::event_span(date, e, &self.clock, None))
                        .map(|s| s.padded(after, before)),
                );
                (Source::Calendar, None)
            }
            Err(e) => {
                let verdict = self.on_calendar_failure(&e);
                if !verdict.is_available() {
                    return Ok(FreeWindows {
                        date,
                        windows: Vec::new(),
                        source: Source::DatabaseFallback,
                        error: Some(e.to_string()),
                    });
                }
                (Source::DatabaseFallback, Some(e.to_string()))
            }
        };

        Ok(FreeWindows {
            date,
            windows: availability::free_windows(&open, &busy, min_duration),
            source,
            error,
        })
    }

    async fn active_reservations(
        &self,
        date: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let transient: [Predicate<StoreError>; 2] = [network_errors, database_temporary_errors];
        Retry::new(self.settings.store_retry)
            .named("store.list_active_on")
            .should_retry(any(transient))
            .run(|| self.store.list_active_on(date, exclude_id))
            .await
    }

    /// Events overlapping `span` on `date`, never narrower than the whole local day.
    async fn calendar_events(&self, date: NaiveDate, span: &Span) -> Result<Vec<CalendarEvent>, CalendarError> {
        let window: TimeWindow = self
            .clock
            .window(date, &Span::new(span.start.min(0), span.end.max(MINUTES_PER_DAY)))?;
        let transient: [Predicate<CalendarError>; 3] = [network_errors, http_5xx_errors, rate_limit_errors];
        Retry::new(self.settings.calendar_retry)
            .named("calendar.list_events")
            .should_retry(any(transient))
            .run(|| self.calendar.list_events(&window))
            .await
    }

    fn on_calendar_failure(&self, err: &CalendarError) -> Availability {
        let policy = self.settings.on_calendar_failure;
        warn!(
            error = %err,
            policy = policy.as_str(),
            "calendar check failed, using database result"
        );
        metrics::counter!(CALENDAR_FALLBACKS_TOTAL, "policy" => policy.as_str()).increment(1);
        match policy {
            CalendarFailurePolicy::FavorAvailability => Availability::AvailableFallback { error: err.to_string() },
            CalendarFailurePolicy::FailClosed => Availability::UnavailableFallback { error: err.to_string() },
        }
    }
}
