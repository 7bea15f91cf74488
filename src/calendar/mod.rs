//! The external calendar: events that mirror reservations, plus third-party holds.

mod clock;
mod memory;

pub use clock::BusinessClock;
pub use memory::MemoryCalendar;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use ulid::Ulid;

use crate::model::{CalendarEvent, EventDraft, EventStatus, Minutes, Reservation};
use crate::retry::RetryClassify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarError {
    /// The request never got an HTTP answer.
    Transport { code: Option<String>, message: String },
    Http { status: u16, message: String },
    NotFound(String),
    /// A wall-clock time that does not exist in the business timezone.
    InvalidTime(String),
}

impl fmt::Display for CalendarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarError::Transport { code: Some(code), message } => {
                write!(f, "calendar unreachable ({code}): {message}")
            }
            CalendarError::Transport { code: None, message } => write!(f, "calendar unreachable: {message}"),
            CalendarError::Http { status, message } => write!(f, "calendar returned {status}: {message}"),
            CalendarError::NotFound(id) => write!(f, "calendar event not found: {id}"),
            CalendarError::InvalidTime(msg) => write!(f, "invalid local time: {msg}"),
        }
    }
}

impl std::error::Error for CalendarError {}

impl RetryClassify for CalendarError {
    fn code(&self) -> Option<&str> {
        match self {
            CalendarError::Transport { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    fn http_status(&self) -> Option<u16> {
        match self {
            CalendarError::Http { status, .. } => Some(*status),
            CalendarError::NotFound(_) => Some(404),
            _ => None,
        }
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

/// `[start, end)` in absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Every event overlapping `window`, including cancelled ones.
    async fn list_events(&self, window: &TimeWindow) -> Result<Vec<CalendarEvent>, CalendarError>;

    async fn insert_event(&self, draft: &EventDraft) -> Result<CalendarEvent, CalendarError>;

    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> Result<CalendarEvent, CalendarError>;

    async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError>;

    /// The live event correlated to `reservation_id`, searched within `window`.
    async fn find_event_for_reservation(
        &self,
        reservation_id: &str,
        window: &TimeWindow,
    ) -> Result<Option<CalendarEvent>, CalendarError> {
        let events = self.list_events(window).await?;
        Ok(events.into_iter().find(|e| {
            e.status != EventStatus::Cancelled && e.reservation_id.as_deref() == Some(reservation_id)
        }))
    }
}

impl EventDraft {
    /// The calendar event mirroring `reservation`: padded by the setup and
    /// teardown buffers and tagged with the business timezone.
    pub fn for_reservation(
        reservation: &Reservation,
        clock: &BusinessClock,
        buffer_before: Minutes,
        buffer_after: Minutes,
    ) -> Result<Self, CalendarError> {
        let padded = reservation.span.padded(buffer_before, buffer_after);
        let window = clock.window(reservation.date, &padded)?;
        let summary = match &reservation.label {
            Some(label) => format!("Rental: {label}"),
            None => format!("Rental {}", reservation.id),
        };
        Ok(Self {
            summary,
            start: window.start,
            end: window.end,
            time_zone: clock.tz_name().to_string(),
            reservation_id: reservation.id.clone(),
            buffer_before: buffer_before.max(0),
            buffer_after: buffer_after.max(0),
        })
    }
}

/// Stand-in for a deployment without calendar credentials: reads see an
/// empty calendar and writes succeed with mock ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCalendar;

#[async_trait]
impl CalendarService for DisabledCalendar {
    async fn list_events(&self, _window: &TimeWindow) -> Result<Vec<CalendarEvent>, CalendarError> {
        warn!("calendar integration disabled, treating calendar as empty");
        Ok(Vec::new())
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
        warn!(reservation_id = %draft.reservation_id, "calendar integration disabled, skipping event creation");
        Ok(CalendarEvent {
            id: format!("mock-event-{}", Ulid::new()),
            summary: Some(draft.summary.clone()),
            start: draft.start,
            end: draft.end,
            status: EventStatus::Confirmed,
            reservation_id: Some(draft.reservation_id.clone()),
        })
    }

    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
        warn!(event_id, "calendar integration disabled, skipping event update");
        Ok(CalendarEvent {
            id: event_id.to_string(),
            summary: Some(draft.summary.clone()),
            start: draft.start,
            end: draft.end,
            status: EventStatus::Confirmed,
            reservation_id: Some(draft.reservation_id.clone()),
        })
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError> {
        warn!(event_id, "calendar integration disabled, skipping event deletion");
        Ok(())
    }
}
