use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MAX_LABEL_LEN, MIN_RENTAL_MINUTES, MINUTES_PER_DAY};

/// Minutes since local midnight of the business day. Calendar events that
/// straddle midnight map to negative values or values past `MINUTES_PER_DAY`.
pub type Minutes = i64;

pub type ReservationId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidTime(String),
    InvalidDate(String),
    EmptySpan { start: Minutes, end: Minutes },
    TooShort { minutes: Minutes, min: Minutes },
    InvalidStatus(String),
    LabelTooLong(usize),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidTime(s) => write!(f, "invalid time of day: {s:?} (expected HH:MM)"),
            ModelError::InvalidDate(s) => write!(f, "invalid date: {s:?} (expected YYYY-MM-DD)"),
            ModelError::EmptySpan { start, end } => write!(
                f,
                "end time {} must be after start time {}",
                format_minutes(*end),
                format_minutes(*start)
            ),
            ModelError::TooShort { minutes, min } => {
                write!(f, "rental of {minutes} minutes is shorter than the {min} minute minimum")
            }
            ModelError::InvalidStatus(s) => write!(f, "invalid booking status: {s:?}"),
            ModelError::LabelTooLong(len) => {
                write!(f, "label of {len} bytes exceeds {MAX_LABEL_LEN}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn try_new(start: Minutes, end: Minutes) -> Result<Self, ModelError> {
        if end <= start {
            return Err(ModelError::EmptySpan { start, end });
        }
        Ok(Self { start, end })
    }

    /// Parse a pair of wall-clock strings into a span.
    pub fn parse(start: &str, end: &str) -> Result<Self, ModelError> {
        Self::try_new(parse_time_of_day(start)?, parse_time_of_day(end)?)
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Widen by setup time before and teardown time after.
    pub fn padded(&self, before: Minutes, after: Minutes) -> Span {
        Span::new(self.start - before.max(0), self.end + after.max(0))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_minutes(self.start), format_minutes(self.end))
    }
}

/// Parse `H:MM`, `HH:MM` or `HH:MM:SS` into minutes since midnight.
/// Seconds are validated and then dropped.
pub fn parse_time_of_day(s: &str) -> Result<Minutes, ModelError> {
    let invalid = || ModelError::InvalidTime(s.to_string());
    let mut parts = s.trim().split(':');
    let hours = parts.next().ok_or_else(invalid)?;
    let minutes = parts.next().ok_or_else(invalid)?;
    let seconds = parts.next();
    if parts.next().is_some() {
        return Err(invalid());
    }

    let field = |text: &str, max: Minutes, widths: &[usize]| -> Result<Minutes, ModelError> {
        if !widths.contains(&text.len()) || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: Minutes = text.parse().map_err(|_| invalid())?;
        if value > max {
            return Err(invalid());
        }
        Ok(value)
    };

    let h = field(hours, 23, &[1, 2])?;
    let m = field(minutes, 59, &[2])?;
    if let Some(sec) = seconds {
        field(sec, 59, &[2])?;
    }
    Ok(h * 60 + m)
}

/// Render minutes as `HH:MM`, with a day suffix outside the business day.
pub fn format_minutes(m: Minutes) -> String {
    let day = m.div_euclid(MINUTES_PER_DAY);
    let rem = m.rem_euclid(MINUTES_PER_DAY);
    let (h, min) = (rem / 60, rem % 60);
    if day == 0 {
        format!("{h:02}:{min:02}")
    } else {
        format!("{h:02}:{min:02}{day:+}d")
    }
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ModelError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| ModelError::InvalidDate(s.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }

    /// Cancelled reservations never participate in conflict checks.
    pub fn blocks_slot(&self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            _ => Err(ModelError::InvalidStatus(s.to_string())),
        }
    }
}

/// A reservation row as the relational store keeps it: exact times, no buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub label: Option<String>,
    /// Mirrored calendar event. Best-effort: may be absent or stale.
    pub calendar_event_id: Option<String>,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status.blocks_slot()
    }
}

/// Input for creating a reservation; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub label: Option<String>,
}

impl NewReservation {
    pub fn pending(date: NaiveDate, span: Span, label: Option<String>) -> Self {
        Self {
            date,
            span,
            status: BookingStatus::Pending,
            label,
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        validate_rental_span(&self.span)?;
        if let Some(ref l) = self.label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(ModelError::LabelTooLong(l.len()));
        }
        Ok(())
    }
}

pub fn validate_rental_span(span: &Span) -> Result<(), ModelError> {
    if span.end <= span.start {
        return Err(ModelError::EmptySpan {
            start: span.start,
            end: span.end,
        });
    }
    if span.duration() < MIN_RENTAL_MINUTES {
        return Err(ModelError::TooShort {
            minutes: span.duration(),
            min: MIN_RENTAL_MINUTES,
        });
    }
    Ok(())
}

/// "Is `[date, span)` free?", optionally ignoring one reservation being edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub date: NaiveDate,
    pub span: Span,
    pub exclude_id: Option<ReservationId>,
}

impl SlotRequest {
    pub fn new(date: NaiveDate, span: Span) -> Self {
        Self {
            date,
            span,
            exclude_id: None,
        }
    }

    pub fn parse(date: &str, start: &str, end: &str) -> Result<Self, ModelError> {
        Ok(Self::new(parse_date(date)?, Span::parse(start, end)?))
    }

    pub fn excluding(mut self, id: impl Into<ReservationId>) -> Self {
        self.exclude_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Confirmed,
    Tentative,
    Cancelled,
}

/// An event on the external calendar. Third-party holds have no reservation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub summary: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: EventStatus,
    pub reservation_id: Option<ReservationId>,
}

/// What the calendar should hold for one reservation: buffered, timezone-tagged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDraft {
    pub summary: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub time_zone: String,
    pub reservation_id: ReservationId,
    pub buffer_before: Minutes,
    pub buffer_after: Minutes,
}

/// Which data source produced an availability verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Database,
    Calendar,
    DatabaseFallback,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Database => "database",
            Source::Calendar => "calendar",
            Source::DatabaseFallback => "database_fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub label: Option<String>,
    pub span: Span,
    pub reservation_id: Option<ReservationId>,
}

/// Tagged availability verdict. Provenance is part of the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Availability {
    /// Both sources agree the slot is free.
    Available,
    ConflictFromDb { conflicts: Vec<Conflict> },
    ConflictFromCalendar { conflicts: Vec<Conflict> },
    /// Calendar unreachable; database said free and the policy favors availability.
    AvailableFallback { error: String },
    /// Calendar unreachable; database said free but the policy fails closed.
    UnavailableFallback { error: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Availability::Available | Availability::AvailableFallback { .. })
    }

    pub fn source(&self) -> Source {
        match self {
            Availability::ConflictFromDb { .. } => Source::Database,
            Availability::Available | Availability::ConflictFromCalendar { .. } => Source::Calendar,
            Availability::AvailableFallback { .. } | Availability::UnavailableFallback { .. } => {
                Source::DatabaseFallback
            }
        }
    }

    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            Availability::ConflictFromDb { conflicts } | Availability::ConflictFromCalendar { conflicts } => {
                conflicts
            }
            _ => &[],
        }
    }

    pub fn fallback_error(&self) -> Option<&str> {
        match self {
            Availability::AvailableFallback { error } | Availability::UnavailableFallback { error } => {
                Some(error)
            }
            _ => None,
        }
    }
}

// ── Outbox ───────────────────────────────────────────────────────

/// An intended calendar mutation, journaled before it is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarOp {
    Create { draft: EventDraft },
    Update { event_id: String, draft: EventDraft },
    Delete { event_id: String },
}

impl CalendarOp {
    pub fn label(&self) -> &'static str {
        match self {
            CalendarOp::Create { .. } => "create",
            CalendarOp::Update { .. } => "update",
            CalendarOp::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxState {
    Pending,
    /// Applied. `event_id` is the calendar event now mirroring the reservation, if any.
    Done { event_id: Option<String> },
    Failed { error: String },
    /// A later operation for the same reservation replaced this one before it landed.
    Superseded,
}

impl OutboxState {
    pub fn is_settled(&self) -> bool {
        matches!(self, OutboxState::Done { .. } | OutboxState::Superseded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Ulid,
    pub reservation_id: ReservationId,
    pub op: CalendarOp,
    pub state: OutboxState,
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationSaved {
        reservation: Reservation,
    },
    OutboxRecorded {
        entry: OutboxEntry,
    },
    OutboxSettled {
        id: Ulid,
        state: OutboxState,
        attempts: u32,
    },
}
