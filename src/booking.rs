use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::checker::{CheckError, ConflictChecker};
use crate::model::{
    Availability, BookingStatus, CalendarOp, EventDraft, ModelError, NewReservation, OutboxState, Reservation,
    ReservationId, SlotRequest, Span, validate_rental_span,
};
use crate::outbox::{DrainReport, Outbox, OutboxError, apply_to_store};
use crate::store::{ReservationStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    Invalid(ModelError),
    /// The slot is taken, or could not be confirmed free.
    Unavailable(Availability),
    NotFound(ReservationId),
    NotActive(ReservationId),
    Store(StoreError),
    Outbox(OutboxError),
}

impl fmt::Display for BookingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookingError::Invalid(e) => write!(f, "invalid booking: {e}"),
            BookingError::Unavailable(a) => match a.fallback_error() {
                Some(err) => write!(f, "slot could not be confirmed free: {err}"),
                None => write!(
                    f,
                    "slot unavailable: {} conflict(s) from {}",
                    a.conflicts().len(),
                    a.source().as_str()
                ),
            },
            BookingError::NotFound(id) => write!(f, "booking not found: {id}"),
            BookingError::NotActive(id) => write!(f, "booking {id} is cancelled"),
            BookingError::Store(e) => write!(f, "{e}"),
            BookingError::Outbox(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BookingError {}

impl From<ModelError> for BookingError {
    fn from(e: ModelError) -> Self {
        BookingError::Invalid(e)
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => BookingError::NotFound(id),
            other => BookingError::Store(other),
        }
    }
}

impl From<CheckError> for BookingError {
    fn from(e: CheckError) -> Self {
        match e {
            CheckError::Invalid(e) => BookingError::Invalid(e),
            CheckError::Store(e) => BookingError::Store(e),
        }
    }
}

impl From<OutboxError> for BookingError {
    fn from(e: OutboxError) -> Self {
        BookingError::Outbox(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingOutcome {
    pub reservation: Reservation,
    /// The verdict the booking was admitted on, when a check ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<Availability>,
    /// State of the calendar mirror, when one was attempted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calendar: Option<OutboxState>,
}

/// Create, move and cancel reservations. The store write is the commit
/// point; the calendar follows through the outbox.
pub struct BookingService {
    checker: Arc<ConflictChecker>,
    store: Arc<dyn ReservationStore>,
    outbox: Arc<Outbox>,
}

impl BookingService {
    pub fn new(checker: Arc<ConflictChecker>, store: Arc<dyn ReservationStore>, outbox: Arc<Outbox>) -> Self {
        Self { checker, store, outbox }
    }

    pub fn checker(&self) -> &ConflictChecker {
        &self.checker
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    async fn admit(&self, request: SlotRequest) -> Result<Availability, BookingError> {
        let verdict = self.checker.check(&request).await?;
        if !verdict.is_available() {
            return Err(BookingError::Unavailable(verdict));
        }
        Ok(verdict)
    }

    pub async fn create(&self, new: NewReservation) -> Result<BookingOutcome, BookingError> {
        new.validate()?;
        let availability = self.admit(SlotRequest::new(new.date, new.span)).await?;
        let mut reservation = self.store.insert(new).await?;
        info!(id = %reservation.id, date = %reservation.date, span = %reservation.span, "booking created");

        let calendar = self.mirror(&mut reservation, |draft, _| CalendarOp::Create { draft }).await;
        Ok(BookingOutcome {
            reservation,
            availability: Some(availability),
            calendar,
        })
    }

    /// Move a booking, ignoring its own current slot when checking.
    pub async fn reschedule(&self, id: &str, date: NaiveDate, span: Span) -> Result<BookingOutcome, BookingError> {
        validate_rental_span(&span)?;
        let mut reservation = self.store.get(id).await?;
        if !reservation.is_active() {
            return Err(BookingError::NotActive(reservation.id));
        }
        let availability = self.admit(SlotRequest::new(date, span).excluding(id)).await?;

        reservation.date = date;
        reservation.span = span;
        self.store.update(&reservation).await?;
        info!(id, %date, %span, "booking rescheduled");

        let calendar = self.mirror(&mut reservation, upsert).await;
        Ok(BookingOutcome {
            reservation,
            availability: Some(availability),
            calendar,
        })
    }

    /// Cancel a booking and remove its calendar mirror. Cancelling twice is a no-op.
    pub async fn cancel(&self, id: &str) -> Result<BookingOutcome, BookingError> {
        let mut reservation = self.store.get(id).await?;
        if reservation.status == BookingStatus::Cancelled {
            return Ok(BookingOutcome {
                reservation,
                availability: None,
                calendar: None,
            });
        }
        reservation.status = BookingStatus::Cancelled;
        self.store.update(&reservation).await?;
        info!(id, "booking cancelled");

        let calendar = match reservation.calendar_event_id.clone() {
            Some(event_id) => self.mirror(&mut reservation, |_, _| CalendarOp::Delete { event_id }).await,
            None => {
                // Nothing landed yet; make sure a queued create never does.
                if let Err(e) = self.outbox.supersede(id).await {
                    warn!(id, "could not supersede queued calendar ops: {e}");
                }
                None
            }
        };
        Ok(BookingOutcome {
            reservation,
            availability: None,
            calendar,
        })
    }

    /// Change a booking's status. Reactivating a cancelled booking re-checks
    /// its slot and mirrors it again.
    pub async fn set_status(&self, id: &str, status: BookingStatus) -> Result<BookingOutcome, BookingError> {
        if status == BookingStatus::Cancelled {
            return self.cancel(id).await;
        }
        let mut reservation = self.store.get(id).await?;
        let reactivating = !reservation.is_active();
        let availability = if reactivating {
            let request = SlotRequest::new(reservation.date, reservation.span).excluding(id);
            Some(self.admit(request).await?)
        } else {
            None
        };

        reservation.status = status;
        self.store.update(&reservation).await?;
        info!(id, status = status.as_str(), "booking status changed");

        let calendar = if reactivating {
            self.mirror(&mut reservation, upsert).await
        } else {
            None
        };
        Ok(BookingOutcome {
            reservation,
            availability,
            calendar,
        })
    }

    /// Re-attempt failed calendar mirrors and record the resulting event ids.
    pub async fn drain_outbox(&self) -> Result<DrainReport, BookingError> {
        let report = self.outbox.drain().await?;
        apply_to_store(self.store.as_ref(), &report.settled).await?;
        Ok(report)
    }

    /// Journal and attempt a calendar op built from the reservation's draft.
    /// Best-effort: failures are logged and reported, never returned.
    async fn mirror(
        &self,
        reservation: &mut Reservation,
        op: impl FnOnce(EventDraft, Option<String>) -> CalendarOp,
    ) -> Option<OutboxState> {
        let settings = self.checker.settings();
        let draft = match EventDraft::for_reservation(
            reservation,
            self.checker.clock(),
            settings.buffer_before,
            settings.buffer_after,
        ) {
            Ok(d) => d,
            Err(e) => {
                warn!(id = %reservation.id, "cannot build calendar event: {e}");
                return None;
            }
        };
        let op = op(draft, reservation.calendar_event_id.clone());

        let entry = match self.outbox.record_and_attempt(&reservation.id, op).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(id = %reservation.id, "could not journal calendar operation: {e}");
                return None;
            }
        };
        if let OutboxState::Done { event_id } = &entry.state
            && reservation.calendar_event_id != *event_id
        {
            reservation.calendar_event_id = event_id.clone();
            if let Err(e) = self.store.update(reservation).await {
                warn!(id = %reservation.id, "could not store calendar event id: {e}");
            }
        }
        Some(entry.state)
    }
}

/// Update the mirrored event, or create one if the booking never got one.
fn upsert(draft: EventDraft, existing: Option<String>) -> CalendarOp {
    match existing {
        Some(event_id) => CalendarOp::Update { event_id, draft },
        None => CalendarOp::Create { draft },
    }
}
