mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::model::{NewReservation, Reservation, ReservationId};
use crate::retry::RetryClassify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(ReservationId),
    /// Could not reach the database at all.
    Unavailable { code: Option<String>, message: String },
    /// The database answered with an error; `code` is the SQLSTATE when known.
    Query { code: Option<String>, message: String },
    /// A row or journal entry that does not decode into a reservation.
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "reservation not found: {id}"),
            StoreError::Unavailable { message, .. } => write!(f, "store unavailable: {message}"),
            StoreError::Query { code: Some(code), message } => write!(f, "store error [{code}]: {message}"),
            StoreError::Query { code: None, message } => write!(f, "store error: {message}"),
            StoreError::Corrupt(msg) => write!(f, "corrupt reservation data: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl RetryClassify for StoreError {
    fn code(&self) -> Option<&str> {
        match self {
            StoreError::Unavailable { code, .. } | StoreError::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    fn message(&self) -> String {
        self.to_string()
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Query {
            code: crate::retry::predicates::io_error_code(e.kind()).map(str::to_string),
            message: format!("journal: {e}"),
        }
    }
}

/// The relational source of truth for reservations.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Non-cancelled reservations on exactly `date`, minus `exclude_id`.
    async fn list_active_on(
        &self,
        date: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Reservation>, StoreError>;

    async fn get(&self, id: &str) -> Result<Reservation, StoreError>;

    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    /// Overwrite every mutable field of an existing reservation.
    async fn update(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Shrink a local journal, if the store keeps one.
    async fn compact(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
