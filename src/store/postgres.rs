use std::io;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Timelike};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info};
use ulid::Ulid;

use crate::model::{BookingStatus, Minutes, NewReservation, Reservation, Span};
use crate::retry::predicates::io_error_code;

use super::{ReservationStore, StoreError};

const MIGRATION: &str = include_str!("../../migrations/0001_reservations.sql");

const COLUMNS: &str = "id, event_date, start_time, end_time, status, label, calendar_event_id";

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(state) = e.code() {
            return StoreError::Query {
                code: Some(state.code().to_string()),
                message: e.to_string(),
            };
        }
        let io_code = std::error::Error::source(&e)
            .and_then(|s| s.downcast_ref::<io::Error>())
            .and_then(|io| io_error_code(io.kind()));
        if e.is_closed() || io_code.is_some() {
            return StoreError::Unavailable {
                code: io_code.map(str::to_string),
                message: e.to_string(),
            };
        }
        StoreError::Query {
            code: None,
            message: e.to_string(),
        }
    }
}

fn to_time(m: Minutes) -> Result<NaiveTime, StoreError> {
    u32::try_from(m * 60)
        .ok()
        .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, 0))
        .ok_or_else(|| StoreError::Corrupt(format!("minute offset {m} is not a time of day")))
}

fn from_time(t: NaiveTime) -> Minutes {
    Minutes::from(t.num_seconds_from_midnight() / 60)
}

fn row_to_reservation(row: &Row) -> Result<Reservation, StoreError> {
    let id: String = row.try_get("id")?;
    let start: NaiveTime = row.try_get("start_time")?;
    let end: NaiveTime = row.try_get("end_time")?;
    let status: String = row.try_get("status")?;
    let span = Span::try_new(from_time(start), from_time(end))
        .map_err(|e| StoreError::Corrupt(format!("{id}: {e}")))?;
    let status = status
        .parse::<BookingStatus>()
        .map_err(|e| StoreError::Corrupt(format!("{id}: {e}")))?;
    Ok(Reservation {
        date: row.try_get("event_date")?,
        span,
        status,
        label: row.try_get("label")?,
        calendar_event_id: row.try_get("calendar_event_id")?,
        id,
    })
}

/// Reservations in a Postgres `reservations` table.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    /// Connect and drive the connection on a background task.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });
        info!("connected to postgres");
        Ok(Self { client })
    }

    /// Create the table and index if they are missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.client.batch_execute(MIGRATION).await?;
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for PgStore {
    async fn list_active_on(
        &self,
        date: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM reservations \
             WHERE event_date = $1 AND status <> 'cancelled' \
             AND ($2::text IS NULL OR id <> $2) \
             ORDER BY start_time, id"
        );
        let rows = self.client.query(&sql, &[&date, &exclude_id]).await?;
        rows.iter().map(row_to_reservation).collect()
    }

    async fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM reservations WHERE id = $1");
        match self.client.query_opt(&sql, &[&id]).await? {
            Some(row) => row_to_reservation(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let reservation = Reservation {
            id: Ulid::new().to_string(),
            date: new.date,
            span: new.span,
            status: new.status,
            label: new.label,
            calendar_event_id: None,
        };
        self.client
            .execute(
                "INSERT INTO reservations (id, event_date, start_time, end_time, status, label) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &reservation.id,
                    &reservation.date,
                    &to_time(reservation.span.start)?,
                    &to_time(reservation.span.end)?,
                    &reservation.status.as_str(),
                    &reservation.label,
                ],
            )
            .await?;
        Ok(reservation)
    }

    async fn update(&self, r: &Reservation) -> Result<(), StoreError> {
        let n = self
            .client
            .execute(
                "UPDATE reservations SET event_date = $2, start_time = $3, end_time = $4, \
                 status = $5, label = $6, calendar_event_id = $7, updated_at = now() \
                 WHERE id = $1",
                &[
                    &r.id,
                    &r.date,
                    &to_time(r.span.start)?,
                    &to_time(r.span.end)?,
                    &r.status.as_str(),
                    &r.label,
                    &r.calendar_event_id,
                ],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::NotFound(r.id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_map_onto_time_of_day() {
        assert_eq!(to_time(0).unwrap(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(to_time(14 * 60 + 30).unwrap(), NaiveTime::from_hms_opt(14, 30, 0).unwrap());
        assert_eq!(from_time(NaiveTime::from_hms_opt(18, 5, 59).unwrap()), 18 * 60 + 5);
        assert!(matches!(to_time(-1), Err(StoreError::Corrupt(_))));
        assert!(matches!(to_time(24 * 60), Err(StoreError::Corrupt(_))));
    }
}
