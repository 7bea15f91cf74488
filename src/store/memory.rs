use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{Event, NewReservation, Reservation, ReservationId};
use crate::wal::Wal;

use super::{ReservationStore, StoreError};

/// Reservations held in process, optionally journaled to a WAL file.
///
/// Also serves as the test double for the relational store: it counts list
/// queries and can be told to fail the next calls.
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<ReservationId, Reservation>,
    wal: Option<tokio::sync::Mutex<Wal>>,
    list_calls: AtomicUsize,
    injected: Mutex<VecDeque<StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the journal at `path` and keep appending to it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let rows = DashMap::new();
        for event in Wal::replay(path)? {
            if let Event::ReservationSaved { reservation } = event {
                rows.insert(reservation.id.clone(), reservation);
            }
        }
        Ok(Self {
            rows,
            wal: Some(tokio::sync::Mutex::new(Wal::open(path)?)),
            ..Self::default()
        })
    }

    pub fn with_reservations(reservations: impl IntoIterator<Item = Reservation>) -> Self {
        let store = Self::new();
        for r in reservations {
            store.rows.insert(r.id.clone(), r);
        }
        store
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make the next store call fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, err: StoreError) {
        if let Ok(mut q) = self.injected.lock() {
            q.push_back(err);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn take_injected(&self) -> Result<(), StoreError> {
        match self.injected.lock().ok().and_then(|mut q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Journal then apply. The journal lock is held across both so a
    /// compaction never snapshots rows older than its log.
    async fn persist(&self, reservation: &Reservation) -> Result<(), StoreError> {
        let _wal = match &self.wal {
            Some(wal) => {
                let mut wal = wal.lock().await;
                wal.append(&Event::ReservationSaved {
                    reservation: reservation.clone(),
                })?;
                Some(wal)
            }
            None => None,
        };
        self.rows.insert(reservation.id.clone(), reservation.clone());
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn list_active_on(
        &self,
        date: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Reservation>, StoreError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        let mut hits: Vec<Reservation> = self
            .rows
            .iter()
            .map(|e| e.value().clone())
            .filter(|r| r.date == date && r.is_active() && Some(r.id.as_str()) != exclude_id)
            .collect();
        hits.sort_by(|a, b| a.span.start.cmp(&b.span.start).then_with(|| a.id.cmp(&b.id)));
        Ok(hits)
    }

    async fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        self.take_injected()?;
        self.rows
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        self.take_injected()?;
        let reservation = Reservation {
            id: Ulid::new().to_string(),
            date: new.date,
            span: new.span,
            status: new.status,
            label: new.label,
            calendar_event_id: None,
        };
        self.persist(&reservation).await?;
        Ok(reservation)
    }

    async fn update(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.take_injected()?;
        if !self.rows.contains_key(&reservation.id) {
            return Err(StoreError::NotFound(reservation.id.clone()));
        }
        self.persist(reservation).await?;
        Ok(())
    }

    /// Rewrite the journal with one entry per reservation.
    async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal) = &self.wal else { return Ok(()) };
        let mut wal = wal.lock().await;
        let mut rows: Vec<Reservation> = self.rows.iter().map(|e| e.value().clone()).collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let events: Vec<Event> = rows
            .into_iter()
            .map(|reservation| Event::ReservationSaved { reservation })
            .collect();
        wal.compact(&events)?;
        Ok(())
    }
}
