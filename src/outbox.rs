//! Calendar side effects, journaled before they are attempted.
//!
//! A booking never waits on the calendar being right. Each intended
//! mutation is recorded, attempted once through the retry wrapper, and left
//! `Failed` for the dispatcher to re-attempt if the calendar said no.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::calendar::{CalendarError, CalendarService};
use crate::limits::{DISPATCH_TICKS_PER_COMPACTION, MAX_OUTBOX_ATTEMPTS};
use crate::model::{CalendarOp, Event, OutboxEntry, OutboxState};
use crate::observability::OUTBOX_ENTRIES_TOTAL;
use crate::retry::predicates::{Predicate, any, http_5xx_errors, network_errors, rate_limit_errors};
use crate::retry::{Retry, RetryPolicy};
use crate::store::{ReservationStore, StoreError};
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    NotFound(Ulid),
    Journal(String),
}

impl fmt::Display for OutboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboxError::NotFound(id) => write!(f, "outbox entry not found: {id}"),
            OutboxError::Journal(e) => write!(f, "outbox journal error: {e}"),
        }
    }
}

impl std::error::Error for OutboxError {}

impl From<io::Error> for OutboxError {
    fn from(e: io::Error) -> Self {
        OutboxError::Journal(e.to_string())
    }
}

/// Result of one pass over the unsettled entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    /// Entries that failed again and reached the attempt cap.
    pub gave_up: usize,
    /// Entries this pass moved to `Done`.
    pub settled: Vec<OutboxEntry>,
}

pub struct Outbox {
    entries: DashMap<Ulid, OutboxEntry>,
    wal: Option<tokio::sync::Mutex<Wal>>,
    /// Held while an entry changes state, so a supersede and a landing
    /// attempt cannot interleave.
    settling: tokio::sync::Mutex<()>,
    calendar: Arc<dyn CalendarService>,
    retry: RetryPolicy,
    shutdown: Option<CancellationToken>,
}

impl Outbox {
    /// In-memory outbox; entries do not survive a restart.
    pub fn new(calendar: Arc<dyn CalendarService>, retry: RetryPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            wal: None,
            settling: tokio::sync::Mutex::new(()),
            calendar,
            retry,
            shutdown: None,
        }
    }

    /// Outbox journaled at `path`, restoring whatever was recorded there.
    pub fn open(path: &Path, calendar: Arc<dyn CalendarService>, retry: RetryPolicy) -> io::Result<Self> {
        let entries = DashMap::new();
        for event in Wal::replay(path)? {
            match event {
                Event::OutboxRecorded { entry } => {
                    entries.insert(entry.id, entry);
                }
                Event::OutboxSettled { id, state, attempts } => {
                    if let Some(mut e) = entries.get_mut(&id) {
                        e.state = state;
                        e.attempts = attempts;
                    }
                }
                Event::ReservationSaved { .. } => {}
            }
        }
        info!(path = %path.display(), entries = entries.len(), "outbox journal replayed");
        Ok(Self {
            entries,
            wal: Some(tokio::sync::Mutex::new(Wal::open(path)?)),
            settling: tokio::sync::Mutex::new(()),
            calendar,
            retry,
            shutdown: None,
        })
    }

    /// Abandon retry waits once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    async fn journal(&self, event: &Event) -> Result<(), OutboxError> {
        if let Some(wal) = &self.wal {
            wal.lock().await.append(event)?;
        }
        Ok(())
    }

    /// Move `id` to `state` if `may_leave` accepts its current state. Runs
    /// under the settling lock; `None` when the transition was refused.
    async fn settle_if(
        &self,
        id: Ulid,
        state: OutboxState,
        attempts: u32,
        may_leave: fn(&OutboxState) -> bool,
    ) -> Result<Option<OutboxEntry>, OutboxError> {
        let _settling = self.settling.lock().await;
        let current = self.get(id).ok_or(OutboxError::NotFound(id))?;
        if !may_leave(&current.state) {
            return Ok(None);
        }
        self.journal(&Event::OutboxSettled {
            id,
            state: state.clone(),
            attempts,
        })
        .await?;
        let mut entry = self.entries.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        entry.state = state;
        entry.attempts = attempts;
        Ok(Some(entry.value().clone()))
    }

    async fn append(&self, reservation_id: &str, op: CalendarOp) -> Result<OutboxEntry, OutboxError> {
        let entry = OutboxEntry {
            id: Ulid::new(),
            reservation_id: reservation_id.to_string(),
            op,
            state: OutboxState::Pending,
            attempts: 0,
            recorded_at: Utc::now(),
        };
        {
            let _settling = self.settling.lock().await;
            self.journal(&Event::OutboxRecorded { entry: entry.clone() }).await?;
            self.entries.insert(entry.id, entry.clone());
        }
        debug!(id = %entry.id, reservation_id, op = entry.op.label(), "outbox entry recorded");
        Ok(entry)
    }

    /// Journal the intent to apply `op` for `reservation_id`. Earlier
    /// unsettled entries for the same reservation are superseded.
    pub async fn record(&self, reservation_id: &str, op: CalendarOp) -> Result<OutboxEntry, OutboxError> {
        self.supersede(reservation_id).await?;
        self.append(reservation_id, op).await
    }

    /// Mark every unsettled entry for `reservation_id` as superseded.
    pub async fn supersede(&self, reservation_id: &str) -> Result<usize, OutboxError> {
        let stale: Vec<(Ulid, u32)> = self
            .entries
            .iter()
            .filter(|e| e.reservation_id == reservation_id && !e.state.is_settled())
            .map(|e| (e.id, e.attempts))
            .collect();
        let mut superseded = 0;
        for (id, attempts) in stale {
            if self
                .settle_if(id, OutboxState::Superseded, attempts, |s| !s.is_settled())
                .await?
                .is_some()
            {
                superseded += 1;
            }
        }
        Ok(superseded)
    }

    /// Apply one entry against the calendar. Calendar errors end up in the
    /// entry's state, never in the returned `Result`.
    ///
    /// An entry superseded while its call was in flight stays superseded, and
    /// an event the call created is deleted again.
    pub async fn attempt(&self, id: Ulid) -> Result<OutboxEntry, OutboxError> {
        let entry = self.get(id).ok_or(OutboxError::NotFound(id))?;
        if entry.state.is_settled() {
            return Ok(entry);
        }

        let attempts = entry.attempts + 1;
        let state = self.run(&entry, attempts).await;
        let created = match (&state, &entry.op) {
            (OutboxState::Done { event_id: Some(new) }, CalendarOp::Update { event_id: old, .. }) if new == old => None,
            (OutboxState::Done { event_id: Some(new) }, _) => Some(new.clone()),
            _ => None,
        };

        if let Some(settled) = self.settle_if(id, state, attempts, |s| *s != OutboxState::Superseded).await? {
            return Ok(settled);
        }
        if let Some(event_id) = created {
            warn!(%id, reservation_id = %entry.reservation_id, event_id, "superseded while in flight, removing created event");
            let undo = self.append(&entry.reservation_id, CalendarOp::Delete { event_id }).await?;
            let state = self.run(&undo, 1).await;
            self.settle_if(undo.id, state, 1, |s| !s.is_settled()).await?;
        }
        self.get(id).ok_or(OutboxError::NotFound(id))
    }

    async fn run(&self, entry: &OutboxEntry, attempts: u32) -> OutboxState {
        let (id, op) = (entry.id, entry.op.label());
        match self.execute(&entry.op).await {
            Ok(event_id) => {
                info!(%id, reservation_id = %entry.reservation_id, op, event_id = ?event_id, "calendar mirrored");
                metrics::counter!(OUTBOX_ENTRIES_TOTAL, "op" => op, "outcome" => "done").increment(1);
                OutboxState::Done { event_id }
            }
            Err(e) => {
                warn!(%id, reservation_id = %entry.reservation_id, op, attempts, error = %e, "calendar mirror failed");
                metrics::counter!(OUTBOX_ENTRIES_TOTAL, "op" => op, "outcome" => "failed").increment(1);
                OutboxState::Failed { error: e.to_string() }
            }
        }
    }

    pub async fn record_and_attempt(&self, reservation_id: &str, op: CalendarOp) -> Result<OutboxEntry, OutboxError> {
        let entry = self.record(reservation_id, op).await?;
        self.attempt(entry.id).await
    }

    async fn call<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, CalendarError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CalendarError>>,
    {
        let transient: [Predicate<CalendarError>; 3] = [network_errors, http_5xx_errors, rate_limit_errors];
        let mut retry = Retry::new(self.retry).named(operation).should_retry(any(transient));
        if let Some(token) = &self.shutdown {
            retry = retry.cancel_on(token.clone());
        }
        retry.run(op).await
    }

    /// Returns the id of the event mirroring the reservation afterwards.
    async fn execute(&self, op: &CalendarOp) -> Result<Option<String>, CalendarError> {
        match op {
            CalendarOp::Create { draft } => {
                let event = self.call("calendar.insert_event", || self.calendar.insert_event(draft)).await?;
                Ok(Some(event.id))
            }
            CalendarOp::Update { event_id, draft } => {
                match self
                    .call("calendar.update_event", || self.calendar.update_event(event_id, draft))
                    .await
                {
                    Ok(event) => Ok(Some(event.id)),
                    Err(CalendarError::NotFound(_)) => {
                        warn!(event_id, "mirrored event is gone, creating a new one");
                        let event = self.call("calendar.insert_event", || self.calendar.insert_event(draft)).await?;
                        Ok(Some(event.id))
                    }
                    Err(e) => Err(e),
                }
            }
            CalendarOp::Delete { event_id } => {
                match self.call("calendar.delete_event", || self.calendar.delete_event(event_id)).await {
                    Ok(()) | Err(CalendarError::NotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }

    pub fn get(&self, id: Ulid) -> Option<OutboxEntry> {
        self.entries.get(&id).map(|e| e.value().clone())
    }

    fn snapshot(&self, keep: impl Fn(&OutboxEntry) -> bool) -> Vec<OutboxEntry> {
        let mut out: Vec<OutboxEntry> = self
            .entries
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    pub fn pending(&self) -> Vec<OutboxEntry> {
        self.snapshot(|e| e.state == OutboxState::Pending)
    }

    pub fn failed(&self) -> Vec<OutboxEntry> {
        self.snapshot(|e| matches!(e.state, OutboxState::Failed { .. }))
    }

    pub fn entries_for(&self, reservation_id: &str) -> Vec<OutboxEntry> {
        self.snapshot(|e| e.reservation_id == reservation_id)
    }

    /// Attempt every pending or failed entry still under the attempt cap, oldest first.
    pub async fn drain(&self) -> Result<DrainReport, OutboxError> {
        let due = self.snapshot(|e| !e.state.is_settled() && e.attempts < MAX_OUTBOX_ATTEMPTS);
        let mut report = DrainReport::default();
        for entry in due {
            // An earlier attempt in this pass may have superseded it.
            if self.get(entry.id).is_some_and(|e| e.state.is_settled()) {
                continue;
            }
            report.attempted += 1;
            let after = self.attempt(entry.id).await?;
            if matches!(after.state, OutboxState::Done { .. }) {
                report.succeeded += 1;
                report.settled.push(after);
            } else if let OutboxState::Failed { error } = &after.state
                && after.attempts >= MAX_OUTBOX_ATTEMPTS
            {
                error!(id = %after.id, reservation_id = %after.reservation_id, error = %error, "giving up on calendar mirror");
                report.gave_up += 1;
            }
        }
        Ok(report)
    }

    /// Drop settled entries and rewrite the journal with what remains.
    pub async fn compact(&self) -> Result<usize, OutboxError> {
        let _settling = self.settling.lock().await;
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.state.is_settled());
        let removed = before - self.entries.len();
        if let Some(wal) = &self.wal {
            let events: Vec<Event> = self
                .snapshot(|_| true)
                .into_iter()
                .map(|entry| Event::OutboxRecorded { entry })
                .collect();
            wal.lock().await.compact(&events)?;
        }
        Ok(removed)
    }
}

/// Copy the calendar event ids of settled entries onto their reservations.
/// Returns how many reservations changed.
pub async fn apply_to_store(store: &dyn ReservationStore, settled: &[OutboxEntry]) -> Result<usize, StoreError> {
    let mut changed = 0;
    for entry in settled {
        let OutboxState::Done { event_id } = &entry.state else {
            continue;
        };
        let mut reservation = match store.get(&entry.reservation_id).await {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => continue,
            Err(e) => return Err(e),
        };
        // A delete only clears the id it removed.
        if let CalendarOp::Delete { event_id: gone } = &entry.op
            && reservation.calendar_event_id.as_deref() != Some(gone.as_str())
        {
            continue;
        }
        if reservation.calendar_event_id != *event_id {
            reservation.calendar_event_id = event_id.clone();
            store.update(&reservation).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Compact the reservation journal and the outbox journal.
pub async fn compact_journals(outbox: &Outbox, store: &dyn ReservationStore) -> Result<usize, OutboxError> {
    store.compact().await.map_err(|e| OutboxError::Journal(format!("reservations: {e}")))?;
    let removed = outbox.compact().await?;
    info!(removed, "journals compacted");
    Ok(removed)
}

/// Background task that re-attempts failed calendar mirrors until `shutdown`.
/// Journals are compacted every `DISPATCH_TICKS_PER_COMPACTION` ticks and
/// once more on the way out.
pub async fn run_dispatcher(
    outbox: Arc<Outbox>,
    store: Arc<dyn ReservationStore>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    let mut ticks: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Err(e) = compact_journals(&outbox, store.as_ref()).await {
                    error!("journal compaction failed: {e}");
                }
                info!("outbox dispatcher stopping");
                return;
            }
            _ = interval.tick() => {}
        }
        ticks += 1;
        if ticks % DISPATCH_TICKS_PER_COMPACTION == 0
            && let Err(e) = compact_journals(&outbox, store.as_ref()).await
        {
            error!("journal compaction failed: {e}");
        }
        match outbox.drain().await {
            Ok(report) if report.attempted > 0 => {
                info!(
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    gave_up = report.gave_up,
                    "outbox drained"
                );
                if let Err(e) = apply_to_store(store.as_ref(), &report.settled).await {
                    error!("outbox write-back failed: {e}");
                }
            }
            Ok(_) => {}
            Err(e) => error!("outbox drain failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::{BusinessClock, MemoryCalendar, TimeWindow};
    use crate::model::*;
    use crate::store::MemoryStore;
    use std::path::PathBuf;
    use tokio::sync::Notify;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotcheck_test_outbox");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn reservation(id: &str) -> Reservation {
        Reservation {
            id: id.into(),
            date: parse_date("2025-08-16").unwrap(),
            span: Span::parse("10:00", "14:00").unwrap(),
            status: BookingStatus::Pending,
            label: Some("Okafor".into()),
            calendar_event_id: None,
        }
    }

    fn create_op(id: &str) -> CalendarOp {
        CalendarOp::Create {
            draft: EventDraft::for_reservation(&reservation(id), &BusinessClock::default(), 60, 60).unwrap(),
        }
    }

    fn refused() -> CalendarError {
        CalendarError::Http {
            status: 403,
            message: "calendar access revoked".into(),
        }
    }

    fn setup() -> (Arc<MemoryCalendar>, Outbox) {
        let calendar = Arc::new(MemoryCalendar::new());
        let outbox = Outbox::new(calendar.clone(), RetryPolicy::no_retry());
        (calendar, outbox)
    }

    /// Holds every insert until `release` is notified.
    struct GatedCalendar {
        inner: MemoryCalendar,
        entered: Notify,
        release: Notify,
    }

    impl GatedCalendar {
        fn new() -> Self {
            Self {
                inner: MemoryCalendar::new(),
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl CalendarService for GatedCalendar {
        async fn list_events(&self, window: &TimeWindow) -> Result<Vec<CalendarEvent>, CalendarError> {
            self.inner.list_events(window).await
        }

        async fn insert_event(&self, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.insert_event(draft).await
        }

        async fn update_event(&self, event_id: &str, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
            self.inner.update_event(event_id, draft).await
        }

        async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError> {
            self.inner.delete_event(event_id).await
        }
    }

    async fn stored_reservation(store: &MemoryStore) -> Reservation {
        store
            .insert(NewReservation::pending(
                parse_date("2025-08-16").unwrap(),
                Span::parse("10:00", "14:00").unwrap(),
                None,
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_lands_and_reports_event_id() {
        let (calendar, outbox) = setup();
        let entry = outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();
        let OutboxState::Done { event_id: Some(event_id) } = &entry.state else {
            panic!("expected done, got {:?}", entry.state);
        };
        assert_eq!(entry.attempts, 1);
        assert_eq!(calendar.get(event_id).unwrap().reservation_id.as_deref(), Some("r1"));
        assert!(outbox.pending().is_empty() && outbox.failed().is_empty());
    }

    #[tokio::test]
    async fn failure_is_tracked_not_raised() {
        let (calendar, outbox) = setup();
        calendar.fail_next(refused());
        let entry = outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();
        assert!(matches!(entry.state, OutboxState::Failed { .. }));
        assert_eq!(outbox.failed().len(), 1);
        assert!(calendar.events().is_empty());

        let report = outbox.drain().await.unwrap();
        assert_eq!((report.attempted, report.succeeded, report.gave_up), (1, 1, 0));
        assert_eq!(report.settled[0].attempts, 2);
        assert_eq!(calendar.events().len(), 1);
    }

    #[tokio::test]
    async fn drain_gives_up_at_attempt_cap() {
        let (calendar, outbox) = setup();
        calendar.fail_times(MAX_OUTBOX_ATTEMPTS as usize + 5, refused());
        let entry = outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();

        let mut gave_up = 0;
        for _ in 0..MAX_OUTBOX_ATTEMPTS + 2 {
            gave_up += outbox.drain().await.unwrap().gave_up;
        }
        assert_eq!(gave_up, 1);
        assert_eq!(outbox.get(entry.id).unwrap().attempts, MAX_OUTBOX_ATTEMPTS);
        assert_eq!(calendar.write_calls(), MAX_OUTBOX_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn update_of_missing_event_recreates_it() {
        let (calendar, outbox) = setup();
        let CalendarOp::Create { draft } = create_op("r1") else { unreachable!() };
        let op = CalendarOp::Update {
            event_id: "evt-deleted-by-hand".into(),
            draft,
        };
        let entry = outbox.record_and_attempt("r1", op).await.unwrap();
        let OutboxState::Done { event_id: Some(event_id) } = &entry.state else {
            panic!("expected done, got {:?}", entry.state);
        };
        assert_ne!(event_id, "evt-deleted-by-hand");
        assert_eq!(calendar.events().len(), 1);
    }

    #[tokio::test]
    async fn delete_of_missing_event_counts_as_done() {
        let (_calendar, outbox) = setup();
        let op = CalendarOp::Delete {
            event_id: "evt-gone".into(),
        };
        let entry = outbox.record_and_attempt("r1", op).await.unwrap();
        assert_eq!(entry.state, OutboxState::Done { event_id: None });
    }

    #[tokio::test]
    async fn newer_op_supersedes_unsettled_one() {
        let (calendar, outbox) = setup();
        calendar.fail_next(refused());
        let first = outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();
        let second = outbox.record("r1", create_op("r1")).await.unwrap();

        assert_eq!(outbox.get(first.id).unwrap().state, OutboxState::Superseded);
        assert_eq!(outbox.pending(), vec![second.clone()]);

        let report = outbox.drain().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.settled[0].id, second.id);
        assert_eq!(calendar.events().len(), 1);
    }

    #[tokio::test]
    async fn create_superseded_in_flight_stays_superseded_and_is_undone() {
        let calendar = Arc::new(GatedCalendar::new());
        let outbox = Arc::new(Outbox::new(calendar.clone(), RetryPolicy::no_retry()));
        let id = outbox.record("r1", create_op("r1")).await.unwrap().id;

        let in_flight = tokio::spawn({
            let outbox = outbox.clone();
            async move { outbox.attempt(id).await }
        });
        calendar.entered.notified().await;
        assert_eq!(outbox.supersede("r1").await.unwrap(), 1);
        calendar.release.notify_one();

        let after = in_flight.await.unwrap().unwrap();
        assert_eq!(after.state, OutboxState::Superseded);
        assert_eq!(outbox.get(id).unwrap().state, OutboxState::Superseded);
        assert!(calendar.inner.events().is_empty());

        let undo: Vec<OutboxEntry> = outbox
            .entries_for("r1")
            .into_iter()
            .filter(|e| matches!(e.op, CalendarOp::Delete { .. }))
            .collect();
        assert_eq!(undo.len(), 1);
        assert_eq!(undo[0].state, OutboxState::Done { event_id: None });

        let report = outbox.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(report.settled.is_empty());
    }

    #[tokio::test]
    async fn landed_entry_is_not_superseded_afterwards() {
        let (_calendar, outbox) = setup();
        let entry = outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();
        assert_eq!(outbox.supersede("r1").await.unwrap(), 0);
        assert_eq!(outbox.get(entry.id).unwrap().state, entry.state);
    }

    #[tokio::test]
    async fn delete_write_back_leaves_a_newer_event_id_alone() {
        let (_calendar, outbox) = setup();
        let store = MemoryStore::new();
        let mut r = stored_reservation(&store).await;
        r.calendar_event_id = Some("evt-current".into());
        store.update(&r).await.unwrap();

        let stale = outbox
            .record_and_attempt(&r.id, CalendarOp::Delete { event_id: "evt-stale".into() })
            .await
            .unwrap();
        assert_eq!(apply_to_store(&store, &[stale]).await.unwrap(), 0);
        assert_eq!(store.get(&r.id).await.unwrap().calendar_event_id.as_deref(), Some("evt-current"));

        let current = outbox
            .record_and_attempt(&r.id, CalendarOp::Delete { event_id: "evt-current".into() })
            .await
            .unwrap();
        assert_eq!(apply_to_store(&store, &[current]).await.unwrap(), 1);
        assert_eq!(store.get(&r.id).await.unwrap().calendar_event_id, None);
    }

    #[tokio::test]
    async fn journal_restores_unsettled_entries() {
        let path = test_wal_path("restore.wal");
        let calendar = Arc::new(MemoryCalendar::new());
        calendar.fail_next(refused());
        let id = {
            let outbox = Outbox::open(&path, calendar.clone(), RetryPolicy::no_retry()).unwrap();
            outbox.record_and_attempt("r1", create_op("r1")).await.unwrap();
            outbox.record_and_attempt("r2", create_op("r2")).await.unwrap().id
        };

        let reopened = Outbox::open(&path, calendar.clone(), RetryPolicy::no_retry()).unwrap();
        let failed = reopened.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reservation_id, "r1");
        assert_eq!(failed[0].attempts, 1);
        assert!(matches!(reopened.get(id).unwrap().state, OutboxState::Done { .. }));

        assert_eq!(reopened.compact().await.unwrap(), 1);
        let compacted = Outbox::open(&path, calendar, RetryPolicy::no_retry()).unwrap();
        assert_eq!(compacted.failed().len(), 1);
        assert!(compacted.get(id).is_none());
    }

    #[tokio::test]
    async fn settled_event_ids_are_written_back() {
        let (calendar, outbox) = setup();
        let store = MemoryStore::new();
        let r = stored_reservation(&store).await;

        calendar.fail_next(refused());
        outbox.record_and_attempt(&r.id, create_op(&r.id)).await.unwrap();
        let report = outbox.drain().await.unwrap();
        assert_eq!(apply_to_store(&store, &report.settled).await.unwrap(), 1);

        let stored = store.get(&r.id).await.unwrap();
        assert_eq!(stored.calendar_event_id, Some(calendar.events()[0].id.clone()));
        assert_eq!(apply_to_store(&store, &report.settled).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_drains_until_shutdown() {
        let calendar = Arc::new(MemoryCalendar::new());
        let outbox = Arc::new(Outbox::new(calendar.clone(), RetryPolicy::no_retry()));
        let store = Arc::new(MemoryStore::new());
        let r = stored_reservation(&store).await;
        calendar.fail_next(refused());
        outbox.record_and_attempt(&r.id, create_op(&r.id)).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_dispatcher(
            outbox.clone(),
            store.clone(),
            Duration::from_secs(30),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        assert!(outbox.failed().is_empty());
        assert!(store.get(&r.id).await.unwrap().calendar_event_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatcher_compacts_journals_on_shutdown() {
        let outbox_path = test_wal_path("dispatch_outbox.wal");
        let store_path = test_wal_path("dispatch_reservations.wal");
        let calendar = Arc::new(MemoryCalendar::new());
        let outbox = Arc::new(Outbox::open(&outbox_path, calendar.clone(), RetryPolicy::no_retry()).unwrap());
        let store = Arc::new(MemoryStore::open(&store_path).unwrap());
        let r = stored_reservation(&store).await;
        calendar.fail_next(refused());
        let entry = outbox.record_and_attempt(&r.id, create_op(&r.id)).await.unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_dispatcher(
            outbox.clone(),
            store.clone(),
            Duration::from_secs(30),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.await.unwrap();

        // Insert plus write-back collapse to one record per reservation.
        let saved = Wal::replay(&store_path).unwrap();
        assert_eq!(saved.len(), 1);
        let Event::ReservationSaved { reservation } = &saved[0] else {
            panic!("expected a reservation record, got {:?}", saved[0]);
        };
        assert!(reservation.calendar_event_id.is_some());

        assert!(Wal::replay(&outbox_path).unwrap().is_empty());
        let reopened = Outbox::open(&outbox_path, calendar, RetryPolicy::no_retry()).unwrap();
        assert!(reopened.get(entry.id).is_none());
    }
}
