use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use ulid::Ulid;

use slotcheck::booking::{BookingError, BookingService};
use slotcheck::calendar::{BusinessClock, CalendarError, MemoryCalendar};
use slotcheck::checker::{CalendarFailurePolicy, CheckerSettings, ConflictChecker};
use slotcheck::model::{Availability, BookingStatus, NewReservation, OutboxState, SlotRequest, Source, Span, parse_date};
use slotcheck::outbox::Outbox;
use slotcheck::retry::RetryPolicy;
use slotcheck::store::{MemoryStore, ReservationStore};

// ── Test infrastructure ──────────────────────────────────────

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotcheck_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn day() -> NaiveDate {
    parse_date("2025-08-16").unwrap()
}

fn slot(start: &str, end: &str) -> SlotRequest {
    SlotRequest::new(day(), Span::parse(start, end).unwrap())
}

fn outage() -> CalendarError {
    CalendarError::Transport {
        code: Some("ETIMEDOUT".into()),
        message: "calendar API timed out".into(),
    }
}

struct App {
    store: Arc<MemoryStore>,
    calendar: Arc<MemoryCalendar>,
    bookings: BookingService,
}

fn app_with(store: MemoryStore, outbox_at: Option<&PathBuf>, policy: CalendarFailurePolicy) -> App {
    let store = Arc::new(store);
    let calendar = Arc::new(MemoryCalendar::new());
    let settings = CheckerSettings {
        on_calendar_failure: policy,
        store_retry: RetryPolicy::no_retry(),
        calendar_retry: RetryPolicy::no_retry(),
        ..CheckerSettings::default()
    };
    let checker = Arc::new(ConflictChecker::new(
        store.clone(),
        calendar.clone(),
        BusinessClock::default(),
        settings,
    ));
    let outbox = match outbox_at {
        Some(path) => Outbox::open(path, calendar.clone(), RetryPolicy::no_retry()).unwrap(),
        None => Outbox::new(calendar.clone(), RetryPolicy::no_retry()),
    };
    App {
        bookings: BookingService::new(checker, store.clone(), Arc::new(outbox)),
        store,
        calendar,
    }
}

fn app() -> App {
    app_with(MemoryStore::new(), None, CalendarFailurePolicy::FavorAvailability)
}

impl App {
    async fn book(&self, start: &str, end: &str) -> Result<slotcheck::booking::BookingOutcome, BookingError> {
        self.bookings
            .create(NewReservation::pending(day(), Span::parse(start, end).unwrap(), Some("Okafor".into())))
            .await
    }

    async fn check(&self, start: &str, end: &str) -> Availability {
        self.bookings.checker().check(&slot(start, end)).await.unwrap()
    }
}

// ── Booking lifecycle ────────────────────────────────────────

#[tokio::test]
async fn booking_blocks_its_buffered_neighbourhood() {
    let app = app();
    let booked = app.book("08:00", "12:00").await.unwrap();
    assert!(matches!(booked.calendar, Some(OutboxState::Done { .. })));
    assert!(booked.reservation.calendar_event_id.is_some());

    // Mirror covers 07:00-13:00, so a 13:30 start still collides once padded.
    let near = app.check("13:30", "17:30").await;
    assert!(matches!(near, Availability::ConflictFromCalendar { .. }));
    assert_eq!(near.conflicts()[0].reservation_id.as_deref(), Some(booked.reservation.id.as_str()));

    // Back-to-back with both buffers is fine.
    assert_eq!(app.check("14:00", "18:00").await, Availability::Available);

    // Overlapping the exact booking is caught by the database first.
    let list_calls = app.calendar.list_calls();
    let direct = app.check("10:00", "14:00").await;
    assert_eq!(direct.source(), Source::Database);
    assert_eq!(app.calendar.list_calls(), list_calls);
}

#[tokio::test]
async fn refused_booking_is_not_stored() {
    let app = app();
    app.book("08:00", "12:00").await.unwrap();

    let err = app.book("12:30", "16:30").await.unwrap_err();
    let BookingError::Unavailable(verdict) = err else {
        panic!("expected unavailable, got {err:?}");
    };
    assert_eq!(verdict.source(), Source::Calendar);
    assert_eq!(app.store.len(), 1);
    assert_eq!(app.calendar.events().len(), 1);
}

#[tokio::test]
async fn cancelling_frees_the_slot_and_removes_the_mirror() {
    let app = app();
    let booked = app.book("14:00", "18:00").await.unwrap();
    let id = booked.reservation.id;

    let out = app.bookings.cancel(&id).await.unwrap();
    assert_eq!(out.reservation.status, BookingStatus::Cancelled);
    assert_eq!(out.calendar, Some(OutboxState::Done { event_id: None }));
    assert!(app.calendar.events().is_empty());

    assert_eq!(app.check("14:00", "18:00").await, Availability::Available);
    app.book("14:00", "18:00").await.unwrap();
}

#[tokio::test]
async fn reschedule_moves_the_mirror_with_the_booking() {
    let app = app();
    let booked = app.book("08:00", "12:00").await.unwrap();
    let id = booked.reservation.id.clone();
    let event_id = booked.reservation.calendar_event_id.clone().unwrap();

    // Overlaps its own old slot; only itself is in the way.
    let moved = app
        .bookings
        .reschedule(&id, day(), Span::parse("10:00", "14:00").unwrap())
        .await
        .unwrap();
    assert_eq!(moved.reservation.span, Span::parse("10:00", "14:00").unwrap());
    assert_eq!(moved.reservation.calendar_event_id.as_deref(), Some(event_id.as_str()));

    let clock = BusinessClock::default();
    let event = app.calendar.get(&event_id).unwrap();
    assert_eq!(event.start, clock.instant(day(), 9 * 60).unwrap());
    assert_eq!(event.end, clock.instant(day(), 15 * 60).unwrap());

    // The freed morning is bookable again.
    assert!(app.check("04:00", "08:00").await.is_available());
}

// ── Calendar outages ─────────────────────────────────────────

#[tokio::test]
async fn outage_admits_on_database_and_catches_up_later() {
    let app = app();
    // One failure for the availability read, one for the mirror write.
    app.calendar.fail_times(2, outage());

    let booked = app.book("14:00", "18:00").await.unwrap();
    assert!(matches!(booked.availability, Some(Availability::AvailableFallback { .. })));
    assert!(matches!(booked.calendar, Some(OutboxState::Failed { .. })));
    assert!(booked.reservation.calendar_event_id.is_none());
    assert_eq!(app.bookings.outbox().failed().len(), 1);

    let report = app.bookings.drain_outbox().await.unwrap();
    assert_eq!((report.attempted, report.succeeded), (1, 1));

    let stored = app.store.get(&booked.reservation.id).await.unwrap();
    let event_id = stored.calendar_event_id.unwrap();
    assert!(app.calendar.get(&event_id).is_some());
    assert!(app.bookings.outbox().failed().is_empty());
}

#[tokio::test]
async fn fail_closed_refuses_during_outage() {
    let app = app_with(MemoryStore::new(), None, CalendarFailurePolicy::FailClosed);
    app.calendar.fail_next(outage());

    let err = app.book("14:00", "18:00").await.unwrap_err();
    assert!(matches!(
        err,
        BookingError::Unavailable(Availability::UnavailableFallback { .. })
    ));
    assert!(app.store.is_empty());
}

#[tokio::test]
async fn database_conflict_is_reported_even_during_outage() {
    let app = app();
    app.book("14:00", "18:00").await.unwrap();
    app.calendar.fail_times(5, outage());

    let verdict = app.check("15:00", "19:00").await;
    assert!(matches!(verdict, Availability::ConflictFromDb { .. }));
}

// ── Restart ──────────────────────────────────────────────────

#[tokio::test]
async fn journals_survive_a_restart() {
    let dir = test_dir();
    let reservations = dir.join("reservations.wal");
    let outbox = dir.join("outbox.wal");

    let id = {
        let app = app_with(
            MemoryStore::open(&reservations).unwrap(),
            Some(&outbox),
            CalendarFailurePolicy::FavorAvailability,
        );
        app.calendar.fail_times(2, outage());
        app.book("14:00", "18:00").await.unwrap().reservation.id
    };

    let app = app_with(
        MemoryStore::open(&reservations).unwrap(),
        Some(&outbox),
        CalendarFailurePolicy::FavorAvailability,
    );
    assert_eq!(app.store.len(), 1);
    assert!(matches!(app.check("15:00", "19:00").await, Availability::ConflictFromDb { .. }));

    let failed = app.bookings.outbox().failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reservation_id, id);

    let report = app.bookings.drain_outbox().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(app.store.get(&id).await.unwrap().calendar_event_id.is_some());
    assert_eq!(app.calendar.events().len(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}
