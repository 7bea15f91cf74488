use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::{CalendarEvent, EventDraft, EventStatus};

use super::{CalendarError, CalendarService, TimeWindow};

/// In-process calendar. Counts reads and writes separately and can be told
/// to fail upcoming calls, which makes it the calendar double in tests.
#[derive(Default)]
pub struct MemoryCalendar {
    events: DashMap<String, CalendarEvent>,
    list_calls: AtomicUsize,
    write_calls: AtomicUsize,
    injected: Mutex<VecDeque<CalendarError>>,
}

impl MemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an event directly, e.g. a hold made outside the booking flow.
    pub fn add_event(&self, event: CalendarEvent) {
        self.events.insert(event.id.clone(), event);
    }

    pub fn events(&self) -> Vec<CalendarEvent> {
        let mut all: Vec<CalendarEvent> = self.events.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn get(&self, id: &str) -> Option<CalendarEvent> {
        self.events.get(id).map(|e| e.value().clone())
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, err: CalendarError) {
        self.fail_times(1, err);
    }

    pub fn fail_times(&self, n: usize, err: CalendarError) {
        if let Ok(mut q) = self.injected.lock() {
            q.extend(std::iter::repeat_n(err, n));
        }
    }

    fn take_injected(&self) -> Result<(), CalendarError> {
        match self.injected.lock().ok().and_then(|mut q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn event_from(id: String, draft: &EventDraft) -> CalendarEvent {
        CalendarEvent {
            id,
            summary: Some(draft.summary.clone()),
            start: draft.start,
            end: draft.end,
            status: EventStatus::Confirmed,
            reservation_id: Some(draft.reservation_id.clone()),
        }
    }
}

#[async_trait]
impl CalendarService for MemoryCalendar {
    async fn list_events(&self, window: &TimeWindow) -> Result<Vec<CalendarEvent>, CalendarError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        Ok(self
            .events()
            .into_iter()
            .filter(|e| window.overlaps(e.start, e.end))
            .collect())
    }

    async fn insert_event(&self, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        let event = Self::event_from(format!("evt-{}", Ulid::new()), draft);
        self.events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn update_event(&self, event_id: &str, draft: &EventDraft) -> Result<CalendarEvent, CalendarError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        let Some(mut slot) = self.events.get_mut(event_id) else {
            return Err(CalendarError::NotFound(event_id.to_string()));
        };
        *slot = Self::event_from(event_id.to_string(), draft);
        Ok(slot.value().clone())
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.take_injected()?;
        match self.events.remove(event_id) {
            Some(_) => Ok(()),
            None => Err(CalendarError::NotFound(event_id.to_string())),
        }
    }
}
