use chrono::NaiveDate;
use tracing::debug;

use crate::calendar::BusinessClock;
use crate::model::{CalendarEvent, Conflict, EventStatus, Reservation, Span};

/// Database leg: exact reservation times against the unpadded request.
pub(crate) fn database_conflicts(request: &Span, rows: &[Reservation]) -> Vec<Conflict> {
    rows.iter()
        .filter(|r| r.is_active() && r.span.overlaps(request))
        .map(|r| Conflict {
            id: r.id.clone(),
            label: r.label.clone(),
            span: r.span,
            reservation_id: Some(r.id.clone()),
        })
        .collect()
}

/// Wall-clock span of a live calendar event on `date`, unless it belongs to
/// the excluded reservation.
pub(crate) fn event_span(
    date: NaiveDate,
    event: &CalendarEvent,
    clock: &BusinessClock,
    exclude_id: Option<&str>,
) -> Option<Span> {
    if event.status == EventStatus::Cancelled {
        return None;
    }
    if let Some(excluded) = exclude_id
        && event.reservation_id.as_deref() == Some(excluded)
    {
        return None;
    }
    clock.local_span(date, event.start, event.end)
}

/// Calendar leg: `padded` is the request already widened by the buffers.
pub(crate) fn calendar_conflicts(
    date: NaiveDate,
    padded: &Span,
    events: &[CalendarEvent],
    clock: &BusinessClock,
    exclude_id: Option<&str>,
) -> Vec<Conflict> {
    events
        .iter()
        .filter_map(|event| {
            let span = event_span(date, event, clock, exclude_id)?;
            if !span.overlaps(padded) {
                return None;
            }
            debug!(event_id = %event.id, %span, request = %padded, "calendar event overlaps request");
            Some(Conflict {
                id: event.id.clone(),
                label: event.summary.clone(),
                span,
                reservation_id: event.reservation_id.clone(),
            })
        })
        .collect()
}
