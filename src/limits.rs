use crate::model::Minutes;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Setup time reserved on the calendar before each rental.
pub const DEFAULT_BUFFER_BEFORE: Minutes = 60;
/// Teardown time reserved on the calendar after each rental.
pub const DEFAULT_BUFFER_AFTER: Minutes = 60;

pub const MIN_RENTAL_MINUTES: Minutes = 4 * 60;
pub const MAX_LABEL_LEN: usize = 200;

/// Outbox entries stop being re-driven after this many attempts.
pub const MAX_OUTBOX_ATTEMPTS: u32 = 5;
/// Dispatcher ticks between journal compactions.
pub const DISPATCH_TICKS_PER_COMPACTION: u64 = 120;

pub const DEFAULT_TIMEZONE: &str = "America/Vancouver";
