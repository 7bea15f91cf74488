pub mod booking;
pub mod calendar;
pub mod checker;
pub mod config;
pub mod limits;
pub mod model;
pub mod observability;
pub mod outbox;
pub mod retry;
pub mod store;
pub mod wal;
