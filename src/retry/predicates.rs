//! Composable "is this failure transient?" predicates.

use std::io;

/// What a predicate can inspect on an error from an external collaborator.
pub trait RetryClassify {
    /// Network errno name (`ECONNRESET`) or SQLSTATE (`40001`).
    fn code(&self) -> Option<&str> {
        None
    }

    fn http_status(&self) -> Option<u16> {
        None
    }

    /// Payment-provider error type, e.g. `rate_limit_error`.
    fn provider_type(&self) -> Option<&str> {
        None
    }

    fn message(&self) -> String;
}

pub type Predicate<E> = fn(&E) -> bool;

const NETWORK_CODES: &[&str] = &["ECONNREFUSED", "ECONNRESET", "ETIMEDOUT", "ENOTFOUND"];

const DATABASE_TEMPORARY_CODES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "53100", // disk_full
    "53200", // out_of_memory
    "53300", // too_many_connections
    "57P04", // database_dropped
    "08006", // connection_failure
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
];

const PAYMENT_TEMPORARY_TYPES: &[&str] = &["rate_limit_error", "api_connection_error", "api_error"];
const PAYMENT_TEMPORARY_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

fn message_mentions<E: RetryClassify + ?Sized>(err: &E, needles: &[&str]) -> bool {
    let message = err.message().to_ascii_lowercase();
    needles.iter().any(|n| message.contains(n))
}

fn code_in<E: RetryClassify + ?Sized>(err: &E, codes: &[&str]) -> bool {
    err.code().is_some_and(|c| codes.contains(&c))
}

/// Connection refused/reset, timeouts, DNS failures.
pub fn network_errors<E: RetryClassify + ?Sized>(err: &E) -> bool {
    code_in(err, NETWORK_CODES) || message_mentions(err, &["network", "connection"])
}

/// Serialization failures, deadlocks, resource exhaustion, connection loss.
pub fn database_temporary_errors<E: RetryClassify + ?Sized>(err: &E) -> bool {
    code_in(err, DATABASE_TEMPORARY_CODES)
        || message_mentions(
            err,
            &["timeout", "temporarily unavailable", "connection", "rate limit"],
        )
}

pub fn payment_temporary_errors<E: RetryClassify + ?Sized>(err: &E) -> bool {
    err.provider_type().is_some_and(|t| PAYMENT_TEMPORARY_TYPES.contains(&t))
        || err.http_status().is_some_and(|s| PAYMENT_TEMPORARY_STATUSES.contains(&s))
}

pub fn http_5xx_errors<E: RetryClassify + ?Sized>(err: &E) -> bool {
    err.http_status().is_some_and(|s| (500..600).contains(&s))
}

pub fn rate_limit_errors<E: RetryClassify + ?Sized>(err: &E) -> bool {
    err.http_status() == Some(429) || message_mentions(err, &["rate limit"])
}

/// Logical OR of several predicates.
pub fn any<E>(predicates: impl IntoIterator<Item = Predicate<E>>) -> impl Fn(&E) -> bool + Send + Sync + 'static
where
    E: 'static,
{
    let predicates: Vec<Predicate<E>> = predicates.into_iter().collect();
    move |err: &E| predicates.iter().any(|p| p(err))
}

/// Errno-style name for transport-level I/O failures.
pub fn io_error_code(kind: io::ErrorKind) -> Option<&'static str> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some("ECONNREFUSED"),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            Some("ECONNRESET")
        }
        io::ErrorKind::TimedOut => Some("ETIMEDOUT"),
        _ => None,
    }
}
