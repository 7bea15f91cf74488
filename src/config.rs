use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use tracing::info;

use crate::calendar::BusinessClock;
use crate::checker::{CalendarFailurePolicy, CheckerSettings};
use crate::limits::{DEFAULT_BUFFER_AFTER, DEFAULT_BUFFER_BEFORE, DEFAULT_TIMEZONE};
use crate::model::Minutes;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.key, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub timezone: Tz,
    pub buffer_before: Minutes,
    pub buffer_after: Minutes,
    pub on_calendar_failure: CalendarFailurePolicy,
    pub retry: RetryPolicy,
    /// Postgres store when set; otherwise a WAL-backed store under `data_dir`.
    pub database_url: Option<String>,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub outbox_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys take their defaults; set but
    /// unparseable keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let d = Config::default();
        let retry = RetryPolicy {
            max_retries: parse(&var, "SLOTCHECK_MAX_RETRIES")?.unwrap_or(d.retry.max_retries),
            initial_delay: parse(&var, "SLOTCHECK_INITIAL_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.retry.initial_delay),
            max_delay: parse(&var, "SLOTCHECK_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.retry.max_delay),
            deadline: parse(&var, "SLOTCHECK_RETRY_DEADLINE_MS")?.map(Duration::from_millis),
        };

        let config = Self {
            timezone: parse(&var, "SLOTCHECK_TIMEZONE")?.unwrap_or(d.timezone),
            buffer_before: non_negative(&var, "SLOTCHECK_BUFFER_BEFORE_MIN", d.buffer_before)?,
            buffer_after: non_negative(&var, "SLOTCHECK_BUFFER_AFTER_MIN", d.buffer_after)?,
            on_calendar_failure: parse(&var, "SLOTCHECK_ON_CALENDAR_FAILURE")?.unwrap_or(d.on_calendar_failure),
            retry,
            database_url: var("SLOTCHECK_DATABASE_URL"),
            data_dir: var("SLOTCHECK_DATA_DIR").map_or(d.data_dir, PathBuf::from),
            metrics_port: parse(&var, "SLOTCHECK_METRICS_PORT")?,
            outbox_interval: parse(&var, "SLOTCHECK_OUTBOX_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.outbox_interval),
        };
        if config.outbox_interval.is_zero() {
            return Err(ConfigError {
                key: "SLOTCHECK_OUTBOX_INTERVAL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    pub fn clock(&self) -> BusinessClock {
        BusinessClock::new(self.timezone)
    }

    pub fn checker_settings(&self) -> CheckerSettings {
        CheckerSettings {
            buffer_before: self.buffer_before,
            buffer_after: self.buffer_after,
            on_calendar_failure: self.on_calendar_failure,
            store_retry: self.retry,
            calendar_retry: self.retry,
        }
    }

    pub fn log_summary(&self) {
        info!("  timezone: {}", self.timezone.name());
        info!("  buffers: {}m before, {}m after", self.buffer_before, self.buffer_after);
        info!("  on calendar failure: {}", self.on_calendar_failure.as_str());
        info!(
            "  store: {}",
            if self.database_url.is_some() { "postgres" } else { "wal" }
        );
        info!("  data_dir: {}", self.data_dir.display());
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Vancouver,
            buffer_before: DEFAULT_BUFFER_BEFORE,
            buffer_after: DEFAULT_BUFFER_AFTER,
            on_calendar_failure: CalendarFailurePolicy::default(),
            retry: RetryPolicy::default(),
            database_url: None,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            outbox_interval: Duration::from_secs(30),
        }
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(value) = var(key) else { return Ok(None) };
    value.parse().map(Some).map_err(|e: T::Err| ConfigError {
        key,
        reason: e.to_string(),
        value,
    })
}

fn non_negative(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Minutes,
) -> Result<Minutes, ConfigError> {
    let minutes = parse(var, key)?.unwrap_or(default);
    if minutes < 0 {
        return Err(ConfigError {
            key,
            value: minutes.to_string(),
            reason: "must not be negative".into(),
        });
    }
    Ok(minutes)
}
