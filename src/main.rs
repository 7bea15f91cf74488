use std::process::ExitCode;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slotcheck::booking::{BookingError, BookingService};
use slotcheck::calendar::{CalendarService, DisabledCalendar};
use slotcheck::checker::{CalendarFailurePolicy, ConflictChecker, FreeWindows};
use slotcheck::config::Config;
use slotcheck::limits::MIN_RENTAL_MINUTES;
use slotcheck::model::{
    Availability, BookingStatus, Minutes, NewReservation, SlotRequest, Source, Span, format_minutes, parse_date,
    parse_time_of_day,
};
use slotcheck::outbox::{Outbox, compact_journals, run_dispatcher};
use slotcheck::store::{MemoryStore, PgStore, ReservationStore};

/// Exit status when the requested slot is not free.
const EXIT_UNAVAILABLE: u8 = 2;

#[derive(Parser)]
#[command(
    name = "slotcheck",
    version,
    about = "Rental booking availability checker",
    after_help = "No calendar backend is wired into this binary: calendar reads see an empty \
                  calendar and writes return mock event ids. Reports carry \"calendar\": \"disabled\" \
                  so a calendar-sourced verdict is never mistaken for a real calendar check."
)]
struct Cli {
    /// Override SLOTCHECK_ON_CALENDAR_FAILURE (allow | block)
    #[arg(long, global = true)]
    on_calendar_failure: Option<CalendarFailurePolicy>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether a slot is free against the database and the calendar
    Check {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time_of_day)]
        start: Minutes,
        #[arg(long, value_parser = parse_time_of_day)]
        end: Minutes,
        /// Ignore this reservation (when re-checking a booking being edited)
        #[arg(long)]
        exclude: Option<String>,
    },

    /// List free windows within business hours on a day
    Free {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time_of_day, default_value = "08:00")]
        open: Minutes,
        #[arg(long, value_parser = parse_time_of_day, default_value = "22:00")]
        close: Minutes,
        #[arg(long, default_value_t = MIN_RENTAL_MINUTES)]
        min_minutes: Minutes,
    },

    /// Create a booking if its slot is free
    Book {
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time_of_day)]
        start: Minutes,
        #[arg(long, value_parser = parse_time_of_day)]
        end: Minutes,
        #[arg(long)]
        label: Option<String>,
    },

    /// Move a booking to a new slot
    Reschedule {
        #[arg(long)]
        id: String,
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time_of_day)]
        start: Minutes,
        #[arg(long, value_parser = parse_time_of_day)]
        end: Minutes,
    },

    /// Cancel a booking and remove its calendar event
    Cancel {
        #[arg(long)]
        id: String,
    },

    /// Set a booking's status (pending | confirmed | cancelled | completed)
    Status {
        #[arg(long)]
        id: String,
        #[arg(long)]
        status: BookingStatus,
    },

    /// Show pending and failed calendar operations
    Outbox {
        /// Re-attempt failed operations once
        #[arg(long)]
        drain: bool,
        /// Rewrite the reservation and outbox journals, dropping settled entries
        #[arg(long)]
        compact: bool,
    },

    /// Re-attempt failed calendar operations until interrupted
    Dispatch,
}

/// Which calendar backend answered. Only the disabled stand-in exists today.
const CALENDAR_BACKEND: &str = "disabled";

#[derive(Serialize)]
struct CheckReport {
    date: NaiveDate,
    start: String,
    end: String,
    available: bool,
    source: Source,
    calendar: &'static str,
    #[serde(flatten)]
    verdict: Availability,
}

#[derive(Serialize)]
struct FreeReport {
    calendar: &'static str,
    #[serde(flatten)]
    free: FreeWindows,
}

fn emit<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<dyn ReservationStore>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.database_url {
        let store = PgStore::connect(url).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }
    let path = config.data_dir.join("reservations.wal");
    let store = MemoryStore::open(&path)?;
    info!("reservations: {} loaded from {}", store.len(), path.display());
    Ok(Arc::new(store))
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(policy) = cli.on_calendar_failure {
        config.on_calendar_failure = policy;
    }
    slotcheck::observability::init(config.metrics_port)?;
    info!("slotcheck starting");
    config.log_summary();

    let shutdown = CancellationToken::new();
    let store = open_store(&config).await?;
    warn!("calendar integration disabled, calendar-sourced verdicts reflect an empty calendar");
    let calendar: Arc<dyn CalendarService> = Arc::new(DisabledCalendar);
    let outbox = Arc::new(
        Outbox::open(&config.data_dir.join("outbox.wal"), calendar.clone(), config.retry)?
            .with_shutdown(shutdown.clone()),
    );
    let checker = Arc::new(ConflictChecker::new(
        store.clone(),
        calendar,
        config.clock(),
        config.checker_settings(),
    ));
    let bookings = BookingService::new(checker.clone(), store.clone(), outbox.clone());

    let outcome = match cli.cmd {
        Command::Check {
            date,
            start,
            end,
            exclude,
        } => {
            let mut request = SlotRequest::new(date, Span::try_new(start, end)?);
            if let Some(id) = exclude {
                request = request.excluding(id);
            }
            let verdict = checker.check(&request).await?;
            let available = verdict.is_available();
            emit(&CheckReport {
                date,
                start: format_minutes(start),
                end: format_minutes(end),
                available,
                source: verdict.source(),
                calendar: CALENDAR_BACKEND,
                verdict,
            })?;
            return Ok(if available { ExitCode::SUCCESS } else { ExitCode::from(EXIT_UNAVAILABLE) });
        }
        Command::Free {
            date,
            open,
            close,
            min_minutes,
        } => {
            let free = checker.free_windows(date, Span::try_new(open, close)?, min_minutes).await?;
            emit(&FreeReport {
                calendar: CALENDAR_BACKEND,
                free,
            })?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Outbox { drain, compact } => {
            if drain {
                let report = bookings.drain_outbox().await?;
                emit(&report)?;
            }
            if compact {
                let removed = compact_journals(&outbox, store.as_ref()).await?;
                info!("journals compacted, {removed} settled outbox entries dropped");
            }
            emit(&serde_json::json!({
                "pending": outbox.pending(),
                "failed": outbox.failed(),
            }))?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Dispatch => {
            info!("outbox dispatcher running every {:?}", config.outbox_interval);
            let task = tokio::spawn(run_dispatcher(
                outbox.clone(),
                store.clone(),
                config.outbox_interval,
                shutdown.clone(),
            ));
            shutdown_signal().await?;
            info!("shutdown signal received, stopping dispatcher");
            shutdown.cancel();
            task.await?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Book {
            date,
            start,
            end,
            label,
        } => {
            let new = NewReservation::pending(date, Span::try_new(start, end)?, label);
            bookings.create(new).await
        }
        Command::Reschedule { id, date, start, end } => {
            bookings.reschedule(&id, date, Span::try_new(start, end)?).await
        }
        Command::Cancel { id } => bookings.cancel(&id).await,
        Command::Status { id, status } => bookings.set_status(&id, status).await,
    };

    match outcome {
        Ok(outcome) => {
            emit(&outcome)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(BookingError::Unavailable(verdict)) => {
            emit(&verdict)?;
            Ok(ExitCode::from(EXIT_UNAVAILABLE))
        }
        Err(e) => Err(e.into()),
    }
}
