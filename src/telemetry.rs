//! Global tracing/logging setup.
//!
//! Installs the `log` bridge first so SeaORM's sqlx logging flows through
//! tracing, then the subscriber with an env-driven filter. Safe to call more
//! than once; later calls are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{layer::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize tracing exactly once. `LOG_LEVEL` sets the default filter
/// (RUST_LOG wins when present); `LOG_FORMAT=pretty` switches off JSON.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(log::LevelFilter::Trace)
        .init()
    {
        // Another bridge (tests, embedding harness) already owns the logger.
        eprintln!("warning: log bridge not installed: {}", err);
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let format = match config.log_format.as_str() {
        "pretty" => tracing_subscriber::fmt::layer().pretty().boxed(),
        _ => tracing_subscriber::fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
    {
        INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("warning: tracing subscriber not installed: {}", err);
    }

    Ok(())
}
