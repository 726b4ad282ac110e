// ============================================================================
// SECTION 5: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging with:
// - pretty / compact / json console output
// - optional daily rotated file output (non-blocking writer)
// - RUST_LOG overrides on top of the configured level
// - component targets under `hostd::`
// ============================================================================

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::constants::AGENT_NAME;
use crate::error::{HostdError, HostdResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// ----------------------------------------------------------------------------
// 5.1 Log Level Management
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

// ----------------------------------------------------------------------------
// 5.2 Logger Initialization
// ----------------------------------------------------------------------------

fn console_layer(config: &LoggingConfig) -> BoxedLayer {
    match config.format.as_str() {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_ansi(config.colors)
            .with_target(true)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_ansi(config.colors)
            .with_target(true)
            .with_file(config.source_location)
            .with_line_number(config.source_location)
            .with_thread_names(true)
            .boxed(),
    }
}

/// Initialize the logging system based on configuration.
///
/// When a log directory is configured the returned guard must be held for the
/// lifetime of the process, otherwise buffered lines are lost on exit.
pub fn init_logging(config: &LoggingConfig) -> HostdResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.stdout {
        layers.push(console_layer(config));
    }

    let guard = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, format!("{}.log", AGENT_NAME));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| HostdError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "hostd::init",
        level = %config.level,
        format = %config.format,
        file = config.directory.is_some(),
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// 5.3 Logging Macros for Agent Components
// ----------------------------------------------------------------------------

/// Log a collector event
#[macro_export]
macro_rules! log_collector {
    ($collector:expr, $event:expr) => {
        tracing::debug!(
            target: "hostd::collector",
            collector = $collector,
            event = $event,
            "Collector event"
        )
    };
    ($collector:expr, $event:expr, $($field:tt)*) => {
        tracing::debug!(
            target: "hostd::collector",
            collector = $collector,
            event = $event,
            $($field)*,
            "Collector event"
        )
    };
}

/// Log a degraded store operation. Store failures are never propagated, so
/// this is the only trace they leave.
#[macro_export]
macro_rules! log_store {
    ($operation:expr, $error:expr) => {
        tracing::warn!(
            target: "hostd::store",
            operation = $operation,
            error = %$error,
            "Store operation degraded"
        )
    };
    ($operation:expr, $error:expr, $($field:tt)*) => {
        tracing::warn!(
            target: "hostd::store",
            operation = $operation,
            error = %$error,
            $($field)*,
            "Store operation degraded"
        )
    };
}
