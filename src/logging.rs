//! # Logging
//!
//! Structured logging for backup runs and bridge traffic, built directly on
//! `tracing`. One guarded [`init`] installs the env-filter, a console layer
//! (JSON or pretty), and an optional daily-rolling file layer; every log
//! site tags a [`LogCategory`] so operators can filter per subsystem.
//!
//! INFO marks phase transitions, WARN per-item failures, ERROR job-level
//! failures. Audit and performance events carry their structured payload
//! inline; the job manifest in the object store remains the authoritative
//! record of a run.

use metrics::{counter, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::{BackupForgeError, Result};

/// Set once a subscriber has been installed by this crate
static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Keeps the non-blocking file writer flushing for the process lifetime;
/// dropping it would silently stop file output
static FILE_WRITER_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Subsystem tag attached to every log event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    /// Backup job lifecycle events
    Backup,
    /// Pipeline worker and work-item events
    Pipeline,
    /// Object store interactions
    ObjectStore,
    /// Cluster API interactions and discovery
    ClusterApi,
    /// Git operations
    Git,
    /// Integration bridge, webhooks, component registry
    Bridge,
    /// Retention and cleanup passes
    Retention,
    /// System startup, shutdown, configuration
    System,
    /// Audit trail events
    Audit,
    /// Performance metrics and timing
    Performance,
    /// Error events
    Error,
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCategory::Backup => write!(f, "backup"),
            LogCategory::Pipeline => write!(f, "pipeline"),
            LogCategory::ObjectStore => write!(f, "object_store"),
            LogCategory::ClusterApi => write!(f, "cluster_api"),
            LogCategory::Git => write!(f, "git"),
            LogCategory::Bridge => write!(f, "bridge"),
            LogCategory::Retention => write!(f, "retention"),
            LogCategory::System => write!(f, "system"),
            LogCategory::Audit => write!(f, "audit"),
            LogCategory::Performance => write!(f, "performance"),
            LogCategory::Error => write!(f, "error"),
        }
    }
}

/// Logging setup for the binary and the bridge server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingOptions {
    /// Fallback filter directive when `RUST_LOG` is unset
    pub default_filter: String,
    /// Emit console output as JSON (pretty text otherwise)
    pub json_format: bool,
    /// Directory for daily-rolled log files; console-only when `None`
    pub log_dir: Option<String>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            json_format: true,
            log_dir: None,
        }
    }
}

/// Install the tracing subscriber once for the process
///
/// Safe to call repeatedly; later calls are no-ops. When another subscriber
/// is already installed (test harnesses), the helpers below still emit into
/// it.
pub fn init(options: &LoggingOptions) -> Result<()> {
    if TRACING_INITIALIZED
        .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
        .is_err()
    {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.default_filter.clone()));

    let console_layer = fmt::layer().with_target(true);
    let mut layers = if options.json_format {
        vec![console_layer.json().boxed()]
    } else {
        vec![console_layer.pretty().boxed()]
    };

    if let Some(dir) = &options.log_dir {
        if let Err(e) = ensure_log_dir(dir) {
            TRACING_INITIALIZED.store(false, Ordering::Relaxed);
            return Err(e);
        }
        let (writer, guard) = non_blocking(rolling::daily(dir, "backup-forge.log"));
        let _ = FILE_WRITER_GUARD.set(guard);
        layers.push(fmt::layer().with_writer(writer).with_ansi(false).json().boxed());
    }

    // A subscriber installed elsewhere wins the race; events still flow
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init();
    Ok(())
}

fn ensure_log_dir(dir: &str) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        BackupForgeError::Configuration(format!("failed to create log directory {dir}: {e}"))
    })
}

fn count_event(level: &'static str, category: LogCategory) {
    counter!("log_events_total", 1, "level" => level, "category" => category.to_string());
}

/// Phase transitions and routine progress
pub fn log_info(category: LogCategory, message: &str) {
    count_event("info", category);
    info!(category = %category, "{message}");
}

/// Per-item failures and degraded-but-continuing conditions
pub fn log_warn(category: LogCategory, message: &str) {
    count_event("warn", category);
    warn!(category = %category, "{message}");
}

/// Job-level failures
pub fn log_error(category: LogCategory, message: &str) {
    count_event("error", category);
    error!(category = %category, "{message}");
}

/// Audit trail entry with its structured payload inline
pub fn log_audit(message: &str, data: serde_json::Value) {
    count_event("info", LogCategory::Audit);
    info!(category = %LogCategory::Audit, data = %data, "{message}");
}

/// Timed-operation record; feeds the duration histogram
pub fn log_performance(message: &str, duration_ms: u64, data: serde_json::Value) {
    count_event("info", LogCategory::Performance);
    histogram!("operation_duration_ms", duration_ms as f64);
    info!(category = %LogCategory::Performance, duration_ms, data = %data, "{message}");
}
