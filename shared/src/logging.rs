//! Shared logging utilities for consistent tracing across gateway and workers
//!
//! Output always goes to stderr: a worker's stdout is its frame channel.

use crate::types::ProcessRole;
use chrono::{DateTime, Utc};

/// Build the filter directive for a role at the given base level
pub fn filter_directive(role: &ProcessRole, log_level: Option<&str>) -> String {
    let base_level = log_level.unwrap_or("info");
    let mut directives: Vec<String> = role
        .filter_targets()
        .iter()
        .map(|target| format!("{target}={base_level}"))
        .collect();
    directives.push("reqwest=warn".to_string());
    directives.push("hyper=warn".to_string());
    directives.join(",")
}

/// Initialize the tracing subscriber for the registered process role
///
/// `RUST_LOG` takes precedence over `log_level` when set. Safe to call more
/// than once; later calls are ignored.
pub fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::{fmt, EnvFilter};

    let role = ProcessRole::current();
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(role, log_level)));

    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}

/// Wall-clock stamp attached to every role-tagged event
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}

/// `info!` tagged with the emitting role
#[macro_export]
macro_rules! process_info {
    ($role:expr, $($arg:tt)*) => {
        tracing::info!(process = %$role, timestamp = $crate::logging::format_timestamp(), $($arg)*)
    };
}

/// `warn!` tagged with the emitting role
#[macro_export]
macro_rules! process_warn {
    ($role:expr, $($arg:tt)*) => {
        tracing::warn!(process = %$role, timestamp = $crate::logging::format_timestamp(), $($arg)*)
    };
}

/// `error!` tagged with the emitting role
#[macro_export]
macro_rules! process_error {
    ($role:expr, $($arg:tt)*) => {
        tracing::error!(process = %$role, timestamp = $crate::logging::format_timestamp(), $($arg)*)
    };
}

/// `debug!` tagged with the emitting role
#[macro_export]
macro_rules! process_debug {
    ($role:expr, $($arg:tt)*) => {
        tracing::debug!(process = %$role, timestamp = $crate::logging::format_timestamp(), $($arg)*)
    };
}

/// Lifecycle event: a gateway or worker is coming up
pub fn log_startup(role: &ProcessRole, what: &str) {
    process_info!(role, "🚀 Starting {}", what);
}

/// Lifecycle event: a gateway or worker is going away
pub fn log_shutdown(role: &ProcessRole, reason: &str) {
    process_info!(role, "🛑 Shutting down: {}", reason);
}

/// Failed step, with the error also recorded as a field
pub fn log_error(role: &ProcessRole, step: &str, error: &dyn std::fmt::Display) {
    process_error!(role, error = %error, "❌ {} failed: {}", step, error);
}

pub fn log_success(role: &ProcessRole, message: &str) {
    process_info!(role, "✅ {}", message);
}
