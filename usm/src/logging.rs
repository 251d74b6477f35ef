//! Tracing setup for embedders that have no subscriber of their own.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use usm_shared::errors::{UsmError, UsmResult};

const LOG_FILE_NAME: &str = "usm.log";
const DEFAULT_FILTER: &str = "info";

/// Keeps the background writer alive for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Log to `<log_dir>/usm.log` with daily rotation.
///
/// Respects `RUST_LOG` (default `info`). Only the first call installs a
/// subscriber; later calls, or calls after the host installed its own, are
/// no-ops.
pub fn init_file_logging(log_dir: &Path) -> UsmResult<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(log_dir).map_err(|e| {
        UsmError::Config(format!(
            "failed to create log directory {}: {}",
            log_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if FILE_GUARD.set(guard).is_err() {
        // Lost a race with another initializer.
        return Ok(());
    }

    if !install_subscriber(non_blocking, env_filter()) {
        tracing::debug!("A tracing subscriber is already installed; file logging skipped");
    }
    Ok(())
}

/// Filter from `RUST_LOG`, falling back to `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber writing plain text to `writer`.
///
/// Returns `false` when another subscriber is already installed.
fn install_subscriber(writer: NonBlocking, filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false),
        )
        .try_init()
        .is_ok()
}
