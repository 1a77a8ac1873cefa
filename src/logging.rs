//! Logging setup for the gateway using tracing.
//!
//! Records go to stderr and to `iacp-gateway.log` in a daily rolling file.
//! The file lives in `$IACP_HOME/logs` when `IACP_HOME` is set, otherwise in
//! the platform data directory (e.g. `~/.local/share/iacp-gateway/logs` on
//! Linux). `RUST_LOG` overrides the default `info,iacp_gateway=debug` filter.

use anyhow::Result;
use std::ffi::OsString;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,iacp_gateway=debug";

/// Initialize logging with a daily rolling file and stderr output.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "iacp-gateway.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::debug!("Log directory: {}", log_dir.display());

    Ok((guard, log_dir))
}

fn get_log_dir() -> Result<PathBuf> {
    log_dir_for(std::env::var_os(crate::config::HOME_ENV))
}

/// Log directory: `<home>/logs` when a home override is given, else the
/// platform data dir.
fn log_dir_for(home: Option<OsString>) -> Result<PathBuf> {
    if let Some(home) = home {
        return Ok(PathBuf::from(home).join("logs"));
    }

    let dirs = directories::ProjectDirs::from("org", "iacp", "iacp-gateway")
        .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;

    Ok(dirs.data_dir().join("logs"))
}

/// Console-only logging for tests. Safe to call more than once.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
