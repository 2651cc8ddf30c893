//! Tracing setup for the binary.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_DIRECTIVE: &str = "rollcall=info";

/// Install the global subscriber: stderr plus a daily rolling file under
/// `log_dir`. `RUST_LOG` overrides the default `rollcall=info` filter.
///
/// Keep the returned guard alive for the life of the process or buffered
/// file output is lost.
pub fn init(log_dir: &Path) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (non_blocking, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, "log"));

  let filter = EnvFilter::builder()
    .with_default_directive(LevelFilter::WARN.into())
    .try_from_env()
    .or_else(|_| EnvFilter::try_new(DEFAULT_DIRECTIVE))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

/// Log directory next to the default database.
pub fn default_dir() -> Option<std::path::PathBuf> {
  dirs::data_dir().map(|d| d.join("rollcall").join("logs"))
}
