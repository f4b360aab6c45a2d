//! Tracing setup: stdout plus an optional per-run log artifact.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log artifact path for a run: `<log_dir>/<source_table>_<run_id>.log`.
pub fn log_path(log_dir: &Path, source_table: &str, run_id: &str) -> PathBuf {
    log_dir.join(format!("{source_table}_{run_id}.log"))
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. When `log_file` is given
/// every event is also written there without ANSI colors.
pub fn init(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(())
}
