//! Process-wide `tracing` subscriber setup.

use crate::config::LogLevel;
use crate::error::Result;
use once_cell::sync::OnceCell;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. Later calls are no-ops, as is the
/// first call when the host application already installed a subscriber.
/// `RUST_LOG` takes precedence over `level`.
pub fn init(level: LogLevel, log_file: Option<&Path>) -> Result<()> {
    INIT.get_or_try_init(|| -> Result<()> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_names(true);

        let installed = match log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                builder
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .try_init()
            }
            None => builder.with_writer(std::io::stderr).try_init(),
        };
        if installed.is_err() {
            tracing::debug!("global subscriber already installed");
        }
        Ok(())
    })?;
    Ok(())
}
