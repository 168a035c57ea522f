//! Logging setup for the binary.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Directive used when neither the config nor the environment sets one.
pub const DEFAULT_FILTER: &str = "snapsync=info";

/// Filter for the `-v`/`-q` count on the command line.
pub fn filter_for_verbosity(verbose: u8, quiet: bool) -> &'static str {
    match (quiet, verbose) {
        (true, _) => "snapsync=warn",
        (false, 0) => DEFAULT_FILTER,
        (false, 1) => "snapsync=debug",
        (false, _) => "snapsync=trace",
    }
}

/// Install the global subscriber. Logs go to stderr unless a file is set.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        .context("invalid log filter")?;

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .try_init()
                .context("logging already initialized")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(filter)
                .try_init()
                .context("logging already initialized")?;
        }
    }
    Ok(())
}
