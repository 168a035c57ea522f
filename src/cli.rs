//! Command-line interface.
//!
//! Flags override the config file, which overrides the built-in defaults.
//! Environment variables are read here and nowhere else.

use clap::Parser;
use std::path::PathBuf;

use crate::config::{expand_tilde, Config};
use crate::error::Result;
use crate::logging;

#[derive(Parser, Debug, Default)]
#[command(
    name = "snapsync",
    version,
    about = "Incremental btrfs snapshot replication over TCP"
)]
pub struct Cli {
    /// Subvolume to back up, or the storage root in server mode [default: /]
    #[arg(long, value_name = "PATH")]
    pub subvolume: Option<PathBuf>,

    /// Snapshot directory relative to the subvolume [default: .snapshots]
    #[arg(long, value_name = "DIR")]
    pub destination_subvolume: Option<PathBuf>,

    /// Run as the receiving server
    #[arg(long)]
    pub server: bool,

    /// Server to connect to [default: localhost]
    #[arg(long)]
    pub host: Option<String>,

    /// Server port, 1024-65535 [default: 1234]
    #[arg(long)]
    pub port: Option<u32>,

    /// Address the server listens on [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<String>,

    /// Subvolume name sent to the server [default: last path component]
    #[arg(long)]
    pub name: Option<String>,

    /// Label used in new snapshot identifiers [default: backup]
    #[arg(long)]
    pub label: Option<String>,

    /// Compress snapshot data on the wire
    #[arg(long)]
    pub compress: bool,

    /// Only send existing snapshots; do not take a new one
    #[arg(long)]
    pub no_snapshot: bool,

    /// Seconds to wait on a silent peer [default: 300]
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// TOML config file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, env = "SNAPSYNC_LOG_PATH", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Log filter directives, e.g. `snapsync=debug`
    #[arg(long = "log", env = "SNAPSYNC_LOG", value_name = "FILTER")]
    pub log_filter: Option<String>,
}

impl Cli {
    /// Merge defaults, the config file and these flags into one config.
    pub fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(subvolume) = self.subvolume {
            config.subvolume = expand_tilde(&subvolume);
        }
        if let Some(dir) = self.destination_subvolume {
            config.destination_subvolume = dir;
        }
        if self.server {
            config.server = true;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.name.is_some() {
            config.name = self.name;
        }
        if let Some(label) = self.label {
            config.label = label;
        }
        if self.compress {
            config.compress = true;
        }
        if self.no_snapshot {
            config.create_snapshot = false;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(file) = self.log_file {
            config.log.file = Some(expand_tilde(&file));
        }

        // An explicit filter wins; -v/-q only replace the default.
        if let Some(filter) = self.log_filter {
            config.log.filter = Some(filter);
        } else if self.verbose > 0 || self.quiet || config.log.filter.is_none() {
            config.log.filter =
                Some(logging::filter_for_verbosity(self.verbose, self.quiet).to_string());
        }

        Ok(config)
    }
}
