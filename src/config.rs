//! Run configuration.
//!
//! Built from defaults, then an optional TOML file, then command-line flags
//! (see `cli`). The core only ever sees the merged [`Config`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::snapshot::{default_name, validate_name, SnapshotId, Subvolume};

/// Lowest port the server may listen on or the client may target.
pub const MIN_PORT: u32 = 1024;

pub const MAX_PORT: u32 = 65535;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `snapsync=debug`.
    pub filter: Option<String>,
    /// Append logs to this file instead of stderr.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Subvolume to back up (client) or the storage root (server).
    pub subvolume: PathBuf,
    /// Snapshot directory, relative to `subvolume`.
    pub destination_subvolume: PathBuf,
    /// Wire name of the subvolume; defaults to the last path component.
    pub name: Option<String>,
    pub label: String,
    pub server: bool,
    pub host: String,
    /// Kept wider than `u16` so out-of-range values reach validation.
    pub port: u32,
    pub bind: String,
    pub compress: bool,
    pub create_snapshot: bool,
    pub connect_timeout_secs: u64,
    /// Give up on a peer that sends nothing for this long.
    pub idle_timeout_secs: u64,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subvolume: PathBuf::from("/"),
            destination_subvolume: PathBuf::from(".snapshots"),
            name: None,
            label: "backup".to_string(),
            server: false,
            host: "localhost".to_string(),
            port: 1234,
            bind: "0.0.0.0".to_string(),
            compress: false,
            create_snapshot: true,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| SyncError::Config(format!("invalid config: {}", e)))
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SyncError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.expand_paths();
        Ok(config)
    }

    pub fn expand_paths(&mut self) {
        self.subvolume = expand_tilde(&self.subvolume);
        if let Some(file) = self.log.file.as_mut() {
            *file = expand_tilde(file);
        }
    }

    /// Reject settings that would make a run fail later or behave surprisingly.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PORT..=MAX_PORT).contains(&self.port) {
            return Err(SyncError::Config(format!(
                "port {} is outside {}-{}",
                self.port, MIN_PORT, MAX_PORT
            )));
        }
        if self.subvolume.as_os_str().is_empty() {
            return Err(SyncError::Config("subvolume path must not be empty".into()));
        }
        validate_snapshot_dir(&self.destination_subvolume)?;
        validate_name(&self.subvolume_name())?;
        // Labels are validated the same way ids are built.
        SnapshotId::new(&self.label, chrono::Utc::now())?;
        if self.connect_timeout_secs == 0 {
            return Err(SyncError::Config(
                "connect_timeout_secs must be at least 1".into(),
            ));
        }
        if self.idle_timeout_secs == 0 {
            return Err(SyncError::Config("idle_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or(u16::MAX)
    }

    pub fn subvolume_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| default_name(&self.subvolume))
    }

    /// The client's subvolume and its snapshot directory.
    pub fn local_subvolume(&self) -> Result<Subvolume> {
        Subvolume::local(
            self.subvolume_name(),
            &self.subvolume,
            &self.destination_subvolume,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// The snapshot directory is joined onto subvolume paths on both peers.
fn validate_snapshot_dir(dir: &Path) -> Result<()> {
    use std::path::Component;

    if dir.as_os_str().is_empty() {
        return Err(SyncError::Config(
            "destination_subvolume must not be empty".into(),
        ));
    }
    if !dir.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(SyncError::Config(format!(
            "destination_subvolume must be a relative path without '..': {}",
            dir.display()
        )));
    }
    Ok(())
}

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.subvolume_name(), "root");
        assert_eq!(config.port(), 1234);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = Config::from_toml_str(
            r#"
            subvolume = "/home"
            port = 4000
            compress = true

            [log]
            filter = "snapsync=debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.subvolume, PathBuf::from("/home"));
        assert_eq!(config.port, 4000);
        assert!(config.compress);
        assert_eq!(config.label, "backup");
        assert_eq!(config.subvolume_name(), "home");
        assert_eq!(config.log.filter.as_deref(), Some("snapsync=debug"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_toml_str("prot = 1234").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_port_range() {
        for port in [0, 80, 1023, 65536] {
            let config = Config {
                port,
                ..Config::default()
            };
            assert!(
                matches!(config.validate(), Err(SyncError::Config(_))),
                "port {} accepted",
                port
            );
        }
        for port in [1024, 65535] {
            let config = Config {
                port,
                ..Config::default()
            };
            assert!(config.validate().is_ok());
        }
    }

    #[test]
    fn test_snapshot_dir_must_stay_inside() {
        for dir in ["../elsewhere", "/abs", ""] {
            let config = Config {
                destination_subvolume: PathBuf::from(dir),
                ..Config::default()
            };
            assert!(config.validate().is_err(), "{} accepted", dir);
        }
    }

    #[test]
    fn test_bad_name_and_label() {
        let config = Config {
            name: Some("a/b".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            label: "has space".into(),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            label: "x".repeat(300),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn test_timeouts_must_be_positive() {
        let config = Config {
            idle_timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert_eq!(Config::default().idle_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_local_subvolume_layout() {
        let config = Config {
            subvolume: PathBuf::from("/data"),
            ..Config::default()
        };
        let subvolume = config.local_subvolume().unwrap();
        assert_eq!(subvolume.name, "data");
        assert_eq!(subvolume.snapshot_dir, PathBuf::from("/data/.snapshots"));
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        assert_eq!(expand_tilde(Path::new("~")), home);
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
    }
}
