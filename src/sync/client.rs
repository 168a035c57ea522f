//! Client entry point: one backup run of the configured subvolume.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::driver::SubvolumeDriver;
use crate::error::{Result, SyncError};
use crate::sync::{BackupRun, RunOptions, RunReport};
use crate::transport::ServerSession;

/// Lock file guarding a subvolume against concurrent runs on one host.
const LOCK_FILE_NAME: &str = ".snapsync.lock";

/// Back up the configured subvolume to the configured server.
///
/// The configuration is validated before the driver or the network is
/// touched.
pub async fn run_backup(
    config: &Config,
    driver: Arc<dyn SubvolumeDriver>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    config.validate()?;

    let subvolume = config.local_subvolume()?;
    let options = RunOptions {
        label: config.label.clone(),
        create_snapshot: config.create_snapshot,
        compress: config.compress,
        idle_timeout: config.idle_timeout(),
    };
    tracing::info!(
        subvolume = %subvolume.name,
        path = %subvolume.path.display(),
        server = %format!("{}:{}", config.host, config.port()),
        "Starting backup run"
    );

    let mut run = BackupRun::new(driver, subvolume, options, cancel);

    run.prepare().await?;
    // Drivers without an on-disk snapshot dir run unlocked.
    let _lock = if run.subvolume().snapshot_dir.is_dir() {
        Some(RunLock::acquire(
            &run.subvolume().snapshot_dir,
            &run.subvolume().name,
        )?)
    } else {
        None
    };
    run.take_snapshot().await?;

    let mut session =
        ServerSession::connect(&config.host, config.port(), config.connect_timeout()).await?;
    let (reader, writer) = session.split();
    let report = run.sync_with(reader, writer).await?;

    match &report.failed {
        None => tracing::info!(
            subvolume = %report.subvolume,
            sent = report.sent.len(),
            already_present = report.already_present,
            bytes = report.bytes_sent,
            "Backup completed"
        ),
        Some(failed) => tracing::error!(
            subvolume = %report.subvolume,
            sent = report.sent.len(),
            snapshot = %failed.snapshot,
            kind = %failed.kind,
            "Backup aborted: {}",
            failed.message
        ),
    }

    Ok(report)
}

/// Exclusive advisory lock held for the duration of a run.
struct RunLock {
    file: File,
}

impl RunLock {
    fn acquire(dir: &Path, subvolume: &str) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| SyncError::Busy(subvolume.to_string()))?;
        Ok(Self { file })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;

    #[tokio::test]
    async fn test_invalid_port_rejected_before_driver_calls() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/data"));
        let config = Config {
            subvolume: "/data".into(),
            port: 80,
            ..Config::default()
        };

        let err = run_backup(&config, driver.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Config(_)), "{:?}", err);
        assert_eq!(driver.call_count(), 0);
    }

    #[test]
    fn test_second_lock_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let first = RunLock::acquire(dir.path(), "data").unwrap();
        let err = RunLock::acquire(dir.path(), "data").err().unwrap();
        assert!(matches!(err, SyncError::Busy(_)));

        drop(first);
        assert!(RunLock::acquire(dir.path(), "data").is_ok());
    }
}
