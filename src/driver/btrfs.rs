//! btrfs driver - shells out to btrfs-progs.
//!
//! Snapshots are read-only subvolumes named by their [`SnapshotId`] inside the
//! subvolume's snapshot directory. Received streams land in a private staging
//! directory first and are renamed into place only once `btrfs receive`
//! succeeds, so a failed receive never shows up in the chain.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tokio_util::io::ReaderStream;

use super::{link_chain, ByteStream, DriverResult, IncomingSnapshot, SubvolumeDriver};
use crate::error::DriverError;
use crate::snapshot::{Snapshot, SnapshotId, Subvolume};
use crate::streaming::channel::DATA_CHUNK_SIZE;

/// Prefix of the staging directories used while receiving.
const STAGING_PREFIX: &str = ".incoming-";

pub struct BtrfsDriver {
    binary: PathBuf,
}

impl Default for BtrfsDriver {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("btrfs"),
        }
    }
}

impl BtrfsDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific btrfs-progs binary instead of the one on `PATH`.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a btrfs command to completion; non-zero exit becomes an error.
    async fn run(&self, op: &'static str, mut cmd: Command, target: &Path) -> DriverResult<()> {
        let output = cmd
            .output()
            .await
            .map_err(|e| DriverError::failed(op, format!("failed to execute btrfs: {}", e)))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(op, target, &stderr))
    }

    /// Remove anything `btrfs receive` left in a staging directory.
    async fn discard_staging(&self, staging: &Path) {
        let mut entries = match tokio::fs::read_dir(staging).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let cmd = self.command([OsStr::new("subvolume"), OsStr::new("delete"), path.as_os_str()]);
            if let Err(e) = self.run("delete partial snapshot", cmd, &path).await {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial snapshot");
            }
        }
    }
}

/// Map btrfs-progs stderr onto driver errors.
fn classify(op: &'static str, target: &Path, stderr: &str) -> DriverError {
    let lower = stderr.to_lowercase();
    if lower.contains("no space left") {
        DriverError::InsufficientSpace(target.to_path_buf())
    } else if lower.contains("permission denied") || lower.contains("operation not permitted") {
        DriverError::PermissionDenied(target.to_path_buf())
    } else if lower.contains("cannot find parent") {
        DriverError::ParentNotFound(stderr.to_string())
    } else {
        DriverError::failed(op, stderr.to_string())
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut out).await;
    }
    out.trim().to_string()
}

#[async_trait]
impl SubvolumeDriver for BtrfsDriver {
    async fn prepare(&self, subvolume: &Subvolume) -> DriverResult<()> {
        let path = &subvolume.path;
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(DriverError::NotMountable {
                    path: path.clone(),
                    reason: "not a directory".to_string(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(DriverError::PermissionDenied(path.clone()))
            }
            Err(_) => return Err(DriverError::NotFound(path.clone())),
        }

        let output = self
            .command([OsStr::new("subvolume"), OsStr::new("show"), path.as_os_str()])
            .output()
            .await
            .map_err(|e| DriverError::NotMountable {
                path: path.clone(),
                reason: format!("btrfs-progs unavailable: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(match classify("prepare", path, &stderr) {
                DriverError::PermissionDenied(p) => DriverError::PermissionDenied(p),
                _ => DriverError::NotMountable {
                    path: path.clone(),
                    reason: stderr,
                },
            });
        }

        tokio::fs::create_dir_all(&subvolume.snapshot_dir)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    DriverError::PermissionDenied(subvolume.snapshot_dir.clone())
                }
                _ => DriverError::failed("prepare", e.to_string()),
            })?;

        tracing::debug!(subvolume = %subvolume.name, path = %path.display(), "Subvolume ready");
        Ok(())
    }

    async fn list_snapshots(&self, subvolume: &Subvolume) -> DriverResult<Vec<Snapshot>> {
        let mut entries = match tokio::fs::read_dir(&subvolume.snapshot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DriverError::failed("list snapshots", e.to_string())),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DriverError::failed("list snapshots", e.to_string()))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') {
                continue;
            }
            match name.parse::<SnapshotId>() {
                Ok(id) => ids.push(id),
                Err(_) => tracing::debug!(entry = %name, "Ignoring non-snapshot entry"),
            }
        }

        Ok(link_chain(&subvolume.name, ids))
    }

    async fn create_snapshot(&self, subvolume: &Subvolume, label: &str) -> DriverResult<Snapshot> {
        tokio::fs::create_dir_all(&subvolume.snapshot_dir)
            .await
            .map_err(|e| DriverError::failed("create snapshot", e.to_string()))?;

        let parent = self.list_snapshots(subvolume).await?.pop().map(|s| s.id);
        let id = SnapshotId::next_after(label, parent.as_ref())
            .map_err(|e| DriverError::failed("create snapshot", e.to_string()))?;
        let target = subvolume.snapshot_path(&id);

        tracing::info!(subvolume = %subvolume.name, snapshot = %id, "Creating read-only snapshot");

        let cmd = self.command([
            OsStr::new("subvolume"),
            OsStr::new("snapshot"),
            OsStr::new("-r"),
            subvolume.path.as_os_str(),
            target.as_os_str(),
        ]);
        self.run("create snapshot", cmd, &subvolume.snapshot_dir)
            .await?;

        Ok(Snapshot {
            id,
            parent,
            subvolume: subvolume.name.clone(),
        })
    }

    async fn send_incremental(
        &self,
        subvolume: &Subvolume,
        snapshot: &Snapshot,
        parent: Option<&SnapshotId>,
    ) -> DriverResult<ByteStream> {
        let path = subvolume.snapshot_path(&snapshot.id);
        if !path.exists() {
            return Err(DriverError::SnapshotNotFound(snapshot.id.to_string()));
        }

        let mut args = vec![OsStr::new("send").to_os_string()];
        if let Some(parent) = parent {
            let parent_path = subvolume.snapshot_path(parent);
            if !parent_path.exists() {
                return Err(DriverError::SnapshotNotFound(parent.to_string()));
            }
            args.push("-p".into());
            args.push(parent_path.into_os_string());
        }
        args.push(path.into_os_string());

        let mut cmd = self.command(args);
        cmd.stdout(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::failed("send", format!("failed to execute btrfs: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::failed("send", "failed to open stdout"))?;
        let stderr = tokio::spawn(read_stderr(child.stderr.take()));

        let body = ReaderStream::with_capacity(stdout, DATA_CHUNK_SIZE);

        // The exit status is only known once stdout is drained.
        let trailer = stream::once(async move {
            let status = child.wait().await;
            let stderr = stderr.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => None,
                Ok(status) => Some(Err(io::Error::other(format!(
                    "btrfs send exited with {}: {}",
                    status, stderr
                )))),
                Err(e) => Some(Err(e)),
            }
        })
        .filter_map(|item| async move { item });

        Ok(body.chain(trailer).boxed())
    }

    async fn receive_incremental(
        &self,
        subvolume: &Subvolume,
        incoming: IncomingSnapshot,
    ) -> DriverResult<Snapshot> {
        let IncomingSnapshot {
            id,
            parent,
            mut stream,
        } = incoming;

        if let Some(parent) = &parent {
            if !subvolume.snapshot_path(parent).exists() {
                return Err(DriverError::ParentNotFound(parent.to_string()));
            }
        }
        let target = subvolume.snapshot_path(&id);
        if target.exists() {
            return Err(DriverError::failed(
                "receive",
                format!("snapshot {} already exists", id),
            ));
        }

        tokio::fs::create_dir_all(&subvolume.snapshot_dir)
            .await
            .map_err(|e| DriverError::failed("receive", e.to_string()))?;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&subvolume.snapshot_dir)
            .map_err(|e| DriverError::failed("receive", e.to_string()))?;

        let mut cmd = self.command([
            OsStr::new("receive"),
            OsStr::new("-e"),
            staging.path().as_os_str(),
        ]);
        cmd.stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::failed("receive", format!("failed to execute btrfs: {}", e)))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::failed("receive", "failed to open stdin"))?;
        let stderr = tokio::spawn(read_stderr(child.stderr.take()));

        let mut stream_error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    // A write error means btrfs exited early; its status says why.
                    if stdin.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    stream_error = Some(e);
                    break;
                }
            }
        }
        drop(stdin);

        if let Some(e) = stream_error {
            let _ = child.kill().await;
            self.discard_staging(staging.path()).await;
            return Err(DriverError::CorruptStream(e.to_string()));
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DriverError::failed("receive", e.to_string()))?;
        let stderr = stderr.await.unwrap_or_default();
        if !status.success() {
            self.discard_staging(staging.path()).await;
            return Err(match classify("receive", &subvolume.snapshot_dir, &stderr) {
                DriverError::Failed { .. } => DriverError::CorruptStream(stderr),
                other => other,
            });
        }

        let mut entries = tokio::fs::read_dir(staging.path())
            .await
            .map_err(|e| DriverError::failed("receive", e.to_string()))?;
        let received = entries
            .next_entry()
            .await
            .map_err(|e| DriverError::failed("receive", e.to_string()))?
            .ok_or_else(|| DriverError::CorruptStream("stream produced no snapshot".into()))?;

        if let Err(e) = tokio::fs::rename(received.path(), &target).await {
            self.discard_staging(staging.path()).await;
            return Err(DriverError::failed("receive", e.to_string()));
        }

        tracing::info!(subvolume = %subvolume.name, snapshot = %id, "Snapshot received");
        Ok(Snapshot {
            id,
            parent,
            subvolume: subvolume.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_stderr() {
        let target = Path::new("/mnt/data");
        assert!(matches!(
            classify("create snapshot", target, "ERROR: No space left on device"),
            DriverError::InsufficientSpace(_)
        ));
        assert!(matches!(
            classify("prepare", target, "ERROR: Operation not permitted"),
            DriverError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("receive", target, "ERROR: cannot find parent subvolume"),
            DriverError::ParentNotFound(_)
        ));
        assert!(matches!(
            classify("send", target, "ERROR: something else"),
            DriverError::Failed { op: "send", .. }
        ));
    }

    #[tokio::test]
    async fn test_prepare_missing_path() {
        let tmp = TempDir::new().unwrap();
        let sub = Subvolume::local(
            "missing",
            &tmp.path().join("missing"),
            Path::new(".snapshots"),
        )
        .unwrap();

        let result = BtrfsDriver::new().prepare(&sub).await;
        assert!(matches!(result, Err(DriverError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_prepare_without_btrfs_binary() {
        let tmp = TempDir::new().unwrap();
        let sub = Subvolume::local("data", tmp.path(), Path::new(".snapshots")).unwrap();

        let driver = BtrfsDriver::with_binary(tmp.path().join("no-such-btrfs"));
        let result = driver.prepare(&sub).await;
        assert!(matches!(result, Err(DriverError::NotMountable { .. })));
    }

    #[tokio::test]
    async fn test_list_snapshots_skips_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let sub = Subvolume::local("data", tmp.path(), Path::new(".snapshots")).unwrap();
        assert!(BtrfsDriver::new().list_snapshots(&sub).await.unwrap().is_empty());

        let first = SnapshotId::next_after("backup", None).unwrap();
        let second = SnapshotId::next_after("backup", Some(&first)).unwrap();
        std::fs::create_dir_all(sub.snapshot_path(&second)).unwrap();
        std::fs::create_dir_all(sub.snapshot_path(&first)).unwrap();
        std::fs::create_dir_all(sub.snapshot_dir.join("not-a-snapshot")).unwrap();
        std::fs::create_dir_all(sub.snapshot_dir.join(".incoming-abc")).unwrap();

        let listed = BtrfsDriver::new().list_snapshots(&sub).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first);
        assert_eq!(listed[1].parent, Some(first));
    }
}
