//! Receiver for one incoming snapshot on the server.
//!
//! Data frames are decompressed, hashed and forwarded into the driver's
//! `receive_incremental`, which runs as its own task. The stream is only
//! closed cleanly once the sender's length and checksum have been verified;
//! any other ending is delivered to the driver as a stream error so it can
//! roll back.

use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::driver::{DriverResult, IncomingSnapshot, SubvolumeDriver};
use crate::snapshot::{Snapshot, SnapshotId, Subvolume};
use crate::streaming::channel::{chunk_channel, ChunkSender, StreamDigest, DATA_CHUNK_SIZE};
use crate::streaming::protocol::{Data, DataFlags, ErrorCode, TransferEnd, TransferResult};

/// Receiver state for one snapshot
pub struct Receiver {
    snapshot: SnapshotId,
    tx: Option<ChunkSender>,
    digest: StreamDigest,
    corrupt: Option<String>,
    task: JoinHandle<DriverResult<Snapshot>>,
}

impl Receiver {
    /// Start the driver receive task for `snapshot`.
    pub fn start(
        driver: Arc<dyn SubvolumeDriver>,
        subvolume: Subvolume,
        snapshot: SnapshotId,
        parent: Option<SnapshotId>,
    ) -> Self {
        let (tx, rx) = chunk_channel();
        let incoming = IncomingSnapshot {
            id: snapshot.clone(),
            parent,
            stream: rx.boxed(),
        };
        let task =
            tokio::spawn(async move { driver.receive_incremental(&subvolume, incoming).await });

        Self {
            snapshot,
            tx: Some(tx),
            digest: StreamDigest::new(),
            corrupt: None,
            task,
        }
    }

    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    pub fn bytes_received(&self) -> u64 {
        self.digest.bytes()
    }

    /// Forward one Data frame to the driver.
    pub async fn handle_data(&mut self, data: Data) {
        if self.corrupt.is_some() {
            return;
        }

        let chunk = if data.flags.contains(DataFlags::COMPRESSED) {
            match zstd::bulk::decompress(&data.data, DATA_CHUNK_SIZE) {
                Ok(raw) => bytes::Bytes::from(raw),
                Err(e) => {
                    self.fail_stream(format!("undecodable compressed chunk: {}", e))
                        .await;
                    return;
                }
            }
        } else {
            data.data
        };

        self.digest.update(&chunk);
        if let Some(tx) = self.tx.as_mut() {
            // The driver stopped reading; its result explains why.
            if tx.send(Ok(chunk)).await.is_err() {
                self.tx = None;
            }
        }
    }

    /// Verify the sender's trailer and wait for the driver.
    pub async fn finish(mut self, end: TransferEnd) -> TransferResult {
        if self.corrupt.is_none() {
            if end.bytes != self.digest.bytes() {
                self.fail_stream(format!(
                    "length mismatch: sender wrote {} bytes, received {}",
                    end.bytes,
                    self.digest.bytes()
                ))
                .await;
            } else if end.checksum != self.digest.checksum() {
                self.fail_stream(format!(
                    "checksum mismatch: expected {:016x}, got {:016x}",
                    end.checksum,
                    self.digest.checksum()
                ))
                .await;
            }
        }

        // Dropping the sender ends the stream.
        self.tx = None;
        let outcome = self.join().await;

        if let Some(reason) = self.corrupt {
            if outcome.is_ok() {
                tracing::warn!(snapshot = %self.snapshot, "Driver accepted a stream that failed verification");
            }
            return TransferResult::failed(
                self.snapshot.to_string(),
                ErrorCode::CorruptStream,
                reason,
            );
        }

        match outcome {
            Ok(snapshot) => TransferResult::ok(snapshot.id.to_string()),
            Err((code, message)) => TransferResult::failed(self.snapshot.to_string(), code, message),
        }
    }

    /// Abandon the transfer; the driver sees a stream error and rolls back.
    pub async fn abort(mut self, reason: &str) -> TransferResult {
        self.fail_stream(reason.to_string()).await;
        self.tx = None;
        let _ = self.join().await;
        TransferResult::failed(self.snapshot.to_string(), ErrorCode::Aborted, reason)
    }

    async fn fail_stream(&mut self, reason: String) {
        if let Some(mut tx) = self.tx.take() {
            let _ = tx
                .send(Err(io::Error::new(io::ErrorKind::InvalidData, reason.clone())))
                .await;
        }
        self.corrupt.get_or_insert(reason);
    }

    async fn join(&mut self) -> Result<Snapshot, (ErrorCode, String)> {
        match (&mut self.task).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(e)) => Err((e.code(), e.to_string())),
            Err(e) => Err((ErrorCode::DriverFailure, format!("receive task failed: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use bytes::Bytes;
    use std::path::Path;

    fn mirror() -> Subvolume {
        Subvolume::mirror("data", Path::new("/backup"), Path::new(".snapshots")).unwrap()
    }

    fn trailer(data: &[u8]) -> TransferEnd {
        TransferEnd {
            bytes: data.len() as u64,
            checksum: xxhash_rust::xxh3::xxh3_64(data),
        }
    }

    #[tokio::test]
    async fn test_receive_verified_stream() {
        let driver = Arc::new(MemoryDriver::new());
        let id = SnapshotId::next_after("backup", None).unwrap();

        let mut receiver = Receiver::start(driver.clone(), mirror(), id.clone(), None);
        receiver
            .handle_data(Data {
                flags: DataFlags::empty(),
                data: Bytes::from_static(b"snapshot "),
            })
            .await;
        let compressed = zstd::bulk::compress(b"payload", 3).unwrap();
        receiver
            .handle_data(Data {
                flags: DataFlags::COMPRESSED,
                data: Bytes::from(compressed),
            })
            .await;
        assert_eq!(receiver.bytes_received(), 16);

        let result = receiver.finish(trailer(b"snapshot payload")).await;
        assert!(result.is_ok(), "{:?}", result);
        assert_eq!(
            driver.snapshot_data(&mirror(), &id).await.unwrap(),
            Bytes::from_static(b"snapshot payload")
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_rolls_back() {
        let driver = Arc::new(MemoryDriver::new());
        let id = SnapshotId::next_after("backup", None).unwrap();

        let mut receiver = Receiver::start(driver.clone(), mirror(), id.clone(), None);
        receiver
            .handle_data(Data {
                flags: DataFlags::empty(),
                data: Bytes::from_static(b"tampered"),
            })
            .await;

        let mut end = trailer(b"tampered");
        end.checksum ^= 1;
        let result = receiver.finish(end).await;

        assert_eq!(result.code, ErrorCode::CorruptStream);
        assert!(driver.snapshot_data(&mirror(), &id).await.is_none());
    }

    #[tokio::test]
    async fn test_abort_rolls_back() {
        let driver = Arc::new(MemoryDriver::new());
        let id = SnapshotId::next_after("backup", None).unwrap();

        let mut receiver = Receiver::start(driver.clone(), mirror(), id.clone(), None);
        receiver
            .handle_data(Data {
                flags: DataFlags::empty(),
                data: Bytes::from_static(b"half"),
            })
            .await;
        let result = receiver.abort("client went away").await;

        assert_eq!(result.code, ErrorCode::Aborted);
        assert!(driver.list_snapshots(&mirror()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_reported() {
        let driver = Arc::new(MemoryDriver::new());
        let parent = SnapshotId::next_after("backup", None).unwrap();
        let id = SnapshotId::next_after("backup", Some(&parent)).unwrap();

        let mut receiver = Receiver::start(driver, mirror(), id, Some(parent));
        receiver
            .handle_data(Data {
                flags: DataFlags::empty(),
                data: Bytes::from_static(b"delta"),
            })
            .await;
        let result = receiver.finish(trailer(b"delta")).await;

        assert_eq!(result.code, ErrorCode::ParentNotFound);
    }
}
