//! Subvolume driver interface.
//!
//! The synchronization engine only talks to the filesystem through
//! [`SubvolumeDriver`]. `btrfs` shells out to btrfs-progs; `memory` keeps
//! everything in process and is what the test suites run against.

pub mod btrfs;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;

use crate::error::DriverError;
use crate::snapshot::{Snapshot, SnapshotId, Subvolume};

pub use btrfs::BtrfsDriver;
pub use memory::MemoryDriver;

/// Lazy, finite, non-restartable snapshot byte stream.
///
/// An `Err` item means the producer failed; consumers must treat everything
/// received so far as unusable.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// A snapshot stream arriving from a peer.
pub struct IncomingSnapshot {
    pub id: SnapshotId,
    /// Delta base declared by the sender; `None` for a full stream.
    pub parent: Option<SnapshotId>,
    pub stream: ByteStream,
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[async_trait]
pub trait SubvolumeDriver: Send + Sync {
    /// Check that the subvolume is usable. Must succeed before any other call.
    async fn prepare(&self, subvolume: &Subvolume) -> DriverResult<()>;

    /// Snapshots of `subvolume` in creation order. Empty when none exist yet.
    async fn list_snapshots(&self, subvolume: &Subvolume) -> DriverResult<Vec<Snapshot>>;

    /// Take a read-only snapshot whose parent is the current chain tail.
    async fn create_snapshot(&self, subvolume: &Subvolume, label: &str) -> DriverResult<Snapshot>;

    /// Stream `snapshot` as a delta against `parent`, or in full without one.
    async fn send_incremental(
        &self,
        subvolume: &Subvolume,
        snapshot: &Snapshot,
        parent: Option<&SnapshotId>,
    ) -> DriverResult<ByteStream>;

    /// Materialize an incoming stream as a new snapshot.
    ///
    /// Atomic: on any error nothing of the incoming snapshot is left behind.
    async fn receive_incremental(
        &self,
        subvolume: &Subvolume,
        incoming: IncomingSnapshot,
    ) -> DriverResult<Snapshot>;
}

/// Derive chain parents from creation order.
pub(crate) fn link_chain(subvolume: &str, mut ids: Vec<SnapshotId>) -> Vec<Snapshot> {
    ids.sort();
    ids.dedup();
    let mut parent: Option<SnapshotId> = None;
    ids.into_iter()
        .map(|id| Snapshot {
            id: id.clone(),
            parent: parent.replace(id),
            subvolume: subvolume.to_string(),
        })
        .collect()
}
