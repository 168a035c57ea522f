//! In-process driver.
//!
//! Keeps snapshot payloads in memory keyed by snapshot directory, so a client
//! and a server can run in one process without touching a real filesystem.
//! Failures can be injected per snapshot id.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{link_chain, ByteStream, DriverResult, IncomingSnapshot, SubvolumeDriver};
use crate::error::DriverError;
use crate::snapshot::{Snapshot, SnapshotId, Subvolume};

/// Size of the chunks a sent payload is split into.
const MEMORY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct State {
    mounted: HashSet<PathBuf>,
    contents: HashMap<PathBuf, Bytes>,
    snapshots: HashMap<PathBuf, BTreeMap<SnapshotId, Bytes>>,
    fail_send: HashSet<String>,
    interrupt_stream: HashSet<String>,
    fail_receive: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
    calls: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a path as a valid subvolume.
    pub fn with_subvolume(mut self, path: impl Into<PathBuf>) -> Self {
        self.state.get_mut().mounted.insert(path.into());
        self
    }

    /// Payload captured by the next snapshots of the subvolume at `path`.
    pub async fn set_contents(&self, path: &Path, data: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .contents
            .insert(path.to_path_buf(), data.into());
    }

    /// Make `send_incremental` fail outright for `id`.
    pub async fn fail_send_of(&self, id: &SnapshotId) {
        self.state.lock().await.fail_send.insert(id.to_string());
    }

    /// Make the stream for `id` error out after its first chunk.
    pub async fn interrupt_stream_of(&self, id: &SnapshotId) {
        self.state
            .lock()
            .await
            .interrupt_stream
            .insert(id.to_string());
    }

    /// Make `receive_incremental` fail for `id` after consuming its stream.
    pub async fn fail_receive_of(&self, id: &SnapshotId) {
        self.state.lock().await.fail_receive.insert(id.to_string());
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.fail_send.clear();
        state.interrupt_stream.clear();
        state.fail_receive.clear();
    }

    /// Number of driver operations invoked so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Stored payload of a snapshot, if present.
    pub async fn snapshot_data(&self, subvolume: &Subvolume, id: &SnapshotId) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .snapshots
            .get(&subvolume.snapshot_dir)
            .and_then(|chain| chain.get(id))
            .cloned()
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl SubvolumeDriver for MemoryDriver {
    async fn prepare(&self, subvolume: &Subvolume) -> DriverResult<()> {
        self.record_call();
        let state = self.state.lock().await;
        if !state.mounted.contains(&subvolume.path) {
            return Err(DriverError::NotFound(subvolume.path.clone()));
        }
        Ok(())
    }

    async fn list_snapshots(&self, subvolume: &Subvolume) -> DriverResult<Vec<Snapshot>> {
        self.record_call();
        let state = self.state.lock().await;
        let ids = state
            .snapshots
            .get(&subvolume.snapshot_dir)
            .map(|chain| chain.keys().cloned().collect())
            .unwrap_or_default();
        Ok(link_chain(&subvolume.name, ids))
    }

    async fn create_snapshot(&self, subvolume: &Subvolume, label: &str) -> DriverResult<Snapshot> {
        self.record_call();
        let mut state = self.state.lock().await;
        if !state.mounted.contains(&subvolume.path) {
            return Err(DriverError::NotFound(subvolume.path.clone()));
        }

        let data = state.contents.get(&subvolume.path).cloned();
        let chain = state
            .snapshots
            .entry(subvolume.snapshot_dir.clone())
            .or_default();
        let parent = chain.keys().next_back().cloned();
        let id = SnapshotId::next_after(label, parent.as_ref())
            .map_err(|e| DriverError::failed("create snapshot", e.to_string()))?;

        let data = data.unwrap_or_else(|| Bytes::from(format!("{}@{}", subvolume.name, id)));
        chain.insert(id.clone(), data);

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
        self.record_call();
        let state = self.state.lock().await;
        let key = snapshot.id.to_string();
        if state.fail_send.contains(&key) {
            return Err(DriverError::failed("send", format!("injected failure for {}", key)));
        }

        let chain = state.snapshots.get(&subvolume.snapshot_dir);
        let data = chain
            .and_then(|c| c.get(&snapshot.id))
            .cloned()
            .ok_or_else(|| DriverError::SnapshotNotFound(key.clone()))?;
        if let Some(parent) = parent {
            if !chain.is_some_and(|c| c.contains_key(parent)) {
                return Err(DriverError::SnapshotNotFound(parent.to_string()));
            }
        }

        let mut chunks: Vec<io::Result<Bytes>> = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + MEMORY_CHUNK_SIZE).min(data.len());
            chunks.push(Ok(data.slice(offset..end)));
            offset = end;
        }
        if state.interrupt_stream.contains(&key) {
            chunks.truncate(1);
            chunks.push(Err(io::Error::other(format!(
                "stream for {} interrupted",
                key
            ))));
        }

        Ok(stream::iter(chunks).boxed())
    }

    async fn receive_incremental(
        &self,
        subvolume: &Subvolume,
        incoming: IncomingSnapshot,
    ) -> DriverResult<Snapshot> {
        self.record_call();
        let IncomingSnapshot {
            id,
            parent,
            mut stream,
        } = incoming;

        {
            let state = self.state.lock().await;
            let chain = state.snapshots.get(&subvolume.snapshot_dir);
            if let Some(parent) = &parent {
                if !chain.is_some_and(|c| c.contains_key(parent)) {
                    return Err(DriverError::ParentNotFound(parent.to_string()));
                }
            }
            if chain.is_some_and(|c| c.contains_key(&id)) {
                return Err(DriverError::failed(
                    "receive",
                    format!("snapshot {} already exists", id),
                ));
            }
        }

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DriverError::CorruptStream(e.to_string()))?;
            data.extend_from_slice(&chunk);
        }

        let mut state = self.state.lock().await;
        if state.fail_receive.contains(&id.to_string()) {
            return Err(DriverError::failed(
                "receive",
                format!("injected failure for {}", id),
            ));
        }
        state
            .snapshots
            .entry(subvolume.snapshot_dir.clone())
            .or_default()
            .insert(id.clone(), Bytes::from(data));

        Ok(Snapshot {
            id,
            parent,
            subvolume: subvolume.name.clone(),
        })
    }
}
