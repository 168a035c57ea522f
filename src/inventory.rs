//! Snapshot inventory: ordered chains and the missing-set computation.
//!
//! Pure computation, no I/O. The remote side is described only by the ids it
//! reported, in chain order.

use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::snapshot::{Snapshot, SnapshotId};

/// An ordered chain of snapshots for one subvolume.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChain {
    subvolume: String,
    snapshots: Vec<Snapshot>,
}

impl SnapshotChain {
    /// Build a chain from snapshots already in creation order.
    ///
    /// Ids must be strictly increasing.
    pub fn new(subvolume: impl Into<String>, snapshots: Vec<Snapshot>) -> Result<Self> {
        let subvolume = subvolume.into();
        for pair in snapshots.windows(2) {
            if pair[0].id >= pair[1].id {
                return Err(SyncError::MalformedChain {
                    subvolume,
                    detail: format!("{} is not older than {}", pair[0].id, pair[1].id),
                });
            }
        }
        Ok(Self {
            subvolume,
            snapshots,
        })
    }

    pub fn subvolume(&self) -> &str {
        &self.subvolume
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn ids(&self) -> impl Iterator<Item = &SnapshotId> {
        self.snapshots.iter().map(|s| &s.id)
    }

    pub fn tail(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    pub fn contains(&self, id: &SnapshotId) -> bool {
        self.snapshots.iter().any(|s| &s.id == id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Remote chain as reported by a peer during negotiation.
    ///
    /// `present` is the subset of our ids the peer holds and `latest` its chain
    /// tail. A tail we do not know about is appended so that the prefix check in
    /// [`compute_missing`] sees it.
    pub fn reported_remote(
        &self,
        present: &HashSet<SnapshotId>,
        latest: Option<&SnapshotId>,
    ) -> Vec<SnapshotId> {
        let mut remote: Vec<SnapshotId> = self
            .ids()
            .filter(|id| present.contains(*id))
            .cloned()
            .collect();
        if let Some(latest) = latest {
            if !self.contains(latest) {
                remote.push(latest.clone());
            }
        }
        remote
    }
}

/// One snapshot to send, with the delta base the peer already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub snapshot: Snapshot,
    /// `None` means a full send.
    pub base: Option<SnapshotId>,
}

/// Ordered snapshots the peer is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingSet {
    transfers: Vec<PlannedTransfer>,
}

impl MissingSet {
    pub fn transfers(&self) -> &[PlannedTransfer] {
        &self.transfers
    }

    pub fn ids(&self) -> Vec<SnapshotId> {
        self.transfers.iter().map(|t| t.snapshot.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

impl IntoIterator for MissingSet {
    type Item = PlannedTransfer;
    type IntoIter = std::vec::IntoIter<PlannedTransfer>;

    fn into_iter(self) -> Self::IntoIter {
        self.transfers.into_iter()
    }
}

/// Compute the snapshots of `local` that the remote chain lacks.
///
/// `remote` must be a prefix of `local` (same ids, same order). Anything else is
/// a divergence and is never merged automatically.
pub fn compute_missing(local: &SnapshotChain, remote: &[SnapshotId]) -> Result<MissingSet> {
    if local.is_empty() {
        return Ok(MissingSet::default());
    }

    let diverged = |detail: String| SyncError::ChainDivergence {
        subvolume: local.subvolume().to_string(),
        detail,
    };

    if remote.len() > local.len() {
        return Err(diverged(format!(
            "remote holds {} snapshots, local only {}",
            remote.len(),
            local.len()
        )));
    }

    for (position, (ours, theirs)) in local.snapshots().iter().zip(remote).enumerate() {
        if &ours.id != theirs {
            return Err(diverged(format!(
                "position {}: local has {}, remote has {}",
                position, ours.id, theirs
            )));
        }
    }

    let mut base = remote.last().cloned();
    let transfers = local.snapshots()[remote.len()..]
        .iter()
        .map(|snapshot| {
            let planned = PlannedTransfer {
                snapshot: snapshot.clone(),
                base: base.take(),
            };
            base = Some(snapshot.id.clone());
            planned
        })
        .collect();

    Ok(MissingSet { transfers })
}
