//! Snapshot identifiers and the subvolume/snapshot data model.
//!
//! Identifiers are timestamp-derived: `<label>-<YYYYMMDDTHHMMSS>.<nanos>Z` in UTC.
//! The timestamp has a fixed width so identifiers are comparable on both
//! peers without exchanging any extra chain metadata.

use chrono::{DateTime, Duration, NaiveDateTime, Timelike, Utc};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SyncError};

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// btrfs limits a path component to 255 bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Bytes an id adds after its label: `-YYYYMMDDTHHMMSS.nnnnnnnnnZ`.
const ID_SUFFIX_LEN: usize = 27;

/// Longest label whose ids still fit in one path component.
pub const MAX_LABEL_LEN: usize = MAX_NAME_LEN - ID_SUFFIX_LEN;

/// Identifier of a snapshot, ordered by creation time then label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotId {
    label: String,
    taken_at: DateTime<Utc>,
}

impl SnapshotId {
    pub fn new(label: &str, taken_at: DateTime<Utc>) -> Result<Self> {
        validate_label(label)?;
        Ok(Self {
            label: label.to_string(),
            taken_at,
        })
    }

    /// Identifier for a snapshot taken now, guaranteed to sort after `tail`.
    pub fn next_after(label: &str, tail: Option<&SnapshotId>) -> Result<Self> {
        let mut taken_at = Utc::now();
        if let Some(tail) = tail {
            if taken_at <= tail.taken_at {
                taken_at = tail.taken_at + Duration::nanoseconds(1);
            }
        }
        Self::new(label, taken_at)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(SyncError::Config("snapshot label must not be empty".into()));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(SyncError::Config(format!(
            "snapshot label is {} bytes, at most {} allowed",
            label.len(),
            MAX_LABEL_LEN
        )));
    }
    if !label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(SyncError::Config(format!(
            "snapshot label '{}' may only contain [A-Za-z0-9_.-]",
            label
        )));
    }
    Ok(())
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}.{:09}Z",
            self.label,
            self.taken_at.format(TIMESTAMP_FORMAT),
            self.taken_at.nanosecond() % 1_000_000_000
        )
    }
}

impl FromStr for SnapshotId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SyncError::protocol(format!("invalid snapshot identifier: {}", s));

        let (label, stamp) = s.rsplit_once('-').ok_or_else(invalid)?;
        let stamp = stamp.strip_suffix('Z').ok_or_else(invalid)?;
        let (secs, nanos) = stamp.split_once('.').ok_or_else(invalid)?;
        if nanos.len() != 9 || !nanos.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let nanos: u32 = nanos.parse().map_err(|_| invalid())?;
        let naive = NaiveDateTime::parse_from_str(secs, TIMESTAMP_FORMAT)
            .map_err(|_| invalid())?
            .with_nanosecond(nanos)
            .ok_or_else(invalid)?;

        validate_label(label).map_err(|_| invalid())?;
        Ok(Self {
            label: label.to_string(),
            taken_at: naive.and_utc(),
        })
    }
}

impl Ord for SnapshotId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.taken_at
            .cmp(&other.taken_at)
            .then_with(|| self.label.cmp(&other.label))
    }
}

impl PartialOrd for SnapshotId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for SnapshotId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An immutable point-in-time copy of a subvolume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    /// Immediate predecessor in the chain; `None` only for the first snapshot.
    pub parent: Option<SnapshotId>,
    /// Name of the subvolume this snapshot was taken from.
    pub subvolume: String,
}

/// The unit of backup: a snapshot-capable tree and where its snapshots live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subvolume {
    /// Identifier exchanged with the peer.
    pub name: String,
    /// Path of the live subvolume.
    pub path: PathBuf,
    /// Directory holding this subvolume's snapshots.
    pub snapshot_dir: PathBuf,
}

impl Subvolume {
    /// Client-side subvolume: snapshots live under `<path>/<snapshot_dir>`.
    pub fn local(name: impl Into<String>, path: &Path, snapshot_dir: &Path) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            path: path.to_path_buf(),
            snapshot_dir: path.join(snapshot_dir),
        })
    }

    /// Server-side mirror of a peer's subvolume: `<path>/<snapshot_dir>/<name>`.
    pub fn mirror(name: &str, path: &Path, snapshot_dir: &Path) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            snapshot_dir: path.join(snapshot_dir).join(name),
        })
    }

    pub fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshot_dir.join(id.to_string())
    }
}

/// Default wire name for a subvolume path: its last component, `root` for `/`.
pub fn default_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// Subvolume names become directory names on the server, so they must not
/// be able to escape the storage root.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(SyncError::Config(format!(
            "invalid subvolume name: '{}'",
            name
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SyncError::Config(format!(
            "subvolume name is {} bytes, at most {} allowed",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(SyncError::Config(format!(
            "subvolume name must not contain path separators: '{}'",
            name
        )));
    }
    Ok(())
}
