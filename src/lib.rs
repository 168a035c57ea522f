//! Incremental snapshot replication.
//!
//! A client takes a read-only snapshot of a subvolume, asks the server which
//! snapshots of that subvolume it already holds, and streams the missing ones
//! in chain order as incremental deltas. The server materializes each one
//! atomically, so a failed or interrupted run never leaves a partial snapshot
//! behind and the next run picks up where the last one stopped.

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod server;
pub mod snapshot;
pub mod streaming;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use driver::{BtrfsDriver, MemoryDriver, SubvolumeDriver};
pub use error::{DriverError, Result, SyncError};
pub use inventory::{compute_missing, MissingSet, PlannedTransfer, SnapshotChain};
pub use server::{run_server, Server};
pub use snapshot::{Snapshot, SnapshotId, Subvolume};
pub use sync::{run_backup, BackupRun, RunOptions, RunReport, RunState};
