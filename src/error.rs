//! Error types shared by the driver, inventory, protocol and orchestration layers.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::streaming::protocol::ErrorCode;

/// Failures reported by a subvolume driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("subvolume not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("not a mountable subvolume: {} ({reason})", .path.display())]
    NotMountable { path: PathBuf, reason: String },

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("{op} failed: {message}")]
    Failed { op: &'static str, message: String },

    #[error("insufficient space to create snapshot in {}", .0.display())]
    InsufficientSpace(PathBuf),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("corrupt snapshot stream: {0}")]
    CorruptStream(String),

    #[error("parent snapshot not found: {0}")]
    ParentNotFound(String),
}

impl DriverError {
    pub fn failed(op: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            op,
            message: message.into(),
        }
    }

    /// Wire code used when this failure is reported to a peer.
    pub fn code(&self) -> ErrorCode {
        match self {
            DriverError::InsufficientSpace(_) => ErrorCode::InsufficientSpace,
            DriverError::SnapshotNotFound(_) => ErrorCode::SnapshotNotFound,
            DriverError::CorruptStream(_) => ErrorCode::CorruptStream,
            DriverError::ParentNotFound(_) => ErrorCode::ParentNotFound,
            _ => ErrorCode::DriverFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("network failure: {0}")]
    Network(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("snapshot chains diverged for subvolume '{subvolume}': {detail}")]
    ChainDivergence { subvolume: String, detail: String },

    #[error("malformed snapshot chain for subvolume '{subvolume}': {detail}")]
    MalformedChain { subvolume: String, detail: String },

    #[error("server rejected request ({code:?}): {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("another run holds the lock for subvolume '{0}'")]
    Busy(String),
}

impl SyncError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// A peer that stayed silent for too long.
    pub fn timed_out(what: impl std::fmt::Display, after: std::time::Duration) -> Self {
        Self::Network(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out after {:?}", what, after),
        ))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Network(e) if e.kind() == io::ErrorKind::TimedOut)
    }

    /// Short, stable name of the failure kind for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Config(_) => "configuration_error",
            SyncError::Driver(_) => "driver_failure",
            SyncError::Network(_) => "network_failure",
            SyncError::Protocol(_) => "protocol_error",
            SyncError::ChainDivergence { .. } => "chain_divergence",
            SyncError::MalformedChain { .. } => "malformed_chain",
            SyncError::Remote { code, .. } => code.as_str(),
            SyncError::Cancelled => "cancelled",
            SyncError::Busy(_) => "busy",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_codes() {
        assert_eq!(
            DriverError::CorruptStream("bad".into()).code(),
            ErrorCode::CorruptStream
        );
        assert_eq!(
            DriverError::ParentNotFound("p".into()).code(),
            ErrorCode::ParentNotFound
        );
        assert_eq!(
            DriverError::failed("send", "boom").code(),
            ErrorCode::DriverFailure
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(SyncError::Config("x".into()).kind(), "configuration_error");
        assert_eq!(SyncError::Cancelled.kind(), "cancelled");
        let remote = SyncError::Remote {
            code: ErrorCode::ParentNotFound,
            message: "missing".into(),
        };
        assert_eq!(remote.kind(), "parent_not_found");
    }
}
