//! Transfer pipeline.
//!
//! Sends the snapshots of a [`MissingSet`] one at a time, in order. The first
//! failure stops the pipeline: later snapshots may depend on the failed one,
//! so they are never sent out of order. Cancellation is checked before each
//! snapshot and raced against every wait on the driver or the server, and
//! each of those waits is bounded by the idle timeout.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::driver::SubvolumeDriver;
use crate::error::{Result, SyncError};
use crate::inventory::{MissingSet, PlannedTransfer};
use crate::snapshot::{SnapshotId, Subvolume};
use crate::streaming::channel::{frame_channel, SenderMessage, TransferStats};
use crate::streaming::protocol::{
    read_frame, send_frame, write_frame, Error, MessageType, TransferAbort, TransferBegin,
    TransferEnd, TransferReady, TransferResult,
};
use crate::streaming::sender::{Sender, SenderConfig};

/// How long to wait for the server to acknowledge an abort.
const ABORT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The snapshot that stopped a pipeline and why.
#[derive(Debug, Clone, Serialize)]
pub struct FailedTransfer {
    pub snapshot: SnapshotId,
    pub kind: String,
    pub message: String,
}

impl FailedTransfer {
    fn new(snapshot: &SnapshotId, error: &SyncError) -> Self {
        Self {
            snapshot: snapshot.clone(),
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result of running a pipeline over a missing set.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Snapshots materialized on the server, in order.
    pub sent: Vec<SnapshotId>,
    pub bytes: u64,
    /// Set when the pipeline stopped early.
    pub failed: Option<FailedTransfer>,
    /// Whether the connection is still in a usable state.
    pub connection_usable: bool,
}

/// Orchestrator for per-snapshot transfers
pub struct TransferPipeline {
    driver: Arc<dyn SubvolumeDriver>,
    subvolume: Subvolume,
    compress: bool,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

/// Why a transfer stopped, and whether the connection can take another request.
struct TransferFailure {
    error: SyncError,
    connection_usable: bool,
}

impl TransferFailure {
    fn broken(error: SyncError) -> Self {
        Self {
            error,
            connection_usable: false,
        }
    }
}

impl From<SyncError> for TransferFailure {
    fn from(error: SyncError) -> Self {
        let connection_usable = !matches!(error, SyncError::Network(_) | SyncError::Protocol(_));
        Self {
            error,
            connection_usable,
        }
    }
}

impl TransferPipeline {
    pub fn new(
        driver: Arc<dyn SubvolumeDriver>,
        subvolume: Subvolume,
        compress: bool,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            driver,
            subvolume,
            compress,
            idle_timeout,
            cancel,
        }
    }

    /// Send every planned transfer in order, stopping at the first failure.
    pub async fn run<R, W>(
        &self,
        missing: MissingSet,
        reader: &mut R,
        writer: &mut W,
    ) -> PipelineOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut outcome = PipelineOutcome {
            sent: Vec::new(),
            bytes: 0,
            failed: None,
            connection_usable: true,
        };

        for planned in missing {
            // Checkpoint: nothing is in flight between snapshots.
            if self.cancel.is_cancelled() {
                outcome.failed = Some(FailedTransfer::new(
                    &planned.snapshot.id,
                    &SyncError::Cancelled,
                ));
                break;
            }

            let id = planned.snapshot.id.clone();
            match self.transfer(&planned, reader, writer).await {
                Ok(stats) => {
                    tracing::info!(
                        subvolume = %self.subvolume.name,
                        snapshot = %id,
                        base = ?planned.base.as_ref().map(|b| b.to_string()),
                        bytes = stats.bytes,
                        wire_bytes = stats.wire_bytes,
                        "Snapshot transferred"
                    );
                    outcome.bytes += stats.bytes;
                    outcome.sent.push(id);
                }
                Err(failure) => {
                    tracing::error!(
                        subvolume = %self.subvolume.name,
                        snapshot = %id,
                        error = %failure.error,
                        "Snapshot transfer failed; skipping remaining snapshots"
                    );
                    outcome.connection_usable = failure.connection_usable;
                    outcome.failed = Some(FailedTransfer::new(&id, &failure.error));
                    break;
                }
            }
        }

        outcome
    }

    async fn transfer<R, W>(
        &self,
        planned: &PlannedTransfer,
        reader: &mut R,
        writer: &mut W,
    ) -> std::result::Result<TransferStats, TransferFailure>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let snapshot = &planned.snapshot;
        let stream = self
            .wait("starting send", async {
                self.driver
                    .send_incremental(&self.subvolume, snapshot, planned.base.as_ref())
                    .await
                    .map_err(SyncError::from)
            })
            .await?;
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }

        let begin = TransferBegin {
            subvolume: self.subvolume.name.clone(),
            snapshot: snapshot.id.to_string(),
            parent: planned.base.as_ref().map(|b| b.to_string()),
        };
        self.wait("sending TransferBegin", send_frame(writer, &begin.encode()))
            .await
            .map_err(TransferFailure::broken)?;
        match self
            .wait("waiting for TransferReady", self.expect_ready(reader, &snapshot.id))
            .await
        {
            Ok(()) => {}
            Err(SyncError::Cancelled) => return Err(self.interrupted(writer).await),
            Err(e) => return Err(e.into()),
        }

        let (tx, mut rx) = frame_channel();
        let sender = Sender::new(SenderConfig {
            compress: self.compress,
        });
        let sender_handle = tokio::spawn(sender.run(stream, tx));

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    sender_handle.abort();
                    let acknowledged = self.abort(reader, writer, "cancelled by operator").await;
                    return Err(TransferFailure {
                        error: SyncError::Cancelled,
                        connection_usable: acknowledged,
                    });
                }
                msg = rx.recv() => match msg {
                    Some(SenderMessage::Frame(frame)) => {
                        // A write cut short leaves a partial frame on the wire.
                        if let Err(e) = self.wait("sending data", write_frame(writer, &frame)).await {
                            sender_handle.abort();
                            return Err(TransferFailure::broken(e));
                        }
                    }
                    Some(SenderMessage::Failed(e)) => {
                        let acknowledged = self.abort(reader, writer, &e.to_string()).await;
                        return Err(TransferFailure {
                            error: e.into(),
                            connection_usable: acknowledged,
                        });
                    }
                    None => break,
                },
            }
        }

        let stats = sender_handle
            .await
            .map_err(|e| SyncError::protocol(format!("sender task failed: {}", e)))?;

        let end = TransferEnd {
            bytes: stats.bytes,
            checksum: stats.checksum,
        };
        self.wait("sending TransferEnd", send_frame(writer, &end.encode()))
            .await
            .map_err(TransferFailure::broken)?;

        let result = match self
            .wait("waiting for TransferResult", read_result(reader))
            .await
        {
            Ok(result) => result,
            Err(SyncError::Cancelled) => return Err(self.interrupted(writer).await),
            Err(e) => return Err(e.into()),
        };
        if !result.is_ok() {
            return Err(SyncError::Remote {
                code: result.code,
                message: result.message,
            }
            .into());
        }
        if result.snapshot != snapshot.id.to_string() {
            return Err(SyncError::protocol(format!(
                "server acknowledged {} while sending {}",
                result.snapshot, snapshot.id
            ))
            .into());
        }

        Ok(stats)
    }

    async fn wait<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        interruptible(&self.cancel, self.idle_timeout, what, fut).await
    }

    /// Cancelled while a reply is outstanding: tell the server, then give up
    /// on the connection since the reply may still arrive.
    async fn interrupted<W>(&self, writer: &mut W) -> TransferFailure
    where
        W: AsyncWrite + Unpin,
    {
        let abort = TransferAbort {
            message: "cancelled by operator".to_string(),
        };
        match tokio::time::timeout(ABORT_REPLY_TIMEOUT, send_frame(writer, &abort.encode())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "Could not send TransferAbort"),
            Err(_) => tracing::debug!("Timed out sending TransferAbort"),
        }
        TransferFailure::broken(SyncError::Cancelled)
    }

    async fn expect_ready<R>(&self, reader: &mut R, id: &SnapshotId) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let (msg_type, payload) = read_frame(reader).await?;
        match msg_type {
            MessageType::TransferReady => {
                let ready = TransferReady::decode(payload)?;
                if ready.snapshot != id.to_string() {
                    return Err(SyncError::protocol(format!(
                        "server is ready for {} while sending {}",
                        ready.snapshot, id
                    )));
                }
                Ok(())
            }
            MessageType::TransferResult => {
                let result = TransferResult::decode(payload)?;
                Err(SyncError::Remote {
                    code: result.code,
                    message: result.message,
                })
            }
            MessageType::Error => Err(Error::decode(payload)?.into_sync_error()),
            other => Err(SyncError::protocol(format!(
                "Expected TransferReady, got {:?}",
                other
            ))),
        }
    }

    /// Tell the server to discard the in-flight snapshot. Best effort;
    /// returns whether the server acknowledged.
    async fn abort<R, W>(&self, reader: &mut R, writer: &mut W, reason: &str) -> bool
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let abort = TransferAbort {
            message: reason.to_string(),
        };
        match tokio::time::timeout(ABORT_REPLY_TIMEOUT, send_frame(writer, &abort.encode())).await {
            Ok(Ok(())) => {}
            _ => return false,
        }
        match tokio::time::timeout(ABORT_REPLY_TIMEOUT, read_result(reader)).await {
            Ok(Ok(result)) => {
                tracing::debug!(snapshot = %result.snapshot, code = ?result.code, "Server discarded snapshot");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "No acknowledgement for aborted transfer");
                false
            }
            Err(_) => {
                tracing::warn!("Timed out waiting for aborted transfer acknowledgement");
                false
            }
        }
    }
}

/// Wait for `fut`, giving up when `cancel` fires or `idle` passes first.
pub(crate) async fn interruptible<T, F>(
    cancel: &CancellationToken,
    idle: Duration,
    what: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        waited = tokio::time::timeout(idle, fut) => match waited {
            Ok(result) => result,
            Err(_) => Err(SyncError::timed_out(what, idle)),
        },
    }
}

async fn read_result<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TransferResult> {
    let (msg_type, payload) = read_frame(reader).await?;
    match msg_type {
        MessageType::TransferResult => TransferResult::decode(payload),
        MessageType::Error => Err(Error::decode(payload)?.into_sync_error()),
        other => Err(SyncError::protocol(format!(
            "Expected TransferResult, got {:?}",
            other
        ))),
    }
}
