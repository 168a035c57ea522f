//! Client-side backup runs.
//!
//! A run moves through `Idle -> Validating -> Negotiating -> Transferring`
//! and ends in `Completed` or `Aborted`. Failures before the transfer phase
//! are returned as errors; once transfers start the outcome is always a
//! [`RunReport`] so the caller learns which prefix made it across.

pub mod client;
pub mod negotiate;

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::driver::SubvolumeDriver;
use crate::error::{Result, SyncError};
use crate::inventory::SnapshotChain;
use crate::snapshot::{Snapshot, SnapshotId, Subvolume};
use crate::streaming::pipeline::{interruptible, FailedTransfer, TransferPipeline};
use crate::streaming::protocol::{read_frame, send_frame, Done, HelloFlags, MessageType};

pub use client::run_backup;
pub use negotiate::{handshake, negotiate, Negotiated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Validating,
    Negotiating,
    Transferring,
    Completed,
    Aborted,
}

/// Outcome of a backup run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub subvolume: String,
    pub state: RunState,
    /// Snapshot taken by this run, if any.
    pub created: Option<SnapshotId>,
    /// Local snapshots the server already had.
    pub already_present: usize,
    /// Snapshots materialized on the server, in order.
    pub sent: Vec<SnapshotId>,
    pub failed: Option<FailedTransfer>,
    pub bytes_sent: u64,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Completed
    }
}

/// Per-run knobs that do not depend on where the server lives.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub label: String,
    pub create_snapshot: bool,
    pub compress: bool,
    /// How long to wait on a silent server before failing the run.
    pub idle_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            label: "backup".to_string(),
            create_snapshot: true,
            compress: false,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// One backup of one subvolume
pub struct BackupRun {
    driver: Arc<dyn SubvolumeDriver>,
    subvolume: Subvolume,
    options: RunOptions,
    cancel: CancellationToken,
    state: RunState,
    created: Option<Snapshot>,
    started: Instant,
}

impl BackupRun {
    pub fn new(
        driver: Arc<dyn SubvolumeDriver>,
        subvolume: Subvolume,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            driver,
            subvolume,
            options,
            cancel,
            state: RunState::Idle,
            created: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn subvolume(&self) -> &Subvolume {
        &self.subvolume
    }

    /// Check the subvolume and take this run's snapshot.
    pub async fn validate(&mut self) -> Result<()> {
        self.prepare().await?;
        self.take_snapshot().await
    }

    /// Check that the driver can use the subvolume.
    pub async fn prepare(&mut self) -> Result<()> {
        self.transition(RunState::Validating);
        if let Err(e) = self.driver.prepare(&self.subvolume).await {
            self.transition(RunState::Aborted);
            return Err(e.into());
        }
        Ok(())
    }

    /// Take this run's snapshot, unless snapshot creation is disabled.
    pub async fn take_snapshot(&mut self) -> Result<()> {
        if self.state != RunState::Validating {
            return Err(SyncError::protocol(format!(
                "cannot take a snapshot from state {:?}",
                self.state
            )));
        }
        if !self.options.create_snapshot {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            self.transition(RunState::Aborted);
            return Err(SyncError::Cancelled);
        }

        match self
            .driver
            .create_snapshot(&self.subvolume, &self.options.label)
            .await
        {
            Ok(snapshot) => {
                tracing::info!(
                    subvolume = %self.subvolume.name,
                    snapshot = %snapshot.id,
                    parent = ?snapshot.parent.as_ref().map(|p| p.to_string()),
                    "Created snapshot"
                );
                self.created = Some(snapshot);
                Ok(())
            }
            Err(e) => {
                self.transition(RunState::Aborted);
                Err(e.into())
            }
        }
    }

    /// Negotiate with the server and send what it is missing.
    pub async fn sync_with<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<RunReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.state != RunState::Validating {
            return Err(SyncError::protocol(format!(
                "cannot negotiate from state {:?}",
                self.state
            )));
        }

        self.transition(RunState::Negotiating);
        let negotiated = match self.negotiate(reader, writer).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.transition(RunState::Aborted);
                return Err(e);
            }
        };

        self.transition(RunState::Transferring);
        let pipeline = TransferPipeline::new(
            self.driver.clone(),
            self.subvolume.clone(),
            self.options.compress,
            self.options.idle_timeout,
            self.cancel.clone(),
        );
        let outcome = pipeline.run(negotiated.missing, reader, writer).await;

        if outcome.connection_usable {
            let done = Done {
                snapshots: outcome.sent.len() as u64,
                bytes: outcome.bytes,
            };
            let idle = self.options.idle_timeout.min(DONE_REPLY_TIMEOUT);
            match tokio::time::timeout(idle, finish_session(reader, writer, done)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "Session not closed cleanly"),
                Err(_) => tracing::debug!("Timed out waiting for the server's Done"),
            }
        }

        self.transition(if outcome.failed.is_some() {
            RunState::Aborted
        } else {
            RunState::Completed
        });

        Ok(RunReport {
            subvolume: self.subvolume.name.clone(),
            state: self.state,
            created: self.created.as_ref().map(|s| s.id.clone()),
            already_present: negotiated.already_present,
            sent: outcome.sent,
            failed: outcome.failed,
            bytes_sent: outcome.bytes,
            duration_ms: self.started.elapsed().as_millis() as u64,
        })
    }

    /// Validate, then sync over an already-established connection.
    pub async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<RunReport>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.validate().await?;
        self.sync_with(reader, writer).await
    }

    async fn negotiate<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<Negotiated>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let flags = if self.options.compress {
            HelloFlags::COMPRESSION
        } else {
            HelloFlags::empty()
        };
        let idle = self.options.idle_timeout;
        let agreed =
            interruptible(&self.cancel, idle, "handshake", handshake(reader, writer, flags)).await?;
        if self.options.compress && !agreed.contains(HelloFlags::COMPRESSION) {
            tracing::warn!("Server does not accept compressed data; sending uncompressed");
            self.options.compress = false;
        }

        let snapshots = self.driver.list_snapshots(&self.subvolume).await?;
        let chain = SnapshotChain::new(self.subvolume.name.clone(), snapshots)?;
        interruptible(&self.cancel, idle, "negotiation", negotiate(reader, writer, &chain)).await
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(subvolume = %self.subvolume.name, from = ?self.state, to = ?next, "Run state");
        self.state = next;
    }
}

/// Upper bound on waiting for the server's Done.
const DONE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Close the session politely.
async fn finish_session<R, W>(reader: &mut R, writer: &mut W, done: Done) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_frame(writer, &done.encode()).await?;
    match read_frame(reader).await? {
        (MessageType::Done, payload) => {
            let done = Done::decode(payload)?;
            tracing::debug!(
                snapshots = done.snapshots,
                bytes = done.bytes,
                "Server closed session"
            );
        }
        (other, _) => tracing::debug!(message = ?other, "Unexpected reply to Done"),
    }
    Ok(())
}
