//! Server mode: receives snapshot chains pushed by clients.
//!
//! Every connection runs in its own task. A connection binds to one subvolume
//! with its first `SnapshotsNeeded` and holds that subvolume's session until
//! it ends, so two clients never interleave transfers into the same chain.

pub mod session;

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::driver::SubvolumeDriver;
use crate::error::{Result, SyncError};
use crate::snapshot::{default_name, SnapshotId, Subvolume};
use crate::streaming::protocol::{
    self as wire, negotiate_version, read_frame_within, send_frame, ErrorCode, HelloFlags,
    MessageType, VersionNegotiationResult,
};
use crate::streaming::Receiver;
use crate::transport::{self, ServerSession};

pub use session::{SessionGuard, SessionRegistry};

/// Flags this server accepts from clients.
const SUPPORTED_FLAGS: HelloFlags = HelloFlags::COMPRESSION;

/// A client silent for this long loses its connection and its session.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared server state; cheap to clone into connection tasks.
#[derive(Clone)]
pub struct Server {
    driver: Arc<dyn SubvolumeDriver>,
    root: PathBuf,
    snapshot_dir: PathBuf,
    idle_timeout: Duration,
    sessions: Arc<SessionRegistry>,
}

impl Server {
    /// Mirrors are stored under `<root>/<snapshot_dir>/<subvolume name>`.
    pub fn new(driver: Arc<dyn SubvolumeDriver>, root: &Path, snapshot_dir: &Path) -> Self {
        Self {
            driver,
            root: root.to_path_buf(),
            snapshot_dir: snapshot_dir.to_path_buf(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Check the storage root before accepting connections.
    pub async fn prepare(&self) -> Result<()> {
        let storage = Subvolume::local(default_name(&self.root), &self.root, &self.snapshot_dir)?;
        self.driver.prepare(&storage).await?;
        Ok(())
    }

    fn mirror(&self, name: &str) -> Result<Subvolume> {
        Subvolume::mirror(name, &self.root, &self.snapshot_dir)
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(address = %address, root = %self.root.display(), "Server listening");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Shutting down server");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            let session = match ServerSession::from_stream(stream) {
                                Ok(session) => session,
                                Err(e) => {
                                    tracing::warn!(peer = %peer, error = %e, "Could not set up connection");
                                    return;
                                }
                            };
                            tracing::info!(peer = %peer, "Client connected");
                            let (mut reader, mut writer) = session.into_parts();
                            match server.handle_connection(&mut reader, &mut writer).await {
                                Ok(()) => tracing::info!(peer = %peer, "Client disconnected"),
                                Err(e) => tracing::warn!(peer = %peer, error = %e, "Connection ended with error"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
    }

    /// Serve one client until it sends Done or disconnects.
    pub async fn handle_connection<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (msg_type, payload) = read_frame_within(reader, self.idle_timeout).await?;
        if msg_type != MessageType::Hello {
            let fatal = wire::Fatal {
                code: ErrorCode::InvalidRequest as u16,
                message: format!("Expected HELLO, got {:?}", msg_type),
            };
            send_frame(writer, &fatal.encode()).await?;
            return Ok(());
        }

        let hello = wire::Hello::decode(payload)?;
        if let Some(message) = match negotiate_version(hello.version) {
            VersionNegotiationResult::Supported(_) => None,
            VersionNegotiationResult::TooOld { client, min_supported } => Some(format!(
                "protocol version {} is too old (minimum {})",
                client, min_supported
            )),
            VersionNegotiationResult::TooNew { client, max_supported } => Some(format!(
                "protocol version {} is too new (maximum {})",
                client, max_supported
            )),
        } {
            let fatal = wire::Fatal {
                code: ErrorCode::InvalidRequest as u16,
                message,
            };
            send_frame(writer, &fatal.encode()).await?;
            return Ok(());
        }
        send_frame(writer, &wire::Hello::new(hello.flags & SUPPORTED_FLAGS).encode()).await?;

        let mut connection = Connection {
            server: self,
            session: None,
            received: 0,
            bytes: 0,
        };

        loop {
            let (msg_type, payload) = match read_frame_within(reader, self.idle_timeout).await {
                Ok(frame) => frame,
                Err(SyncError::Network(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("Client closed connection without Done");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match msg_type {
                MessageType::SnapshotsNeeded => {
                    let request = wire::SnapshotsNeeded::decode(payload)?;
                    connection.snapshots_needed(request, writer).await?;
                }
                MessageType::TransferBegin => {
                    let begin = wire::TransferBegin::decode(payload)?;
                    connection.transfer(begin, reader, writer).await?;
                }
                MessageType::Done => {
                    let done = wire::Done {
                        snapshots: connection.received,
                        bytes: connection.bytes,
                    };
                    send_frame(writer, &done.encode()).await?;
                    return Ok(());
                }
                other => {
                    reply_error(
                        writer,
                        ErrorCode::InvalidRequest,
                        format!("unexpected {:?} outside a transfer", other),
                    )
                    .await?;
                }
            }
        }
    }
}

/// A subvolume claimed by a connection.
struct BoundSession {
    subvolume: Subvolume,
    _guard: SessionGuard,
}

struct Connection<'a> {
    server: &'a Server,
    session: Option<BoundSession>,
    received: u64,
    bytes: u64,
}

impl Connection<'_> {
    /// Bind this connection to `name`, waiting for other sessions on it.
    async fn claim(&mut self, name: &str) -> std::result::Result<Subvolume, (ErrorCode, String)> {
        if let Some(session) = &self.session {
            if session.subvolume.name == name {
                return Ok(session.subvolume.clone());
            }
            return Err((
                ErrorCode::InvalidRequest,
                format!(
                    "connection is bound to subvolume '{}', not '{}'",
                    session.subvolume.name, name
                ),
            ));
        }

        let subvolume = self
            .server
            .mirror(name)
            .map_err(|e| (ErrorCode::InvalidRequest, e.to_string()))?;
        let guard = self.server.sessions.acquire(name).await;
        self.server
            .driver
            .prepare(&subvolume)
            .await
            .map_err(|e| (e.code(), e.to_string()))?;

        tracing::info!(
            subvolume = guard.subvolume(),
            dir = %subvolume.snapshot_dir.display(),
            active = self.server.sessions.active(),
            "Session started"
        );
        self.session = Some(BoundSession {
            subvolume: subvolume.clone(),
            _guard: guard,
        });
        Ok(subvolume)
    }

    async fn snapshots_needed<W>(&mut self, request: wire::SnapshotsNeeded, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let subvolume = match self.claim(&request.subvolume).await {
            Ok(subvolume) => subvolume,
            Err((code, message)) => return reply_error(writer, code, message).await,
        };

        let chain = match self.server.driver.list_snapshots(&subvolume).await {
            Ok(chain) => chain,
            Err(e) => return reply_error(writer, e.code(), e.to_string()).await,
        };

        let held: HashSet<String> = chain.iter().map(|s| s.id.to_string()).collect();
        let present: Vec<String> = request
            .snapshots
            .into_iter()
            .filter(|id| held.contains(id))
            .collect();
        let latest = chain.last().map(|s| s.id.to_string());

        tracing::debug!(
            subvolume = %subvolume.name,
            held = held.len(),
            present = present.len(),
            "Answering SnapshotsNeeded"
        );
        let reply = wire::SnapshotsPresent { present, latest };
        send_frame(writer, &reply.encode()).await
    }

    /// Check a TransferBegin against the bound session and our chain.
    async fn admit(
        &self,
        begin: &wire::TransferBegin,
    ) -> std::result::Result<(Subvolume, SnapshotId, Option<SnapshotId>), (ErrorCode, String)> {
        let subvolume = match &self.session {
            Some(session) if session.subvolume.name == begin.subvolume => session.subvolume.clone(),
            _ => {
                return Err((
                    ErrorCode::InvalidRequest,
                    format!(
                        "no negotiated session for subvolume '{}'",
                        begin.subvolume
                    ),
                ))
            }
        };

        let id: SnapshotId = begin
            .snapshot
            .parse()
            .map_err(|e: SyncError| (ErrorCode::InvalidRequest, e.to_string()))?;
        let parent: Option<SnapshotId> = begin
            .parent
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e: SyncError| (ErrorCode::InvalidRequest, e.to_string()))?;

        let chain = self
            .server
            .driver
            .list_snapshots(&subvolume)
            .await
            .map_err(|e| (e.code(), e.to_string()))?;

        if chain.iter().any(|s| s.id == id) {
            return Err((
                ErrorCode::InvalidRequest,
                format!("snapshot {} is already present", id),
            ));
        }
        if let Some(tail) = chain.last() {
            if tail.id >= id {
                return Err((
                    ErrorCode::ChainDivergence,
                    format!("snapshot {} is not newer than chain tail {}", id, tail.id),
                ));
            }
        }
        // Each snapshot must extend the chain from its current tail.
        match (chain.last(), &parent) {
            (None, None) => {}
            (None, Some(parent)) => {
                return Err((ErrorCode::ParentNotFound, parent.to_string()));
            }
            (Some(tail), None) => {
                return Err((
                    ErrorCode::ChainDivergence,
                    format!("full send of {} onto chain ending at {}", id, tail.id),
                ));
            }
            (Some(tail), Some(parent)) if &tail.id != parent => {
                if chain.iter().any(|s| &s.id == parent) {
                    return Err((
                        ErrorCode::ChainDivergence,
                        format!("parent {} is not the chain tail {}", parent, tail.id),
                    ));
                }
                return Err((ErrorCode::ParentNotFound, parent.to_string()));
            }
            (Some(_), Some(_)) => {}
        }

        Ok((subvolume, id, parent))
    }

    async fn transfer<R, W>(
        &mut self,
        begin: wire::TransferBegin,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (subvolume, id, parent) = match self.admit(&begin).await {
            Ok(admitted) => admitted,
            Err((code, message)) => {
                tracing::warn!(
                    subvolume = %begin.subvolume,
                    snapshot = %begin.snapshot,
                    code = code.as_str(),
                    "Rejected transfer: {}",
                    message
                );
                let result = wire::TransferResult::failed(begin.snapshot, code, message);
                return send_frame(writer, &result.encode()).await;
            }
        };

        let ready = wire::TransferReady {
            snapshot: id.to_string(),
        };
        send_frame(writer, &ready.encode()).await?;

        let name = subvolume.name.clone();
        let mut receiver = Receiver::start(self.server.driver.clone(), subvolume, id, parent);

        loop {
            let (msg_type, payload) = match read_frame_within(reader, self.server.idle_timeout).await {
                Ok(frame) => frame,
                Err(e) => {
                    receiver.abort("connection lost").await;
                    return Err(e);
                }
            };

            match msg_type {
                MessageType::Data => match wire::Data::decode(payload) {
                    Ok(data) => receiver.handle_data(data).await,
                    Err(e) => {
                        receiver.abort("malformed Data frame").await;
                        return Err(e);
                    }
                },
                MessageType::TransferEnd => {
                    let end = match wire::TransferEnd::decode(payload) {
                        Ok(end) => end,
                        Err(e) => {
                            receiver.abort("malformed TransferEnd").await;
                            return Err(e);
                        }
                    };
                    let bytes = receiver.bytes_received();
                    let snapshot = receiver.snapshot().clone();
                    let result = receiver.finish(end).await;
                    if result.is_ok() {
                        self.received += 1;
                        self.bytes += bytes;
                        tracing::info!(subvolume = %name, snapshot = %snapshot, bytes, "Received snapshot");
                    } else {
                        tracing::warn!(
                            subvolume = %name,
                            snapshot = %snapshot,
                            code = result.code.as_str(),
                            "Receive failed: {}",
                            result.message
                        );
                    }
                    return send_frame(writer, &result.encode()).await;
                }
                MessageType::TransferAbort => {
                    let reason = wire::TransferAbort::decode(payload)
                        .map(|abort| abort.message)
                        .unwrap_or_else(|_| "aborted by client".to_string());
                    tracing::warn!(subvolume = %name, snapshot = %receiver.snapshot(), "Client aborted transfer: {}", reason);
                    let result = receiver.abort(&reason).await;
                    return send_frame(writer, &result.encode()).await;
                }
                other => {
                    receiver.abort("protocol violation").await;
                    return Err(SyncError::protocol(format!(
                        "unexpected {:?} during transfer",
                        other
                    )));
                }
            }
        }
    }
}

async fn reply_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: ErrorCode,
    message: String,
) -> Result<()> {
    tracing::warn!(code = code.as_str(), "Request failed: {}", message);
    let error = wire::Error { code, message };
    send_frame(writer, &error.encode()).await
}

/// Run the server described by `config` until `cancel` fires.
pub async fn run_server(
    config: &Config,
    driver: Arc<dyn SubvolumeDriver>,
    cancel: CancellationToken,
) -> Result<()> {
    config.validate()?;

    let server = Server::new(driver, &config.subvolume, &config.destination_subvolume)
        .with_idle_timeout(config.idle_timeout());
    server.prepare().await?;
    let listener = transport::bind(&config.bind, config.port()).await?;
    server.serve(listener, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::streaming::protocol::{read_frame, Fatal, Hello, SnapshotsNeeded, SnapshotsPresent};
    use tokio::io::{duplex, split, AsyncWriteExt};

    fn server(driver: Arc<MemoryDriver>) -> Server {
        Server::new(driver, Path::new("/backup"), Path::new(".snapshots"))
    }

    fn start(
        server: Server,
    ) -> (
        tokio::task::JoinHandle<Result<()>>,
        impl AsyncRead + Unpin,
        impl AsyncWrite + Unpin,
    ) {
        let (client, remote) = duplex(1024 * 1024);
        let handle = tokio::spawn(async move {
            let (mut r, mut w) = split(remote);
            server.handle_connection(&mut r, &mut w).await
        });
        let (r, w) = split(client);
        (handle, r, w)
    }

    #[tokio::test]
    async fn test_version_mismatch_is_fatal() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let (handle, mut r, mut w) = start(server(driver));

        let mut hello = Hello::new(HelloFlags::empty());
        hello.version = 99;
        send_frame(&mut w, &hello.encode()).await.unwrap();

        let (msg_type, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::Fatal);
        assert!(Fatal::decode(payload).unwrap().message.contains("too new"));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transfer_without_session_rejected() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let (_handle, mut r, mut w) = start(server(driver));

        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();

        let id = SnapshotId::next_after("backup", None).unwrap();
        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: id.to_string(),
            parent: None,
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();

        let (msg_type, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::TransferResult);
        let result = wire::TransferResult::decode(payload).unwrap();
        assert_eq!(result.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_negotiation_reports_present_and_tail() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let mirror = Subvolume::mirror("data", Path::new("/backup"), Path::new(".snapshots")).unwrap();

        // Seed the mirror with one received snapshot.
        let first = SnapshotId::next_after("backup", None).unwrap();
        let second = SnapshotId::next_after("backup", Some(&first)).unwrap();
        let mut receiver = Receiver::start(driver.clone(), mirror.clone(), first.clone(), None);
        receiver
            .handle_data(wire::Data {
                flags: wire::DataFlags::empty(),
                data: bytes::Bytes::from_static(b"full"),
            })
            .await;
        let end = wire::TransferEnd {
            bytes: 4,
            checksum: xxhash_rust::xxh3::xxh3_64(b"full"),
        };
        assert!(receiver.finish(end).await.is_ok());

        let (_handle, mut r, mut w) = start(server(driver));
        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();

        let request = SnapshotsNeeded {
            subvolume: "data".into(),
            snapshots: vec![first.to_string(), second.to_string()],
        };
        send_frame(&mut w, &request.encode()).await.unwrap();
        let (msg_type, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::SnapshotsPresent);
        let reply = SnapshotsPresent::decode(payload).unwrap();
        assert_eq!(reply.present, vec![first.to_string()]);
        assert_eq!(reply.latest, Some(first.to_string()));

        // Same snapshot again is refused; an older one would break the chain.
        for (snapshot, code) in [
            (first.clone(), ErrorCode::InvalidRequest),
            (
                SnapshotId::new("backup", first.taken_at() - chrono::Duration::seconds(1)).unwrap(),
                ErrorCode::ChainDivergence,
            ),
        ] {
            let begin = wire::TransferBegin {
                subvolume: "data".into(),
                snapshot: snapshot.to_string(),
                parent: None,
            };
            send_frame(&mut w, &begin.encode()).await.unwrap();
            let (_, payload) = read_frame(&mut r).await.unwrap();
            assert_eq!(wire::TransferResult::decode(payload).unwrap().code, code);
        }

        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: second.to_string(),
            parent: Some(
                SnapshotId::new("other", first.taken_at())
                    .unwrap()
                    .to_string(),
            ),
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (_, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(
            wire::TransferResult::decode(payload).unwrap().code,
            ErrorCode::ParentNotFound
        );

        // A full send onto a non-empty chain would start a second chain.
        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: second.to_string(),
            parent: None,
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (_, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(
            wire::TransferResult::decode(payload).unwrap().code,
            ErrorCode::ChainDivergence
        );
    }

    #[tokio::test]
    async fn test_parent_must_be_chain_tail() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let mirror = Subvolume::mirror("data", Path::new("/backup"), Path::new(".snapshots")).unwrap();

        let first = SnapshotId::next_after("backup", None).unwrap();
        let second = SnapshotId::next_after("backup", Some(&first)).unwrap();
        let third = SnapshotId::next_after("backup", Some(&second)).unwrap();
        for (id, parent) in [(&first, None), (&second, Some(first.clone()))] {
            let body = id.to_string();
            let mut receiver = Receiver::start(driver.clone(), mirror.clone(), id.clone(), parent);
            receiver
                .handle_data(wire::Data {
                    flags: wire::DataFlags::empty(),
                    data: bytes::Bytes::from(body.clone()),
                })
                .await;
            let end = wire::TransferEnd {
                bytes: body.len() as u64,
                checksum: xxhash_rust::xxh3::xxh3_64(body.as_bytes()),
            };
            assert!(receiver.finish(end).await.is_ok());
        }

        let (_handle, mut r, mut w) = start(server(driver.clone()));
        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();
        let request = SnapshotsNeeded {
            subvolume: "data".into(),
            snapshots: vec![first.to_string(), second.to_string(), third.to_string()],
        };
        send_frame(&mut w, &request.encode()).await.unwrap();
        read_frame(&mut r).await.unwrap();

        // Skipping over the tail to an older parent is refused.
        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: third.to_string(),
            parent: Some(first.to_string()),
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (msg_type, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::TransferResult);
        assert_eq!(
            wire::TransferResult::decode(payload).unwrap().code,
            ErrorCode::ChainDivergence
        );
        assert_eq!(driver.list_snapshots(&mirror).await.unwrap().len(), 2);

        // The tail itself is accepted.
        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: third.to_string(),
            parent: Some(second.to_string()),
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (msg_type, _) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::TransferReady);
    }

    #[tokio::test]
    async fn test_first_snapshot_must_be_full() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let (_handle, mut r, mut w) = start(server(driver));
        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();

        let first = SnapshotId::next_after("backup", None).unwrap();
        let second = SnapshotId::next_after("backup", Some(&first)).unwrap();
        let request = SnapshotsNeeded {
            subvolume: "data".into(),
            snapshots: vec![first.to_string(), second.to_string()],
        };
        send_frame(&mut w, &request.encode()).await.unwrap();
        read_frame(&mut r).await.unwrap();

        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: second.to_string(),
            parent: Some(first.to_string()),
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (_, payload) = read_frame(&mut r).await.unwrap();
        assert_eq!(
            wire::TransferResult::decode(payload).unwrap().code,
            ErrorCode::ParentNotFound
        );
    }

    #[tokio::test]
    async fn test_silent_client_releases_session() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let server = server(driver).with_idle_timeout(Duration::from_millis(200));
        let request = SnapshotsNeeded {
            subvolume: "data".into(),
            snapshots: Vec::new(),
        };

        // First client claims the subvolume, then goes quiet without closing.
        let (stalled, mut stalled_r, mut stalled_w) = start(server.clone());
        send_frame(&mut stalled_w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut stalled_r).await.unwrap();
        send_frame(&mut stalled_w, &request.encode()).await.unwrap();
        let (msg_type, _) = read_frame(&mut stalled_r).await.unwrap();
        assert_eq!(msg_type, MessageType::SnapshotsPresent);

        let (_handle, mut r, mut w) = start(server);
        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();
        send_frame(&mut w, &request.encode()).await.unwrap();
        let (msg_type, _) = tokio::time::timeout(Duration::from_secs(5), read_frame(&mut r))
            .await
            .expect("second client was never answered")
            .unwrap();
        assert_eq!(msg_type, MessageType::SnapshotsPresent);

        let err = stalled.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        drop(stalled_w);
    }

    #[tokio::test]
    async fn test_disconnect_mid_transfer_leaves_nothing() {
        let driver = Arc::new(MemoryDriver::new().with_subvolume("/backup"));
        let mirror = Subvolume::mirror("data", Path::new("/backup"), Path::new(".snapshots")).unwrap();
        let (handle, mut r, mut w) = start(server(driver.clone()));

        send_frame(&mut w, &Hello::new(HelloFlags::empty()).encode())
            .await
            .unwrap();
        read_frame(&mut r).await.unwrap();
        let id = SnapshotId::next_after("backup", None).unwrap();
        let request = SnapshotsNeeded {
            subvolume: "data".into(),
            snapshots: vec![id.to_string()],
        };
        send_frame(&mut w, &request.encode()).await.unwrap();
        read_frame(&mut r).await.unwrap();

        let begin = wire::TransferBegin {
            subvolume: "data".into(),
            snapshot: id.to_string(),
            parent: None,
        };
        send_frame(&mut w, &begin.encode()).await.unwrap();
        let (msg_type, _) = read_frame(&mut r).await.unwrap();
        assert_eq!(msg_type, MessageType::TransferReady);

        let data = wire::Data {
            flags: wire::DataFlags::empty(),
            data: bytes::Bytes::from_static(b"partial"),
        };
        send_frame(&mut w, &data.encode()).await.unwrap();
        w.shutdown().await.unwrap();
        drop(w);
        drop(r);

        assert!(handle.await.unwrap().is_err());
        assert!(driver.list_snapshots(&mirror).await.unwrap().is_empty());
    }
}
