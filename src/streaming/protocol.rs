//! Wire protocol message types.
//!
//! Client-driven request/response with one streaming phase per snapshot:
//! Hello, SnapshotsNeeded/SnapshotsPresent, then for each missing snapshot
//! TransferBegin/TransferReady, a run of Data frames, TransferEnd (or
//! TransferAbort) and TransferResult. Done closes the session.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SyncError};

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Minimum supported protocol version
pub const PROTOCOL_VERSION_MIN: u16 = 1;

/// Maximum supported protocol version
pub const PROTOCOL_VERSION_MAX: u16 = 1;

/// Longest message string carried on the wire (bytes).
const MAX_MESSAGE_LEN: usize = 4096;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u16 len + UTF-8)
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    SnapshotsNeeded = 0x02,
    SnapshotsPresent = 0x03,
    TransferBegin = 0x04,
    TransferReady = 0x05,
    Data = 0x06,
    TransferEnd = 0x07,
    TransferAbort = 0x08,
    TransferResult = 0x09,
    Error = 0x0D,
    Fatal = 0x0E,
    Done = 0x10,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::SnapshotsNeeded),
            0x03 => Some(Self::SnapshotsPresent),
            0x04 => Some(Self::TransferBegin),
            0x05 => Some(Self::TransferReady),
            0x06 => Some(Self::Data),
            0x07 => Some(Self::TransferEnd),
            0x08 => Some(Self::TransferAbort),
            0x09 => Some(Self::TransferResult),
            0x0D => Some(Self::Error),
            0x0E => Some(Self::Fatal),
            0x10 => Some(Self::Done),
            _ => None,
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HelloFlags: u32 {
        const COMPRESSION = 1 << 0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataFlags: u8 {
        const COMPRESSED = 1 << 0;
    }
}

// =============================================================================
// Error Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Ok = 0,
    DriverFailure = 1,
    CorruptStream = 2,
    ParentNotFound = 3,
    ChainDivergence = 4,
    InvalidRequest = 5,
    InsufficientSpace = 6,
    SnapshotNotFound = 7,
    Aborted = 8,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::DriverFailure),
            2 => Some(Self::CorruptStream),
            3 => Some(Self::ParentNotFound),
            4 => Some(Self::ChainDivergence),
            5 => Some(Self::InvalidRequest),
            6 => Some(Self::InsufficientSpace),
            7 => Some(Self::SnapshotNotFound),
            8 => Some(Self::Aborted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::DriverFailure => "driver_failure",
            Self::CorruptStream => "corrupt_stream",
            Self::ParentNotFound => "parent_not_found",
            Self::ChainDivergence => "chain_divergence",
            Self::InvalidRequest => "invalid_request",
            Self::InsufficientSpace => "insufficient_space",
            Self::SnapshotNotFound => "snapshot_not_found",
            Self::Aborted => "aborted",
        }
    }
}

// =============================================================================
// Encoding helpers
// =============================================================================

fn frame(msg_type: MessageType, payload: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg_type as u8);
    buf.put_slice(&payload);
    buf.freeze()
}

/// Free-form text is cut at `MAX_MESSAGE_LEN`. Names and snapshot ids are
/// capped far below that when they are validated, so they always survive.
fn put_str(buf: &mut BytesMut, s: &str) {
    let mut end = s.len().min(MAX_MESSAGE_LEN);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    buf.put_u16(end as u16);
    buf.put_slice(&s.as_bytes()[..end]);
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_str(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(SyncError::protocol(format!("{} truncated", what)));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(SyncError::protocol(format!("{} truncated", what)));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::protocol(format!("Invalid UTF-8 in {}", what)))
}

fn get_opt_str(payload: &mut Bytes, what: &str) -> Result<Option<String>> {
    if payload.remaining() < 1 {
        return Err(SyncError::protocol(format!("{} truncated", what)));
    }
    match payload.get_u8() {
        0 => Ok(None),
        1 => get_str(payload, what).map(Some),
        other => Err(SyncError::protocol(format!(
            "Invalid presence marker {} for {}",
            other, what
        ))),
    }
}

fn get_str_list(payload: &mut Bytes, what: &str) -> Result<Vec<String>> {
    if payload.remaining() < 4 {
        return Err(SyncError::protocol(format!("{} count truncated", what)));
    }
    let count = payload.get_u32() as usize;
    // Each entry needs at least its length prefix.
    if count > payload.remaining() / 2 {
        return Err(SyncError::protocol(format!("{} count {} too large", what, count)));
    }
    (0..count).map(|_| get_str(payload, what)).collect()
}

fn put_str_list(buf: &mut BytesMut, items: &[String]) {
    buf.put_u32(items.len() as u32);
    for item in items {
        put_str(buf, item);
    }
}

// =============================================================================
// HELLO (0x01)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Hello {
    pub version: u16,
    pub flags: HelloFlags,
}

impl Hello {
    pub fn new(flags: HelloFlags) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u16(self.version);
        buf.put_u32(self.flags.bits());
        frame(MessageType::Hello, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 6 {
            return Err(SyncError::protocol("Hello payload too short"));
        }
        Ok(Self {
            version: payload.get_u16(),
            flags: HelloFlags::from_bits_truncate(payload.get_u32()),
        })
    }
}

// =============================================================================
// SNAPSHOTS_NEEDED (0x02)
// =============================================================================

/// Client's full local chain for one subvolume, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotsNeeded {
    pub subvolume: String,
    pub snapshots: Vec<String>,
}

impl SnapshotsNeeded {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.subvolume);
        put_str_list(&mut buf, &self.snapshots);
        frame(MessageType::SnapshotsNeeded, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let subvolume = get_str(&mut payload, "SnapshotsNeeded subvolume")?;
        let snapshots = get_str_list(&mut payload, "SnapshotsNeeded snapshots")?;
        Ok(Self {
            subvolume,
            snapshots,
        })
    }
}

// =============================================================================
// SNAPSHOTS_PRESENT (0x03)
// =============================================================================

/// Which of the claimed snapshots the server holds, plus its chain tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotsPresent {
    pub present: Vec<String>,
    pub latest: Option<String>,
}

impl SnapshotsPresent {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str_list(&mut buf, &self.present);
        put_opt_str(&mut buf, self.latest.as_deref());
        frame(MessageType::SnapshotsPresent, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let present = get_str_list(&mut payload, "SnapshotsPresent snapshots")?;
        let latest = get_opt_str(&mut payload, "SnapshotsPresent latest")?;
        Ok(Self { present, latest })
    }
}

// =============================================================================
// TRANSFER_BEGIN (0x04)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBegin {
    pub subvolume: String,
    pub snapshot: String,
    pub parent: Option<String>,
}

impl TransferBegin {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.subvolume);
        put_str(&mut buf, &self.snapshot);
        put_opt_str(&mut buf, self.parent.as_deref());
        frame(MessageType::TransferBegin, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let subvolume = get_str(&mut payload, "TransferBegin subvolume")?;
        let snapshot = get_str(&mut payload, "TransferBegin snapshot")?;
        let parent = get_opt_str(&mut payload, "TransferBegin parent")?;
        Ok(Self {
            subvolume,
            snapshot,
            parent,
        })
    }
}

// =============================================================================
// TRANSFER_READY (0x05)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReady {
    pub snapshot: String,
}

impl TransferReady {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.snapshot);
        frame(MessageType::TransferReady, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let snapshot = get_str(&mut payload, "TransferReady snapshot")?;
        Ok(Self { snapshot })
    }
}

// =============================================================================
// DATA (0x06)
// =============================================================================

#[derive(Debug, Clone)]
pub struct Data {
    pub flags: DataFlags,
    pub data: Bytes,
}

impl Data {
    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + 4 + self.data.len();

        let mut buf = BytesMut::with_capacity(5 + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(MessageType::Data as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);

        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 5 {
            return Err(SyncError::protocol("Data payload too short"));
        }
        let flags = DataFlags::from_bits_truncate(payload.get_u8());
        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            return Err(SyncError::protocol("Data content truncated"));
        }
        let data = payload.copy_to_bytes(data_len);

        Ok(Self { flags, data })
    }
}

// =============================================================================
// TRANSFER_END (0x07)
// =============================================================================

/// Length and xxh3-64 of the uncompressed stream just sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEnd {
    pub bytes: u64,
    pub checksum: u64,
}

impl TransferEnd {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.bytes);
        buf.put_u64(self.checksum);
        frame(MessageType::TransferEnd, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            return Err(SyncError::protocol("TransferEnd payload too short"));
        }
        Ok(Self {
            bytes: payload.get_u64(),
            checksum: payload.get_u64(),
        })
    }
}

// =============================================================================
// TRANSFER_ABORT (0x08)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferAbort {
    pub message: String,
}

impl TransferAbort {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.message);
        frame(MessageType::TransferAbort, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let message = get_str(&mut payload, "TransferAbort message")?;
        Ok(Self { message })
    }
}

// =============================================================================
// TRANSFER_RESULT (0x09)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub snapshot: String,
    pub code: ErrorCode,
    pub message: String,
}

impl TransferResult {
    pub fn ok(snapshot: impl Into<String>) -> Self {
        Self {
            snapshot: snapshot.into(),
            code: ErrorCode::Ok,
            message: String::new(),
        }
    }

    pub fn failed(snapshot: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            snapshot: snapshot.into(),
            code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_str(&mut buf, &self.snapshot);
        buf.put_u16(self.code as u16);
        put_str(&mut buf, &self.message);
        frame(MessageType::TransferResult, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let snapshot = get_str(&mut payload, "TransferResult snapshot")?;
        if payload.remaining() < 2 {
            return Err(SyncError::protocol("TransferResult code truncated"));
        }
        let raw = payload.get_u16();
        let code = ErrorCode::from_u16(raw)
            .ok_or_else(|| SyncError::protocol(format!("Unknown error code {}", raw)))?;
        let message = get_str(&mut payload, "TransferResult message")?;
        Ok(Self {
            snapshot,
            code,
            message,
        })
    }
}

// =============================================================================
// ERROR (0x0D) / FATAL (0x0E)
// =============================================================================

/// Request-level failure; the session stays usable.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
}

impl Error {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.code as u16);
        put_str(&mut buf, &self.message);
        frame(MessageType::Error, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(SyncError::protocol("Error payload too short"));
        }
        let raw = payload.get_u16();
        let code = ErrorCode::from_u16(raw).unwrap_or(ErrorCode::DriverFailure);
        let message = get_str(&mut payload, "Error message")?;
        Ok(Self { code, message })
    }

    pub fn into_sync_error(self) -> SyncError {
        SyncError::Remote {
            code: self.code,
            message: self.message,
        }
    }
}

/// Session-ending failure; the sender closes the connection after it.
#[derive(Debug, Clone)]
pub struct Fatal {
    pub code: u16,
    pub message: String,
}

impl Fatal {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16(self.code);
        put_str(&mut buf, &self.message);
        frame(MessageType::Fatal, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 2 {
            return Err(SyncError::protocol("Fatal payload too short"));
        }
        let code = payload.get_u16();
        let message = get_str(&mut payload, "Fatal message")?;
        Ok(Self { code, message })
    }
}

// =============================================================================
// DONE (0x10)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    pub snapshots: u64,
    pub bytes: u64,
}

impl Done {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(self.snapshots);
        buf.put_u64(self.bytes);
        frame(MessageType::Done, buf)
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            return Err(SyncError::protocol("Done payload too short"));
        }
        Ok(Self {
            snapshots: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    // Validate frame size before allocation
    if len > MAX_FRAME_SIZE {
        return Err(SyncError::protocol(format!(
            "Frame size {} exceeds maximum allowed size {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::protocol(format!("Unknown message type 0x{:02x}", msg_type)))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
/// [`read_frame`], giving up when the peer sends nothing for `idle`.
pub async fn read_frame_within<R: AsyncRead + Unpin>(
    r: &mut R,
    idle: Duration,
) -> Result<(MessageType, Bytes)> {
    match tokio::time::timeout(idle, read_frame(r)).await {
        Ok(frame) => frame,
        Err(_) => Err(SyncError::timed_out("waiting for peer", idle)),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

/// Write a frame and flush; used for every frame that expects a reply.
pub async fn send_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    write_frame(w, frame).await?;
    w.flush().await?;
    Ok(())
}

// =============================================================================
// Version Negotiation
// =============================================================================

/// Result of version negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationResult {
    /// Version is supported
    Supported(u16),
    /// Version is too old (client needs upgrade)
    TooOld { client: u16, min_supported: u16 },
    /// Version is too new (server needs upgrade)
    TooNew { client: u16, max_supported: u16 },
}

/// Check if a client protocol version is supported.
pub fn negotiate_version(client_version: u16) -> VersionNegotiationResult {
    if client_version < PROTOCOL_VERSION_MIN {
        VersionNegotiationResult::TooOld {
            client: client_version,
            min_supported: PROTOCOL_VERSION_MIN,
        }
    } else if client_version > PROTOCOL_VERSION_MAX {
        VersionNegotiationResult::TooNew {
            client: client_version,
            max_supported: PROTOCOL_VERSION_MAX,
        }
    } else {
        VersionNegotiationResult::Supported(client_version)
    }
}

// =============================================================================
// Tests
// =============================================================================
