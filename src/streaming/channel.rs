//! Channel types and constants for the snapshot streaming pipeline.
//!
//! Sender task -> orchestrator (encoded Data frames) on the client,
//! connection handler -> driver receive (raw bytes) on the server.
//! Both use bounded channels for backpressure.

use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;
use xxhash_rust::xxh3::Xxh3;

use crate::error::DriverError;

/// Channel size for sender task -> wire (encoded frames)
pub const SENDER_CHANNEL_SIZE: usize = 64;

/// Channel size for wire -> driver receive (raw chunks)
pub const RECEIVER_CHANNEL_SIZE: usize = 64;

/// Data chunk size for transfer
pub const DATA_CHUNK_SIZE: usize = 256 * 1024; // 256KB

/// zstd level for compressed Data frames
pub const COMPRESSION_LEVEL: i32 = 3;

// =============================================================================
// Sender task -> orchestrator
// =============================================================================

/// Output of the sender task.
#[derive(Debug)]
pub enum SenderMessage {
    /// An encoded Data frame ready for the wire.
    Frame(Bytes),
    /// The driver stream failed; nothing more will follow.
    Failed(DriverError),
}

pub type FrameSender = mpsc::Sender<SenderMessage>;
pub type FrameReceiver = mpsc::Receiver<SenderMessage>;

/// Create a bounded channel for sender task -> orchestrator communication
pub fn frame_channel() -> (FrameSender, FrameReceiver) {
    mpsc::channel(SENDER_CHANNEL_SIZE)
}

// =============================================================================
// Wire -> driver receive
// =============================================================================

pub type ChunkSender = futures::channel::mpsc::Sender<io::Result<Bytes>>;
pub type ChunkReceiver = futures::channel::mpsc::Receiver<io::Result<Bytes>>;

/// Create a bounded channel whose receiving half is a driver byte stream
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    futures::channel::mpsc::channel(RECEIVER_CHANNEL_SIZE)
}

// =============================================================================
// Stream digest
// =============================================================================

/// Running length and xxh3-64 of an uncompressed snapshot stream.
pub struct StreamDigest {
    bytes: u64,
    hasher: Xxh3,
}

impl Default for StreamDigest {
    fn default() -> Self {
        Self {
            bytes: 0,
            hasher: Xxh3::new(),
        }
    }
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        self.hasher.update(data);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn checksum(&self) -> u64 {
        self.hasher.digest()
    }
}

// =============================================================================
// Transfer statistics
// =============================================================================

/// Statistics for one snapshot transfer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Uncompressed stream bytes
    pub bytes: u64,

    /// Bytes actually written as Data payloads
    pub wire_bytes: u64,

    /// Data frames sent
    pub frames: u64,

    /// xxh3-64 of the uncompressed stream
    pub checksum: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_chunking_independent() {
        let mut whole = StreamDigest::new();
        whole.update(b"hello world");

        let mut split = StreamDigest::new();
        split.update(b"hello");
        split.update(b" world");

        assert_eq!(whole.bytes(), 11);
        assert_eq!(whole.checksum(), split.checksum());
        assert_eq!(whole.checksum(), xxhash_rust::xxh3::xxh3_64(b"hello world"));
    }

    #[tokio::test]
    async fn test_frame_channel() {
        let (tx, mut rx) = frame_channel();
        tx.send(SenderMessage::Frame(Bytes::from_static(b"x")))
            .await
            .unwrap();
        drop(tx);

        match rx.recv().await {
            Some(SenderMessage::Frame(bytes)) => assert_eq!(&bytes[..], b"x"),
            other => panic!("Expected Frame message, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }
}
