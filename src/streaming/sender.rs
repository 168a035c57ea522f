//! Sender task for snapshot streaming.
//!
//! Pulls a driver byte stream, cuts it into Data frames (optionally zstd
//! compressed) and hands the encoded frames to the orchestrator.

use bytes::Bytes;
use futures::StreamExt;

use crate::driver::ByteStream;
use crate::error::DriverError;
use crate::streaming::channel::{
    FrameSender, SenderMessage, StreamDigest, TransferStats, COMPRESSION_LEVEL, DATA_CHUNK_SIZE,
};
use crate::streaming::protocol::{Data, DataFlags};

/// Sender configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderConfig {
    /// Whether to compress data
    pub compress: bool,
}

/// Sender state
pub struct Sender {
    config: SenderConfig,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Self {
        Self { config }
    }

    /// Run the sender until the stream ends, fails, or the receiver hangs up.
    ///
    /// A stream error is forwarded as [`SenderMessage::Failed`]; the returned
    /// stats cover everything sent before it.
    pub async fn run(self, mut stream: ByteStream, tx: FrameSender) -> TransferStats {
        let mut digest = StreamDigest::new();
        let mut stats = TransferStats::default();

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = tx
                        .send(SenderMessage::Failed(DriverError::failed(
                            "send",
                            e.to_string(),
                        )))
                        .await;
                    return stats;
                }
            };

            let mut offset = 0;
            while offset < chunk.len() {
                let end = (offset + DATA_CHUNK_SIZE).min(chunk.len());
                let piece = chunk.slice(offset..end);
                offset = end;

                digest.update(&piece);
                let data = self.encode_piece(piece);
                stats.wire_bytes += data.data.len() as u64;
                stats.frames += 1;

                if tx.send(SenderMessage::Frame(data.encode())).await.is_err() {
                    // Orchestrator gave up on this transfer
                    return stats;
                }
            }
        }

        stats.bytes = digest.bytes();
        stats.checksum = digest.checksum();
        stats
    }

    fn encode_piece(&self, piece: Bytes) -> Data {
        if self.config.compress {
            // Only keep the compressed form when it actually saves space
            if let Ok(compressed) = zstd::bulk::compress(&piece, COMPRESSION_LEVEL) {
                if compressed.len() < piece.len() {
                    return Data {
                        flags: DataFlags::COMPRESSED,
                        data: Bytes::from(compressed),
                    };
                }
            }
        }
        Data {
            flags: DataFlags::empty(),
            data: piece,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::channel::frame_channel;
    use crate::streaming::protocol::MessageType;
    use futures::stream;
    use std::io;

    async fn drain(mut rx: crate::streaming::channel::FrameReceiver) -> Vec<SenderMessage> {
        let mut out = Vec::new();
        while let Some(msg) = rx.recv().await {
            out.push(msg);
        }
        out
    }

    fn data_of(msg: &SenderMessage) -> Data {
        match msg {
            SenderMessage::Frame(frame) => {
                assert_eq!(frame[4], MessageType::Data as u8);
                Data::decode(frame.slice(5..)).unwrap()
            }
            other => panic!("Expected Frame message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_chunk_is_split() {
        let payload = Bytes::from(vec![0xABu8; DATA_CHUNK_SIZE * 2 + 10]);
        let input: ByteStream = stream::iter(vec![Ok(payload.clone())]).boxed();

        let (tx, rx) = frame_channel();
        let handle = tokio::spawn(Sender::new(SenderConfig::default()).run(input, tx));
        let messages = drain(rx).await;
        let stats = handle.await.unwrap();

        assert_eq!(messages.len(), 3);
        assert_eq!(data_of(&messages[2]).data.len(), 10);
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.bytes, payload.len() as u64);
        assert_eq!(stats.checksum, xxhash_rust::xxh3::xxh3_64(&payload));
    }

    #[tokio::test]
    async fn test_compression_applied_when_smaller() {
        let input: ByteStream = stream::iter(vec![Ok(Bytes::from(vec![0u8; 64 * 1024]))]).boxed();

        let (tx, rx) = frame_channel();
        let handle = tokio::spawn(Sender::new(SenderConfig { compress: true }).run(input, tx));
        let messages = drain(rx).await;
        let stats = handle.await.unwrap();

        let data = data_of(&messages[0]);
        assert!(data.flags.contains(DataFlags::COMPRESSED));
        assert!(stats.wire_bytes < stats.bytes);

        let restored = zstd::bulk::decompress(&data.data, DATA_CHUNK_SIZE).unwrap();
        assert_eq!(restored.len(), 64 * 1024);
    }

    #[tokio::test]
    async fn test_stream_error_forwarded() {
        let input: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("disk went away")),
        ])
        .boxed();

        let (tx, rx) = frame_channel();
        let handle = tokio::spawn(Sender::new(SenderConfig::default()).run(input, tx));
        let messages = drain(rx).await;
        handle.await.unwrap();

        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[1],
            SenderMessage::Failed(DriverError::Failed { op: "send", .. })
        ));
    }
}
