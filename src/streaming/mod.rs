//! Snapshot streaming between peers.
//!
//! # Architecture
//!
//! ```text
//! Client (push)                                   Server
//! +-------------+     +----------------+          +------------+     +-------------+
//! | driver send | --> | Sender task    | --wire-> | Receiver   | --> | driver recv |
//! | (ByteStream)|     | (Data frames)  |          | (verify)   |     | (atomic)    |
//! +-------------+     +----------------+          +------------+     +-------------+
//!                            ^
//!                     TransferPipeline drives one snapshot at a time
//! ```
//!
//! Each snapshot is framed as TransferBegin / Data* / TransferEnd and
//! acknowledged with a TransferResult before the next one starts.

pub mod channel;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod sender;

pub use channel::{
    SenderMessage, StreamDigest, TransferStats, DATA_CHUNK_SIZE, RECEIVER_CHANNEL_SIZE,
    SENDER_CHANNEL_SIZE,
};

pub use pipeline::{FailedTransfer, PipelineOutcome, TransferPipeline};
pub use receiver::Receiver;
pub use sender::{Sender, SenderConfig};

pub use protocol::{
    read_frame, send_frame, write_frame, Data, DataFlags, Done, Error, ErrorCode, Fatal, Hello,
    HelloFlags, MessageType, SnapshotsNeeded, SnapshotsPresent, TransferAbort, TransferBegin,
    TransferEnd, TransferReady, TransferResult, PROTOCOL_VERSION,
};
