//! TCP session to a remote snapsync server.
//!
//! Provides buffered read/write halves. Protocol handling is done by the
//! sync layer.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, SyncError};

/// Read/write buffer size for a session.
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

pub type SessionReader = BufReader<OwnedReadHalf>;
pub type SessionWriter = BufWriter<OwnedWriteHalf>;

/// Manages the connection to a remote server
pub struct ServerSession {
    peer: SocketAddr,
    reader: SessionReader,
    writer: SessionWriter,
}

impl ServerSession {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                SyncError::Network(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {}:{} timed out after {:?}", host, port, timeout),
                ))
            })?
            .map_err(|e| {
                SyncError::Network(io::Error::new(
                    e.kind(),
                    format!("cannot connect to {}:{}: {}", host, port, e),
                ))
            })?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        tracing::debug!(peer = %peer, "Connected");

        Ok(Self {
            peer,
            reader: BufReader::with_capacity(SOCKET_BUFFER_SIZE, read),
            writer: BufWriter::with_capacity(SOCKET_BUFFER_SIZE, write),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Get mutable references to the read and write halves.
    pub fn split(&mut self) -> (&mut SessionReader, &mut SessionWriter) {
        (&mut self.reader, &mut self.writer)
    }

    /// Split an accepted stream the same way the client side does.
    pub fn into_parts(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}

/// Bind the server listener.
pub async fn bind(address: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((address, port)).await.map_err(|e| {
        SyncError::Network(io::Error::new(
            e.kind(),
            format!("cannot listen on {}:{}: {}", address, port, e),
        ))
    })
}
