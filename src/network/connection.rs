//! Connection handling for NodeLink
//!
//! Manages individual peer connections, including:
//! - Message encoding/decoding
//! - Read inactivity timeout
//! - Connection statistics

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::Decoder;

use super::DEFAULT_READ_TIMEOUT;
use crate::protocol::{CodecError, Message, MessageCodec};
use crate::session::HandshakeError;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Connection closed")]
    Closed,

    #[error("No data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("Send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// A framed connection to a remote NodeLink node
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The byte stream
    stream: S,
    /// Protocol codec
    codec: MessageCodec,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Inbound silence after which reads fail
    read_timeout: Duration,
    /// Last time bytes arrived
    last_read: Instant,
    /// Statistics
    stats: ConnectionStats,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection over an established stream
    pub fn new(stream: S, remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            stream,
            codec: MessageCodec::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            read_timeout: DEFAULT_READ_TIMEOUT,
            last_read: Instant::now(),
            stats: ConnectionStats::default(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.codec = MessageCodec::with_max_frame_length(max_frame_length);
        self
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.codec.encode_message(message, &mut self.write_buf)?;

        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive the next message, or `None` on a clean close
    ///
    /// Cancel safe: partial frames stay buffered, and the inactivity
    /// deadline is measured from the last inbound bytes, not from this call.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(message));
            }

            let deadline = self.last_read + self.read_timeout;
            let n = match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(result) => result?,
                Err(_) => return Err(ConnectionError::ReadTimeout(self.read_timeout)),
            };

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.last_read = Instant::now();
            self.stats.bytes_received += n as u64;
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> ConnectionResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// A handle for sending messages to a connection
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Message>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Send a message through this connection
    pub async fn send(&self, message: Message) -> Result<(), ConnectionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }

        self.sender
            .send(message)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    /// Check if the connection is still active
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Mark the connection as disconnected
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
