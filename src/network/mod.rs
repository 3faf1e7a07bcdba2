//! Network module - Handles TCP communication between nodes
//!
//! Provides:
//! - Server for accepting incoming connections
//! - Client for connecting to servers, with automatic reconnect
//! - Connection management and message routing

mod server;
mod client;
mod connection;
mod reconnect;

pub use server::*;
pub use client::*;
pub use connection::*;
pub use reconnect::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::MAX_FRAME_LENGTH;
use crate::session::DEFAULT_HEARTBEAT_INTERVAL;

/// Default read inactivity timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(50);

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// A connection with no inbound bytes for this long is dropped
    pub read_timeout_secs: u64,
    /// Maximum frame size, header included
    pub max_frame_length: usize,
    /// Local address the client binds before connecting
    pub local_addr: Option<SocketAddr>,
    /// How the client retries after a connection ends
    pub reconnect: ReconnectPolicy,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            read_timeout_secs: DEFAULT_READ_TIMEOUT.as_secs(),
            max_frame_length: MAX_FRAME_LENGTH,
            local_addr: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl NetworkConfig {
    pub fn with_local_addr(mut self, local_addr: SocketAddr) -> Self {
        self.local_addr = Some(local_addr);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
