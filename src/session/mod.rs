//! Session module - Protocol state layered on top of a framed connection
//!
//! Provides:
//! - Login handshake state machines for both ends of a connection
//! - The server-side allow-list and peer session table
//! - Heartbeat scheduling (client) and heartbeat replies (server)
//!
//! Everything here is transport-agnostic: the network layer feeds decoded
//! messages in and writes whatever comes back out.

mod handshake;
mod heartbeat;

pub use handshake::*;
pub use heartbeat::*;
