//! Login handshake
//!
//! The client sends a bodiless login request as soon as the transport is up;
//! identity is the source address. The server answers with a single result
//! byte after checking the peer IP against its allow-list and making sure
//! the peer address has no other live session.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::protocol::{Message, MessageType, LOGIN_ACCEPTED, LOGIN_REJECTED};

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Peer {0} already has an active session")]
    DuplicateSession(SocketAddr),
}

/// Handshake progress of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport is being established
    Connecting,
    /// Client sent its login request
    AwaitingLoginResp,
    /// Server is waiting for a login request
    AwaitingLoginReq,
    /// Login accepted
    Authenticated,
    /// Connection is gone
    Closed,
}

/// What the client should do with an inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientStep {
    /// Login accepted; heartbeats may start
    Authenticated,
    /// The message was handled by the handshake
    Consumed,
    /// Not a handshake message, pass it on
    Forward(Message),
}

/// Client side of the login handshake
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Connecting,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Transport is up: produce the login request to send
    pub fn on_connected(&mut self) -> Message {
        self.state = HandshakeState::AwaitingLoginResp;
        Message::login_req()
    }

    /// Feed one inbound message through the handshake
    ///
    /// A rejecting login response moves the handshake to `Closed` and
    /// returns an error; the caller is expected to drop the connection.
    pub fn on_message(&mut self, message: Message) -> Result<ClientStep, HandshakeError> {
        if message.message_type() != MessageType::LoginResp {
            return Ok(ClientStep::Forward(message));
        }

        if self.state != HandshakeState::AwaitingLoginResp {
            tracing::warn!("Ignoring unexpected login response in state {:?}", self.state);
            return Ok(ClientStep::Consumed);
        }

        match message.login_result() {
            Some(LOGIN_ACCEPTED) => {
                tracing::info!("Login is ok: {}", message);
                self.state = HandshakeState::Authenticated;
                Ok(ClientStep::Authenticated)
            }
            Some(code) => {
                self.state = HandshakeState::Closed;
                Err(HandshakeError::AuthenticationRejected(format!(
                    "server answered {}",
                    code
                )))
            }
            None => {
                self.state = HandshakeState::Closed;
                Err(HandshakeError::AuthenticationRejected(
                    "login response carries no result byte".to_string(),
                ))
            }
        }
    }

    pub fn on_closed(&mut self) {
        self.state = HandshakeState::Closed;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed set of peer IPs allowed to log in, matched by exact string
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    addresses: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.addresses.contains(&ip.to_string())
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Peer addresses holding an authenticated session
///
/// Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<SocketAddr, Instant>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer: &SocketAddr) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// When the session for `peer` was registered
    pub fn registered_at(&self, peer: &SocketAddr) -> Option<Instant> {
        self.sessions.get(peer).map(|entry| *entry.value())
    }

    fn remove(&self, peer: &SocketAddr) {
        self.sessions.remove(peer);
    }
}

/// Keeps a peer registered in the [`SessionTable`]; removes it on drop
#[derive(Debug)]
pub struct SessionGuard {
    table: SessionTable,
    peer: SocketAddr,
}

impl SessionGuard {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.table.remove(&self.peer);
        tracing::debug!("Released session for {}", self.peer);
    }
}

/// Decides login requests against the allow-list and the session table
#[derive(Debug, Clone)]
pub struct LoginAuthenticator {
    allow_list: Arc<AllowList>,
    sessions: SessionTable,
}

impl LoginAuthenticator {
    pub fn new(allow_list: AllowList, sessions: SessionTable) -> Self {
        Self {
            allow_list: Arc::new(allow_list),
            sessions,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Register `peer` if it is allowed and has no session yet
    pub fn authenticate(&self, peer: SocketAddr) -> Result<SessionGuard, HandshakeError> {
        match self.sessions.sessions.entry(peer) {
            Entry::Occupied(_) => return Err(HandshakeError::DuplicateSession(peer)),
            Entry::Vacant(slot) => {
                if !self.allow_list.contains(&peer.ip()) {
                    return Err(HandshakeError::AuthenticationRejected(format!(
                        "{} is not on the allow-list",
                        peer.ip()
                    )));
                }
                slot.insert(Instant::now());
            }
        }

        Ok(SessionGuard {
            table: self.sessions.clone(),
            peer,
        })
    }
}

/// What the server should do with an inbound message
#[derive(Debug, PartialEq)]
pub enum ServerStep {
    /// Login accepted; send the reply
    LoginAccepted(Message),
    /// Login refused; send the reply and keep the connection open
    LoginRejected(Message, HandshakeError),
    /// Not a login request, pass it on
    Forward(Message),
}

/// Server side of the login handshake for one connection
#[derive(Debug)]
pub struct ServerHandshake {
    peer: SocketAddr,
    authenticator: LoginAuthenticator,
    state: HandshakeState,
    session: Option<SessionGuard>,
}

impl ServerHandshake {
    pub fn new(peer: SocketAddr, authenticator: LoginAuthenticator) -> Self {
        Self {
            peer,
            authenticator,
            state: HandshakeState::AwaitingLoginReq,
            session: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == HandshakeState::Authenticated
    }

    /// Feed one inbound message through the handshake
    pub fn on_message(&mut self, message: Message) -> ServerStep {
        if message.message_type() != MessageType::LoginReq {
            return ServerStep::Forward(message);
        }

        match self.authenticator.authenticate(self.peer) {
            Ok(guard) => {
                self.session = Some(guard);
                self.state = HandshakeState::Authenticated;
                let reply = Message::login_resp(LOGIN_ACCEPTED);
                tracing::info!("The login response to {} is: {}", self.peer, reply);
                ServerStep::LoginAccepted(reply)
            }
            Err(e) => {
                let reply = Message::login_resp(LOGIN_REJECTED);
                tracing::warn!("Rejecting login from {}: {}", self.peer, e);
                ServerStep::LoginRejected(reply, e)
            }
        }
    }

    /// Connection ended: release the peer's session entry
    pub fn on_closed(&mut self) {
        self.session = None;
        self.state = HandshakeState::Closed;
    }
}
