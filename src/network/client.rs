//! NodeLink Client
//!
//! Connects to a NodeLink server, logs in, keeps the link alive with
//! heartbeats and reconnects whenever the connection ends.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::NetworkConfig;
use crate::protocol::{Message, MessageType};
use crate::session::{ClientHandshake, ClientStep, HandshakeState, HeartbeatTimer};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Connection timeout")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// TCP connection established, login request sent
    Connected {
        server_addr: SocketAddr,
    },
    /// Server accepted the login
    Authenticated {
        server_addr: SocketAddr,
    },
    /// Disconnected from server
    Disconnected {
        reason: String,
    },
    /// Received a message the protocol core does not handle itself
    MessageReceived {
        message: Message,
    },
}

/// NodeLink Client
pub struct Client {
    /// Client configuration
    config: NetworkConfig,
    /// Server to connect to
    server_addr: SocketAddr,
    /// Handshake state of the current connection
    state: Arc<RwLock<HandshakeState>>,
    /// Event sender
    event_tx: mpsc::Sender<ClientEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    /// Connection handle for sending messages
    connection_handle: Arc<RwLock<Option<ConnectionHandle>>>,
}

impl Client {
    /// Create a new client
    pub fn new(config: NetworkConfig, server_addr: SocketAddr) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            server_addr,
            state: Arc::new(RwLock::new(HandshakeState::Closed)),
            event_tx,
            event_rx: Some(event_rx),
            connection_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Keep a session up until `shutdown` resolves
    ///
    /// Each session that ends, cleanly or not, is followed by a new attempt
    /// after the configured reconnect delay.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let policy = self.config.reconnect.clone();

        tokio::select! {
            attempts = policy.run(|_| self.connect_once()) => {
                tracing::warn!("Client stopped after {} connection attempts", attempts);
            }
            _ = shutdown => {
                tracing::info!("Client shutdown requested");
            }
        }

        self.set_state(HandshakeState::Closed).await;
        self.clear_handle().await;
    }

    /// Connect, log in and serve one session until the connection ends
    ///
    /// Returns the reason for a clean close; errors cover connect failures,
    /// login rejection, read timeouts and protocol violations.
    pub async fn connect_once(&self) -> ClientResult<String> {
        {
            let state = self.state.read().await;
            if *state != HandshakeState::Closed {
                return Err(ClientError::AlreadyConnected);
            }
        }

        self.set_state(HandshakeState::Connecting).await;
        tracing::info!("Connecting to {}", self.server_addr);

        let stream = match tokio::time::timeout(self.config.connect_timeout(), self.open_stream()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(HandshakeState::Closed).await;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.set_state(HandshakeState::Closed).await;
                return Err(ClientError::Timeout);
            }
        };

        let mut conn = Connection::new(stream, self.server_addr)
            .with_read_timeout(self.config.read_timeout())
            .with_max_frame_length(self.config.max_frame_length);

        self.emit(ClientEvent::Connected {
            server_addr: self.server_addr,
        });

        let result = self.serve(&mut conn).await;

        // Clean up
        self.clear_handle().await;
        let _ = conn.close().await;

        let reason = match &result {
            Ok(reason) => reason.clone(),
            Err(e) => format!("Error: {}", e),
        };
        self.emit(ClientEvent::Disconnected { reason });

        result.map_err(ClientError::Connection)
    }

    async fn open_stream(&self) -> std::io::Result<TcpStream> {
        let stream = match self.config.local_addr {
            Some(local_addr) => {
                let socket = if local_addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(local_addr)?;
                socket.connect(self.server_addr).await?
            }
            None => TcpStream::connect(self.server_addr).await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Run the login handshake and the heartbeat loop over `conn`
    ///
    /// The handshake ends `Closed` and the heartbeat is cancelled on every exit.
    async fn serve<S>(&self, conn: &mut Connection<S>) -> Result<String, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake = ClientHandshake::new();
        let mut heartbeat = HeartbeatTimer::new(self.config.heartbeat_interval());

        let result = self.exchange(conn, &mut handshake, &mut heartbeat).await;

        heartbeat.cancel();
        handshake.on_closed();
        self.set_state(handshake.state()).await;
        result
    }

    async fn exchange<S>(
        &self,
        conn: &mut Connection<S>,
        handshake: &mut ClientHandshake,
        heartbeat: &mut HeartbeatTimer,
    ) -> Result<String, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
        let handle = ConnectionHandle::new(msg_tx);

        conn.send(&handshake.on_connected()).await?;
        self.set_state(handshake.state()).await;

        loop {
            tokio::select! {
                // Receive messages from the server
                result = conn.recv() => {
                    let message = match result? {
                        Some(message) => message,
                        None => return Ok("Connection closed by server".to_string()),
                    };

                    match handshake.on_message(message)? {
                        ClientStep::Authenticated => {
                            heartbeat.start();
                            self.set_state(handshake.state()).await;
                            *self.connection_handle.write().await = Some(handle.clone());
                            self.emit(ClientEvent::Authenticated {
                                server_addr: conn.remote_addr(),
                            });
                        }
                        ClientStep::Consumed => {}
                        ClientStep::Forward(message) if message.message_type() == MessageType::HeartbeatResp => {
                            tracing::debug!("Client received heartbeat response: {}", message);
                        }
                        ClientStep::Forward(message) => {
                            self.emit(ClientEvent::MessageReceived { message });
                        }
                    }
                }

                // Send heartbeats
                message = heartbeat.tick() => {
                    tracing::debug!("Client sending heartbeat to {}", conn.remote_addr());
                    conn.send(&message).await?;
                }

                // Send messages to the server
                Some(message) = msg_rx.recv() => {
                    conn.send(&message).await?;
                }
            }
        }
    }

    /// Hand an event to the consumer without ever blocking the connection
    fn emit(&self, event: ClientEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Client event queue full, dropping {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn set_state(&self, new_state: HandshakeState) {
        *self.state.write().await = new_state;
    }

    async fn clear_handle(&self) {
        if let Some(handle) = self.connection_handle.write().await.take() {
            handle.mark_disconnected();
        }
    }

    /// Send a message to the server
    pub async fn send(&self, message: Message) -> ClientResult<()> {
        let handle = self.connection_handle.read().await;
        if let Some(h) = &*handle {
            h.send(message).await?;
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Get the handshake state of the current connection
    pub async fn state(&self) -> HandshakeState {
        *self.state.read().await
    }

    /// Check if logged in
    pub async fn is_authenticated(&self) -> bool {
        *self.state.read().await == HandshakeState::Authenticated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ReconnectPolicy;
    use crate::protocol::{MessageCodec, Value, LOGIN_ACCEPTED, LOGIN_REJECTED};
    use crate::session::HandshakeError;
    use bytes::BytesMut;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    fn frame(message: &Message) -> Vec<u8> {
        let mut buf = BytesMut::new();
        MessageCodec::new().encode_message(message, &mut buf).unwrap();
        buf.to_vec()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = Client::new(NetworkConfig::default(), addr());
        assert!(!client.is_authenticated().await);
        assert_eq!(client.state().await, HandshakeState::Closed);
        assert!(matches!(
            client.send(Message::heartbeat_req()).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_rejected_login_closes_session() {
        let mock = Builder::new()
            .write(&frame(&Message::login_req()))
            .read(&frame(&Message::login_resp(LOGIN_REJECTED)))
            .build();
        let mut conn = Connection::new(mock, addr());
        let client = Client::new(NetworkConfig::default(), addr());

        let result = client.serve(&mut conn).await;
        assert!(matches!(
            result,
            Err(ConnectionError::Handshake(HandshakeError::AuthenticationRejected(_)))
        ));
        assert!(!client.is_authenticated().await);
        assert_eq!(client.state().await, HandshakeState::Closed);
    }

    #[tokio::test]
    async fn test_heartbeat_follows_login() {
        let mock = Builder::new()
            .write(&frame(&Message::login_req()))
            .read(&frame(&Message::login_resp(LOGIN_ACCEPTED)))
            .write(&frame(&Message::heartbeat_req()))
            .read(&frame(&Message::heartbeat_resp()))
            .build();
        let mut conn = Connection::new(mock, addr());
        let mut client = Client::new(NetworkConfig::default(), addr());
        let mut events = client.take_event_receiver().unwrap();

        let result = client.serve(&mut conn).await.unwrap();
        assert_eq!(result, "Connection closed by server");
        assert_eq!(client.state().await, HandshakeState::Closed);

        // heartbeat responses are consumed, not forwarded
        assert!(matches!(events.recv().await, Some(ClientEvent::Authenticated { .. })));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_undrained_events_never_stall_the_session() {
        let service = Message::new(MessageType::ServiceResp, Some(Value::Int(1)));
        let mut burst = Vec::new();
        for _ in 0..300 {
            burst.extend(frame(&service));
        }
        burst.extend(frame(&Message::login_resp(LOGIN_ACCEPTED)));

        let mock = Builder::new()
            .write(&frame(&Message::login_req()))
            .read(&burst)
            .write(&frame(&Message::heartbeat_req()))
            .build();
        let mut conn = Connection::new(mock, addr());
        let mut client = Client::new(NetworkConfig::default(), addr());
        let mut events = client.take_event_receiver().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), client.serve(&mut conn))
            .await
            .expect("session stalled on a full event queue");
        assert_eq!(result.unwrap(), "Connection closed by server");

        let mut queued = 0;
        while events.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 256);
    }

    #[tokio::test]
    async fn test_application_messages_are_forwarded() {
        let service = Message::new(MessageType::ServiceResp, Some(Value::from("hello")));
        let mock = Builder::new()
            .write(&frame(&Message::login_req()))
            .read(&frame(&service))
            .build();
        let mut conn = Connection::new(mock, addr());
        let mut client = Client::new(NetworkConfig::default(), addr());
        let mut events = client.take_event_receiver().unwrap();

        client.serve(&mut conn).await.unwrap();

        match events.recv().await {
            Some(ClientEvent::MessageReceived { message }) => assert_eq!(message.body, service.body),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_against_live_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, peer);

            let login = conn.recv().await.unwrap().unwrap();
            assert_eq!(login.message_type(), MessageType::LoginReq);
            conn.send(&Message::login_resp(LOGIN_ACCEPTED)).await.unwrap();

            for _ in 0..3 {
                let beat = conn.recv().await.unwrap().unwrap();
                assert_eq!(beat.message_type(), MessageType::HeartbeatReq);
                conn.send(&Message::heartbeat_resp()).await.unwrap();
            }
        });

        let mut config = NetworkConfig::default();
        config.heartbeat_interval_ms = 50;
        let client = Client::new(config, server_addr);

        let outcome = client.connect_once().await.unwrap();
        assert_eq!(outcome, "Connection closed by server");
        server.await.unwrap();
        assert_eq!(client.state().await, HandshakeState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new(NetworkConfig::default(), server_addr);
        assert!(matches!(client.connect_once().await, Err(ClientError::Io(_))));
        assert_eq!(client.state().await, HandshakeState::Closed);
    }

    #[tokio::test]
    async fn test_run_reconnects_after_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            for _ in 0..3 {
                let (stream, peer) = listener.accept().await.unwrap();
                let mut conn = Connection::new(stream, peer);
                let login = conn.recv().await.unwrap().unwrap();
                assert_eq!(login.message_type(), MessageType::LoginReq);
                conn.send(&Message::login_resp(LOGIN_REJECTED)).await.unwrap();
            }
        });

        let config = NetworkConfig::default()
            .with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(10)).with_max_attempts(3));
        let client = Client::new(config, server_addr);

        client.run(std::future::pending()).await;
        server.await.unwrap();
    }
}
