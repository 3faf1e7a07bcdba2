//! NodeLink Server
//!
//! The server accepts connections, answers login requests against the
//! allow-list and replies to every heartbeat a client sends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};

use super::connection::{Connection, ConnectionError, ConnectionHandle};
use super::NetworkConfig;
use crate::protocol::Message;
use crate::session::{
    heartbeat_reply, AllowList, LoginAuthenticator, ServerHandshake, ServerStep, SessionTable,
};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("Server not running")]
    NotRunning,

    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("No authenticated client at {0}")]
    UnknownClient(SocketAddr),
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new client has connected
    ClientConnected {
        addr: SocketAddr,
    },
    /// A client logged in
    ClientAuthenticated {
        addr: SocketAddr,
    },
    /// A client has disconnected
    ClientDisconnected {
        addr: SocketAddr,
        reason: String,
    },
    /// Received a message the protocol core does not handle itself
    MessageReceived {
        addr: SocketAddr,
        message: Message,
    },
    /// Server started
    Started {
        bind_addr: SocketAddr,
    },
    /// Server stopped
    Stopped,
    /// Error occurred
    Error {
        message: String,
    },
}

/// Information about an authenticated client
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client address
    pub addr: SocketAddr,
    /// When the login was accepted
    pub authenticated_at: Instant,
    /// Handle for sending messages to this client
    pub handle: ConnectionHandle,
}

type ClientMap = Arc<RwLock<HashMap<SocketAddr, ClientInfo>>>;

/// State every connection task needs
#[derive(Clone)]
struct Shared {
    config: NetworkConfig,
    authenticator: LoginAuthenticator,
    clients: ClientMap,
    event_tx: mpsc::Sender<ServerEvent>,
}

/// NodeLink Server
pub struct Server {
    /// Address to listen on; port 0 picks a free port
    bind_addr: SocketAddr,
    /// Address actually bound, once started
    local_addr: Option<SocketAddr>,
    /// Server configuration
    config: NetworkConfig,
    /// Login decisions and the session table
    authenticator: LoginAuthenticator,
    /// Authenticated clients
    clients: ClientMap,
    /// Event sender
    event_tx: mpsc::Sender<ServerEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    /// Shutdown signal, observed by the accept loop and every connection
    shutdown_tx: Option<watch::Sender<bool>>,
    /// Whether the server is running
    running: Arc<RwLock<bool>>,
}

impl Server {
    /// Create a new server with its own session table
    pub fn new(bind_addr: SocketAddr, config: NetworkConfig, allow_list: AllowList) -> Self {
        Self::with_authenticator(
            bind_addr,
            config,
            LoginAuthenticator::new(allow_list, SessionTable::new()),
        )
    }

    /// Create a server around an existing authenticator
    pub fn with_authenticator(
        bind_addr: SocketAddr,
        config: NetworkConfig,
        authenticator: LoginAuthenticator,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            bind_addr,
            local_addr: None,
            config,
            authenticator,
            clients: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Start the server
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        {
            let running = self.running.read().await;
            if *running {
                return Err(ServerError::AlreadyRunning);
            }
        }

        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            ServerError::BindFailed(format!("Failed to bind to {}: {}", self.bind_addr, e))
        })?;

        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        tracing::info!("Server listening on {}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        {
            let mut running = self.running.write().await;
            *running = true;
        }

        emit(&self.event_tx, ServerEvent::Started { bind_addr: local_addr });

        let shared = Shared {
            config: self.config.clone(),
            authenticator: self.authenticator.clone(),
            clients: self.clients.clone(),
            event_tx: self.event_tx.clone(),
        };
        let running = self.running.clone();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => {
                                tracing::info!("New connection from {}", addr);

                                let shared = shared.clone();
                                let shutdown_rx = shutdown_rx.clone();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_client(stream, addr, shared, shutdown_rx).await {
                                        tracing::error!("Client handler error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!("Accept error: {}", e);
                                emit(&shared.event_tx, ServerEvent::Error {
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Server shutdown requested");
                        break;
                    }
                }
            }

            let mut running = running.write().await;
            *running = false;

            emit(&shared.event_tx, ServerEvent::Stopped);
        });

        Ok(local_addr)
    }

    /// Stop the server and close every connection
    pub async fn stop(&mut self) -> ServerResult<()> {
        {
            let running = self.running.read().await;
            if !*running {
                return Err(ServerError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }

        Ok(())
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peers currently holding a session
    pub fn sessions(&self) -> &SessionTable {
        self.authenticator.sessions()
    }

    /// Get a list of authenticated clients
    pub async fn clients(&self) -> Vec<ClientInfo> {
        let clients = self.clients.read().await;
        clients.values().cloned().collect()
    }

    /// Send a message to a specific client
    pub async fn send_to(&self, addr: &SocketAddr, message: Message) -> ServerResult<()> {
        let clients = self.clients.read().await;
        if let Some(client) = clients.get(addr) {
            client.handle.send(message).await?;
            Ok(())
        } else {
            Err(ServerError::UnknownClient(*addr))
        }
    }

    /// Send a message to all authenticated clients
    pub async fn broadcast(&self, message: Message) {
        let clients = self.clients.read().await;
        for (_, client) in clients.iter() {
            let _ = client.handle.send(message.clone()).await;
        }
    }

    /// Check if the server is running
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Hand an event to the consumer without ever blocking the caller
///
/// A full queue drops the event; a dropped receiver means nobody listens.
fn emit(event_tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) {
    match event_tx.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            tracing::warn!("Server event queue full, dropping {:?}", event);
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Handle a client connection
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Shared,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let mut conn = Connection::new(stream, addr)
        .with_read_timeout(shared.config.read_timeout())
        .with_max_frame_length(shared.config.max_frame_length);
    let mut handshake = ServerHandshake::new(addr, shared.authenticator.clone());

    emit(&shared.event_tx, ServerEvent::ClientConnected { addr });

    let disconnect_reason = match serve(&mut conn, &mut handshake, &shared, &mut shutdown_rx).await {
        Ok(reason) => reason,
        Err(e) => format!("Error: {}", e),
    };
    tracing::info!("Connection from {} ended: {}", addr, disconnect_reason);

    // Clean up
    handshake.on_closed();

    if let Some(client) = shared.clients.write().await.remove(&addr) {
        client.handle.mark_disconnected();
    }

    emit(&shared.event_tx, ServerEvent::ClientDisconnected {
        addr,
        reason: disconnect_reason,
    });

    let _ = conn.close().await;

    Ok(())
}

/// Main message loop for one connection; returns the disconnect reason
async fn serve<S>(
    conn: &mut Connection<S>,
    handshake: &mut ServerHandshake,
    shared: &Shared,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<String, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let addr = conn.remote_addr();

    // Create message channel for this client
    let (msg_tx, mut msg_rx) = mpsc::channel::<Message>(256);
    let handle = ConnectionHandle::new(msg_tx);

    loop {
        tokio::select! {
            // Receive messages from the client
            result = conn.recv() => {
                let message = match result? {
                    Some(message) => message,
                    None => return Ok("Connection closed".to_string()),
                };

                match handshake.on_message(message) {
                    ServerStep::LoginAccepted(reply) => {
                        shared.clients.write().await.insert(addr, ClientInfo {
                            addr,
                            authenticated_at: Instant::now(),
                            handle: handle.clone(),
                        });
                        conn.send(&reply).await?;
                        emit(&shared.event_tx, ServerEvent::ClientAuthenticated { addr });
                    }
                    ServerStep::LoginRejected(reply, _) => {
                        conn.send(&reply).await?;
                    }
                    ServerStep::Forward(message) => match heartbeat_reply(&message) {
                        Some(reply) => {
                            tracing::debug!("Receive client heartbeat message: {}", message);
                            conn.send(&reply).await?;
                        }
                        None => {
                            // Forward message to event handler
                            emit(&shared.event_tx, ServerEvent::MessageReceived {
                                addr,
                                message,
                            });
                        }
                    },
                }
            }

            // Send messages to the client
            Some(message) = msg_rx.recv() => {
                conn.send(&message).await?;
            }

            _ = shutdown_rx.changed() => {
                return Ok("Server shutting down".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Client, ClientEvent};
    use crate::protocol::{MessageType, Value, LOGIN_ACCEPTED, LOGIN_REJECTED};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn any_port() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn start_server(allow_list: AllowList) -> (Server, mpsc::Receiver<ServerEvent>) {
        let mut server = Server::new(any_port(), NetworkConfig::default(), allow_list);
        let events = server.take_event_receiver().unwrap();
        server.start().await.unwrap();
        (server, events)
    }

    async fn dial(server: &Server) -> Connection {
        let stream = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let server_addr = stream.peer_addr().unwrap();
        Connection::new(stream, server_addr)
    }

    /// Address of the one client the server has authenticated
    async fn only_client_addr(server: &Server) -> SocketAddr {
        let clients = server.clients().await;
        assert_eq!(clients.len(), 1);
        clients[0].addr
    }

    async fn login(conn: &mut Connection) -> Option<i8> {
        conn.send(&Message::login_req()).await.unwrap();
        conn.recv().await.unwrap().unwrap().login_result()
    }

    async fn wait_for_disconnect(events: &mut mpsc::Receiver<ServerEvent>) -> SocketAddr {
        let wait = async {
            loop {
                if let Some(ServerEvent::ClientDisconnected { addr, .. }) = events.recv().await {
                    return addr;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = Server::new(any_port(), NetworkConfig::default(), AllowList::default());
        assert!(!server.is_running().await);
        assert!(server.local_addr().is_none());
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_allowed_peer_logs_in_and_gets_heartbeats() {
        let (server, mut events) = start_server(AllowList::new(["127.0.0.1"])).await;
        assert!(server.is_running().await);
        assert_ne!(server.local_addr().unwrap().port(), 0);

        let mut conn = dial(&server).await;
        assert_eq!(login(&mut conn).await, Some(LOGIN_ACCEPTED));
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.clients().await.len(), 1);

        let local = only_client_addr(&server).await;
        let registered = server.sessions().registered_at(&local);
        assert!(registered.is_some());

        conn.send(&Message::heartbeat_req().with_session_id(7)).await.unwrap();
        let reply = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::HeartbeatResp);
        assert_eq!(reply.header.session_id, 7);

        // the echo leaves server state alone
        assert_eq!(server.sessions().len(), 1);
        assert_eq!(server.sessions().registered_at(&local), registered);
        assert_eq!(server.clients().await.len(), 1);

        drop(conn);
        wait_for_disconnect(&mut events).await;
        assert!(server.sessions().is_empty());
        assert!(server.clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_unlisted_peer_is_rejected_but_stays_connected() {
        let (server, _events) = start_server(AllowList::new(["192.168.1.104"])).await;

        let mut conn = dial(&server).await;
        assert_eq!(login(&mut conn).await, Some(LOGIN_REJECTED));
        assert!(server.sessions().is_empty());

        conn.send(&Message::heartbeat_req()).await.unwrap();
        let reply = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::HeartbeatResp);
        assert!(server.sessions().is_empty());
        assert!(server.clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_before_login_registers_nothing() {
        let (server, _events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut conn = dial(&server).await;
        conn.send(&Message::heartbeat_req()).await.unwrap();
        let reply = conn.recv().await.unwrap().unwrap();
        assert_eq!(reply.message_type(), MessageType::HeartbeatResp);
        assert!(server.sessions().is_empty());
        assert!(server.clients().await.is_empty());
    }

    #[tokio::test]
    async fn test_unread_events_never_stall_connections() {
        // the event receiver stays inside the server and is never drained
        let mut server = Server::new(
            any_port(),
            NetworkConfig::default(),
            AllowList::new(["192.168.1.104"]),
        );
        server.start().await.unwrap();

        let mut flooder = dial(&server).await;
        let push = Message::new(MessageType::OneWay, Some(Value::Int(1)));
        for _ in 0..300 {
            flooder.send(&push).await.unwrap();
        }
        flooder.send(&Message::heartbeat_req()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), flooder.recv())
            .await
            .expect("heartbeat reply stalled behind the event queue")
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), MessageType::HeartbeatResp);

        let mut second = dial(&server).await;
        second.send(&Message::heartbeat_req()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), second.recv())
            .await
            .expect("new connection stalled behind the event queue")
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_type(), MessageType::HeartbeatResp);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let (server, _events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut first = dial(&server).await;
        let mut second = dial(&server).await;
        assert_eq!(login(&mut first).await, Some(LOGIN_ACCEPTED));
        assert_eq!(login(&mut second).await, Some(LOGIN_ACCEPTED));
        assert_eq!(server.clients().await.len(), 2);

        server
            .broadcast(Message::new(MessageType::OneWay, Some(Value::from("all"))))
            .await;

        for conn in [&mut first, &mut second] {
            let received = tokio::time::timeout(Duration::from_secs(5), conn.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(received.message_type(), MessageType::OneWay);
            assert_eq!(received.body, Some(Value::from("all")));
        }
    }

    #[tokio::test]
    async fn test_repeated_login_is_rejected() {
        let (server, _events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut conn = dial(&server).await;
        assert_eq!(login(&mut conn).await, Some(LOGIN_ACCEPTED));
        assert_eq!(login(&mut conn).await, Some(LOGIN_REJECTED));
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_application_messages_reach_events() {
        let (server, mut events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut conn = dial(&server).await;
        let request = Message::new(MessageType::ServiceReq, Some(Value::Int(42)));
        conn.send(&request).await.unwrap();

        let wait = async {
            loop {
                if let Some(ServerEvent::MessageReceived { message, .. }) = events.recv().await {
                    return message;
                }
            }
        };
        let received = tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
        assert_eq!(received.body, Some(Value::Int(42)));
    }

    #[tokio::test]
    async fn test_send_to_authenticated_client() {
        let (server, mut events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut conn = dial(&server).await;
        assert_eq!(login(&mut conn).await, Some(LOGIN_ACCEPTED));

        let wait = async {
            loop {
                if let Some(ServerEvent::ClientAuthenticated { addr }) = events.recv().await {
                    return addr;
                }
            }
        };
        let addr = tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();

        let push = Message::new(MessageType::OneWay, Some(Value::from("update")));
        server.send_to(&addr, push).await.unwrap();
        let received = conn.recv().await.unwrap().unwrap();
        assert_eq!(received.message_type(), MessageType::OneWay);

        let stranger: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            server.send_to(&stranger, Message::heartbeat_req()).await,
            Err(ServerError::UnknownClient(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let (mut server, _events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut conn = dial(&server).await;
        assert_eq!(login(&mut conn).await, Some(LOGIN_ACCEPTED));

        server.stop().await.unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), conn.recv()).await.unwrap();
        assert!(matches!(closed, Ok(None)));
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_client_and_server_together() {
        let (server, mut server_events) = start_server(AllowList::new(["127.0.0.1"])).await;

        let mut config = NetworkConfig::default();
        config.heartbeat_interval_ms = 50;
        let mut client = Client::new(config, server.local_addr().unwrap());
        let mut client_events = client.take_event_receiver().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = client.run(async {
            let _ = stop_rx.await;
        });

        let check = async {
            let wait = async {
                loop {
                    if let Some(ClientEvent::Authenticated { .. }) = client_events.recv().await {
                        return;
                    }
                }
            };
            tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap();
            assert!(client.is_authenticated().await);
            assert_eq!(server.sessions().len(), 1);

            // a few heartbeat rounds keep the session alive
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(server.sessions().len(), 1);

            let _ = stop_tx.send(());
        };

        tokio::join!(run, check);

        wait_for_disconnect(&mut server_events).await;
        assert!(server.sessions().is_empty());
    }
}
