//! WebSocket server implementation
//!
//! Listens on a configurable address, upgrades every accepted stream and
//! keeps the resulting connections in a shared [`Registry`] until they close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Handler, Registry};
use crate::config::ServerConfig;
use crate::conn::{BoxedReader, Connection, ConnectionError, ConnectionHook, MessageCallback};
use crate::protocol::{accept_upgrade, HandshakeError, Opcode, Role};

/// Pause after a listener error before accepting again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that can occur while accepting connections
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Connection from {0} rejected by accept filter")]
    Rejected(SocketAddr),

    #[error("Server is closed")]
    Closed,
}

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Predicate consulted for every accepted stream before the handshake
pub type AcceptFilter = Arc<dyn Fn(&TcpStream, SocketAddr) -> bool + Send + Sync>;

/// WebSocket server tracking every established connection
pub struct Server {
    config: ServerConfig,
    local_addr: SocketAddr,
    /// Taken and dropped on close
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<Registry>,
    /// Default handler installed on every new connection
    handler: Option<Arc<dyn Handler>>,
    on_open: Option<ConnectionHook>,
    on_close: Option<ConnectionHook>,
    accept_filter: Option<AcceptFilter>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Bind a listener for `config`
    pub async fn listen(config: ServerConfig) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);
        debug!("Bound listener on {}", local_addr);

        Ok(Self {
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry: Arc::new(Registry::new()),
            handler: None,
            on_open: None,
            on_close: None,
            accept_filter: None,
            shutdown_tx,
        })
    }

    /// Bind a listener for `config` and serve until closed
    pub async fn listen_and_serve(
        config: ServerConfig,
        callback: Option<MessageCallback>,
    ) -> ServerResult<()> {
        let server = Arc::new(Self::listen(config).await?);
        server.serve(callback).await
    }

    /// Set the handler every new connection starts with
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the callback run after a connection is registered
    pub fn on_open(mut self, hook: ConnectionHook) -> Self {
        self.on_open = Some(hook);
        self
    }

    /// Set the callback run when a connection starts closing
    pub fn on_close(mut self, hook: ConnectionHook) -> Self {
        self.on_close = Some(hook);
        self
    }

    /// Set a predicate that can refuse streams before the handshake
    pub fn with_accept_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TcpStream, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept_filter = Some(Arc::new(filter));
        self
    }

    /// Get the bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the connection registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Number of registered connections
    pub async fn client_count(&self) -> usize {
        self.registry.len().await
    }

    /// Snapshot of the registered connections
    pub async fn clients(&self) -> Vec<Arc<Connection>> {
        self.registry.snapshot().await
    }

    /// Look up a registered connection
    pub async fn get(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.registry.get(id).await
    }

    /// Returns true once close has started
    pub fn is_closed(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Accept one stream and establish a connection on it.
    ///
    /// Runs the accept filter, the handshake, registration and the open
    /// callback in order. A failure affects only this attempt.
    pub async fn accept(&self) -> ServerResult<Arc<Connection>> {
        let (stream, peer_addr) = self.accept_stream().await?;
        self.establish(stream, peer_addr).await
    }

    /// Accept streams until the server is closed, running each connection's
    /// read loop on its own task.
    ///
    /// The handshake happens on the per-connection task, so a slow client
    /// never holds up the accept loop. Failed attempts are logged and
    /// skipped.
    pub async fn serve(self: &Arc<Self>, callback: Option<MessageCallback>) -> ServerResult<()> {
        info!("WebSocket server listening on ws://{}", self.local_addr);

        loop {
            match self.accept_stream().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(self);
                    let callback = callback.clone();

                    tokio::spawn(async move {
                        match server.establish(stream, peer_addr).await {
                            Ok(conn) => conn.handle(callback).await,
                            Err(ServerError::Rejected(addr)) => {
                                debug!("Dropped connection from {} by accept filter", addr);
                            }
                            Err(e) => warn!("Connection error from {}: {}", peer_addr, e),
                        }
                    });
                }
                Err(ServerError::Closed) => {
                    info!("Server on {} stopped accepting", self.local_addr);
                    return Ok(());
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    /// Send `message` as a Binary frame to every registered connection;
    /// see [`Server::broadcast`]
    pub async fn write(&self, message: &[u8]) -> usize {
        self.broadcast(Opcode::Binary, message).await
    }

    /// Send `message` as a Text frame to every registered connection
    pub async fn write_text(&self, message: &str) -> usize {
        self.broadcast(Opcode::Text, message.as_bytes()).await
    }

    /// Send one frame to every registered connection, each on its own task.
    ///
    /// A connection whose write fails is closed; the others are unaffected.
    /// Returns the number of recipients.
    pub async fn broadcast(&self, opcode: Opcode, message: &[u8]) -> usize {
        let payload: Arc<[u8]> = Arc::from(message);
        let clients = self.registry.snapshot().await;

        for conn in &clients {
            let conn = Arc::clone(conn);
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                match conn.write_frame(opcode, &payload).await {
                    Ok(()) => {}
                    Err(ConnectionError::Closed) => {
                        debug!("Skipped broadcast to closed connection {}", conn.id());
                    }
                    Err(e) => {
                        warn!("Error broadcasting to connection {}: {}", conn.id(), e);
                        let _ = conn.close().await;
                    }
                }
            });
        }

        clients.len()
    }

    /// Close every registered connection, then the listener.
    ///
    /// A running [`Server::serve`] returns once the listener is gone.
    /// Calling close again is a no-op.
    pub async fn close(&self) -> ServerResult<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }

        let clients = self.registry.snapshot().await;
        info!(
            "Closing server on {} with {} connected clients",
            self.local_addr,
            clients.len()
        );

        for result in join_all(clients.iter().map(|conn| conn.close())).await {
            if let Err(e) = result {
                debug!("Error closing connection during shutdown: {}", e);
            }
        }

        // The accept loop releases the lock as soon as shutdown is signalled
        drop(self.listener.lock().await.take());
        Ok(())
    }

    async fn accept_stream(&self) -> ServerResult<(TcpStream, SocketAddr)> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(ServerError::Closed);
        }

        let listener = self.listener.lock().await;
        let listener = listener.as_ref().ok_or(ServerError::Closed)?;

        tokio::select! {
            result = listener.accept() => Ok(result?),
            _ = shutdown_rx.changed() => Err(ServerError::Closed),
        }
    }

    async fn establish(&self, stream: TcpStream, peer_addr: SocketAddr) -> ServerResult<Arc<Connection>> {
        if let Some(filter) = &self.accept_filter {
            if !filter(&stream, peer_addr) {
                return Err(ServerError::Rejected(peer_addr));
            }
        }

        let local_addr = stream.local_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }
        let (read_half, mut write_half) = stream.into_split();
        let reader: BoxedReader = Box::new(read_half);
        let mut reader = BufReader::new(reader);

        let negotiated = tokio::time::timeout(
            self.config.handshake_timeout(),
            accept_upgrade(&mut reader, &mut write_half, &self.config.protocols),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;

        let conn = Arc::new(
            Connection::new(
                reader,
                Box::new(write_half),
                Role::Server,
                self.config.connection_config(),
            )
            .with_peer_addr(Some(peer_addr))
            .with_local_addr(local_addr)
            .with_protocol(negotiated.protocol)
            .with_registry(Arc::downgrade(&self.registry))
            .with_handler(self.handler.clone())
            .with_on_close(self.on_close.clone()),
        );

        let count = self.registry.insert(Arc::clone(&conn)).await;
        info!(
            "Client {} connected from {}, number of clients is now {}",
            conn.id(),
            peer_addr,
            count
        );

        // Close may have snapshotted the registry just before this insert
        if self.is_closed() {
            let _ = conn.close().await;
            return Err(ServerError::Closed);
        }

        if let Some(on_open) = &self.on_open {
            on_open(Arc::clone(&conn)).await;
        }

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{connection_hook, dial, dial_protocol, message_callback, Incoming};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn local_server() -> Server {
        Server::listen(ServerConfig::new("127.0.0.1", 0)).await.unwrap()
    }

    async fn wait_for_count(server: &Server, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.client_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client count never settled");
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let server = local_server().await;
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.client_count().await, 0);
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_accept_registers_and_opens() {
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let server = local_server().await.on_open(connection_hook(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let addr = server.local_addr().to_string();

        let (accepted, dialed) = tokio::join!(server.accept(), dial(&addr));
        let accepted = accepted.unwrap();
        let dialed = dialed.unwrap();

        assert!(!accepted.is_client());
        assert!(dialed.is_client());
        assert_eq!(accepted.local_addr(), Some(server.local_addr()));
        assert_eq!(dialed.peer_addr(), Some(server.local_addr()));
        assert_eq!(accepted.peer_addr(), dialed.local_addr());
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(server.client_count().await, 1);
        assert_eq!(server.get(accepted.id()).await.map(|c| c.id()), Some(accepted.id()));

        dialed.write_message(b"hi").await.unwrap();
        assert_eq!(
            accepted.read_message().await.unwrap(),
            Incoming::Message(b"hi".to_vec())
        );

        accepted.close().await.unwrap();
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_accept_filter_rejects() {
        let server = local_server()
            .await
            .with_accept_filter(|_stream: &TcpStream, _addr: SocketAddr| false);
        let addr = server.local_addr().to_string();

        let (accepted, dialed) = tokio::join!(server.accept(), dial(&addr));
        assert!(matches!(accepted, Err(ServerError::Rejected(_))));
        assert!(dialed.is_err());
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_malformed_upgrade_gets_bad_request() {
        let server = local_server().await;
        let addr = server.local_addr();

        let client = async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            String::from_utf8(response).unwrap()
        };

        let (accepted, response) = tokio::join!(server.accept(), client);
        assert!(matches!(accepted, Err(ServerError::Handshake(_))));
        assert!(response.starts_with("HTTP/1.1 400"));
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let config = ServerConfig::new("127.0.0.1", 0).with_handshake_timeout(Duration::from_millis(100));
        let server = Server::listen(config).await.unwrap();
        let _idle = TcpStream::connect(server.local_addr()).await.unwrap();

        assert!(matches!(
            server.accept().await,
            Err(ServerError::Handshake(HandshakeError::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_subprotocol_negotiation() {
        let config = ServerConfig::new("127.0.0.1", 0).with_protocols(["chat", "superchat"]);
        let server = Server::listen(config).await.unwrap();
        let addr = server.local_addr().to_string();

        let (accepted, dialed) = tokio::join!(server.accept(), dial_protocol(&addr, "superchat"));
        assert_eq!(accepted.unwrap().protocol(), Some("superchat"));
        assert_eq!(dialed.unwrap().protocol(), Some("superchat"));

        let (accepted, dialed) = tokio::join!(server.accept(), dial_protocol(&addr, "other"));
        assert_eq!(accepted.unwrap().protocol(), None);
        assert_eq!(dialed.unwrap().protocol(), None);
    }

    #[tokio::test]
    async fn test_serve_dispatches_and_deregisters() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let server = Arc::new(local_server().await.on_close(connection_hook(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })));
        let addr = server.local_addr().to_string();

        let echo = message_callback(|conn, message| async move {
            let _ = conn.write_message(&message).await;
        });
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(Some(echo)).await }
        });

        let client = dial(&addr).await.unwrap();
        wait_for_count(&server, 1).await;

        client.write_message(b"echo me").await.unwrap();
        assert_eq!(
            client.read_message().await.unwrap(),
            Incoming::Message(b"echo me".to_vec())
        );

        client.close().await.unwrap();
        wait_for_count(&server, 0).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        server.close().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let server = Arc::new(local_server().await);
        let addr = server.local_addr().to_string();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(None).await }
        });

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(dial(&addr).await.unwrap());
        }
        wait_for_count(&server, 3).await;

        assert_eq!(server.write_text("announcement").await, 3);
        for client in &clients {
            assert_eq!(
                client.read_message().await.unwrap(),
                Incoming::Message(b"announcement".to_vec())
            );
        }

        server.close().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_closes_clients_and_listener() {
        let server = Arc::new(local_server().await);
        let addr = server.local_addr().to_string();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.serve(None).await }
        });

        let client = dial(&addr).await.unwrap();
        wait_for_count(&server, 1).await;

        server.close().await.unwrap();
        assert!(server.is_closed());
        assert_eq!(server.client_count().await, 0);
        serving.await.unwrap().unwrap();

        // The client sees the server's Close frame
        assert_eq!(client.read_message().await.unwrap(), Incoming::Closed);

        assert!(matches!(server.accept().await, Err(ServerError::Closed)));
        server.close().await.unwrap();
    }
}
