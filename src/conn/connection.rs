//! An established WebSocket connection
//!
//! Wraps one byte stream and its role, and exposes message-level reads and
//! writes on top of the frame codec. Reads are serialized by a reader lock
//! and writes by a writer lock, so one frame is always fully consumed or
//! emitted before the next begins.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::protocol::{self, FrameError, FrameHeader, Opcode, Role};
use crate::server::{Handler, Registry};

/// How long `close` waits to hand the Close frame to the stream
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Read half of the underlying stream
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of the underlying stream
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callback invoked with every application message nobody else consumed
pub type MessageCallback =
    Arc<dyn Fn(Arc<Connection>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked on connection lifecycle events
pub type ConnectionHook = Arc<dyn Fn(Arc<Connection>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageCallback`]
pub fn message_callback<F, Fut>(f: F) -> MessageCallback
where
    F: Fn(Arc<Connection>, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn, message| Box::pin(f(conn, message)))
}

/// Wrap an async closure as a [`ConnectionHook`]
pub fn connection_hook<F, Fut>(f: F) -> ConnectionHook
where
    F: Fn(Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |conn| Box::pin(f(conn)))
}

/// Errors that can occur on an established connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(FrameError),

    #[error("Connection closed")]
    Closed,
}

impl From<FrameError> for ConnectionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => Self::Transport(e),
            other => Self::Protocol(other),
        }
    }
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result of reading one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// An application message
    Message(Vec<u8>),
    /// A control frame was handled; keep reading
    Control,
    /// The peer sent Close and the connection has been torn down
    Closed,
}

/// One established WebSocket session
pub struct Connection {
    /// Unique identifier
    id: Uuid,
    /// Client connections mask outgoing frames, server connections don't
    role: Role,
    /// Remote address, when the stream has one
    peer_addr: Option<SocketAddr>,
    /// Local address, when the stream has one
    local_addr: Option<SocketAddr>,
    /// Subprotocol agreed during the handshake
    protocol: Option<String>,
    config: ConnectionConfig,
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    /// Gets first refusal on every incoming message
    handler: RwLock<Option<Arc<dyn Handler>>>,
    on_close: RwLock<Option<ConnectionHook>>,
    /// Owning server's registry (server-role connections only)
    registry: Option<Weak<Registry>>,
    closed: AtomicBool,
    /// Set while a frame is being written; left set if that write was
    /// abandoned, meaning the stream holds a partial frame
    write_in_progress: AtomicBool,
    /// Flips to true when close starts, waking the read loop and any
    /// pending write
    shutdown_tx: watch::Sender<bool>,
    /// Flips to true once teardown has finished
    teardown_tx: watch::Sender<bool>,
}

impl Connection {
    /// Build a connection from an already split stream
    pub(crate) fn new(
        reader: BufReader<BoxedReader>,
        writer: BoxedWriter,
        role: Role,
        config: ConnectionConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (teardown_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            role,
            peer_addr: None,
            local_addr: None,
            protocol: None,
            config,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            handler: RwLock::new(None),
            on_close: RwLock::new(None),
            registry: None,
            closed: AtomicBool::new(false),
            write_in_progress: AtomicBool::new(false),
            shutdown_tx,
            teardown_tx,
        }
    }

    /// Wrap a stream that has already completed the upgrade handshake
    pub fn from_stream<S>(stream: S, role: Role, config: ConnectionConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(read_half);
        Arc::new(Self::new(BufReader::new(reader), Box::new(write_half), role, config))
    }

    pub(crate) fn with_peer_addr(mut self, peer_addr: Option<SocketAddr>) -> Self {
        self.peer_addr = peer_addr;
        self
    }

    pub(crate) fn with_local_addr(mut self, local_addr: Option<SocketAddr>) -> Self {
        self.local_addr = local_addr;
        self
    }

    pub(crate) fn with_protocol(mut self, protocol: Option<String>) -> Self {
        self.protocol = protocol;
        self
    }

    pub(crate) fn with_registry(mut self, registry: Weak<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn with_handler(self, handler: Option<Arc<dyn Handler>>) -> Self {
        Self {
            handler: RwLock::new(handler),
            ..self
        }
    }

    pub(crate) fn with_on_close(self, on_close: Option<ConnectionHook>) -> Self {
        Self {
            on_close: RwLock::new(on_close),
            ..self
        }
    }

    /// Get the connection ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the connection role
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns true if this is the dialing side of the connection
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// Get the remote address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Get the local address of the underlying stream
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the negotiated subprotocol
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Returns true once close has started
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Replace the message handler
    pub async fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Replace the close callback
    pub async fn set_on_close(&self, hook: ConnectionHook) {
        *self.on_close.write().await = Some(hook);
    }

    /// Read one frame and interpret it.
    ///
    /// Data frames come back as [`Incoming::Message`]. A Close frame tears
    /// the connection down and yields [`Incoming::Closed`]. Ping, Pong and
    /// reserved opcodes are consumed and yield [`Incoming::Control`]; a Ping
    /// is answered with a Pong when `auto_pong` is enabled.
    pub async fn read_message(self: &Arc<Self>) -> ConnectionResult<Incoming> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut reader = self.reader.lock().await;
        let header = FrameHeader::read_from(&mut *reader).await?;
        debug!(
            "Connection {} frame {:?} ({} bytes, masked: {})",
            self.id,
            header.opcode,
            header.payload_len,
            header.masked()
        );

        if header.payload_len > self.config.max_message_size {
            return Err(ConnectionError::Protocol(FrameError::PayloadTooLarge {
                size: header.payload_len,
                max: self.config.max_message_size,
            }));
        }

        match header.opcode {
            op if op.is_data() => {
                let payload = protocol::read_payload(&mut *reader, &header).await?;
                Ok(Incoming::Message(payload))
            }
            Opcode::Close => {
                protocol::decode_payload(&mut *reader, &header, &mut tokio::io::sink()).await?;
                drop(reader);
                debug!("Connection {} received close frame", self.id);
                if let Err(e) = self.close().await {
                    debug!("Connection {} close after peer close: {}", self.id, e);
                }
                Ok(Incoming::Closed)
            }
            Opcode::Ping => {
                let payload = protocol::read_payload(&mut *reader, &header).await?;
                drop(reader);
                if self.config.auto_pong {
                    self.write_frame(Opcode::Pong, &payload).await?;
                }
                Ok(Incoming::Control)
            }
            _ => {
                protocol::decode_payload(&mut *reader, &header, &mut tokio::io::sink()).await?;
                Ok(Incoming::Control)
            }
        }
    }

    /// Send `message` as one Binary frame
    pub async fn write_message(&self, message: &[u8]) -> ConnectionResult<()> {
        self.write_frame(Opcode::Binary, message).await
    }

    /// Send `message` as one Text frame
    pub async fn write_text(&self, message: &str) -> ConnectionResult<()> {
        self.write_frame(Opcode::Text, message.as_bytes()).await
    }

    /// Encode and send one frame using this connection's role.
    ///
    /// A write still pending when close starts is abandoned and fails with
    /// [`ConnectionError::Closed`].
    pub(crate) async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> ConnectionResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let bytes = protocol::encode(opcode, payload, self.role);

        let write = async {
            match self.config.write_timeout {
                Some(limit) => tokio::time::timeout(limit, self.write_bytes(&bytes))
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "frame write timed out")
                    })?,
                None => self.write_bytes(&bytes).await,
            }
        };

        tokio::select! {
            result = write => Ok(result?),
            _ = shutdown_rx.wait_for(|closing| *closing) => Err(ConnectionError::Closed),
        }
    }

    /// Write one encoded frame under the writer lock
    async fn write_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        if self.write_in_progress.load(Ordering::Acquire) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream holds a partial frame from an interrupted write",
            ));
        }

        self.write_in_progress.store(true, Ordering::Release);
        writer.write_all(bytes).await?;
        writer.flush().await?;
        self.write_in_progress.store(false, Ordering::Release);
        Ok(())
    }

    /// Close the connection.
    ///
    /// Runs at most once no matter how many callers race here: invokes the
    /// close callback, sends a Close frame (best effort), leaves the owning
    /// server's registry and shuts the stream down. Every caller returns
    /// only after that sequence has finished. A read loop or write blocked
    /// on this connection wakes up and gives up.
    ///
    /// The close callback must not itself wait on `close` of the same
    /// connection.
    pub async fn close(self: &Arc<Self>) -> ConnectionResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            let mut teardown_rx = self.teardown_tx.subscribe();
            let _ = teardown_rx.wait_for(|done| *done).await;
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);

        // Teardown runs on its own task so it completes even if the caller
        // (e.g. a read loop racing the shutdown signal) is dropped.
        let conn = Arc::clone(self);
        let teardown = tokio::spawn(async move {
            let result = conn.clone().teardown().await;
            conn.teardown_tx.send_replace(true);
            result
        });
        match teardown.await {
            Ok(result) => result,
            Err(e) => Err(ConnectionError::Transport(std::io::Error::other(e))),
        }
    }

    async fn teardown(self: Arc<Self>) -> ConnectionResult<()> {
        let hook = self.on_close.read().await.clone();
        if let Some(hook) = hook {
            hook(Arc::clone(&self)).await;
        }

        let close_frame = protocol::encode(Opcode::Close, &[], self.role);
        match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, self.write_bytes(&close_frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Connection {} could not send close frame: {}", self.id, e),
            Err(_) => debug!("Connection {} timed out sending close frame", self.id),
        }

        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            let remaining = registry.remove(self.id).await;
            info!(
                "Client {} disconnected, number of clients is now {}",
                self.id, remaining
            );
        } else {
            info!("Connection {} closed", self.id);
        }

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.shutdown().await
        };
        match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, shutdown).await {
            Ok(result) => result?,
            Err(_) => warn!("Connection {} writer still busy, dropping without shutdown", self.id),
        }
        Ok(())
    }

    /// Read messages until the connection ends.
    ///
    /// Each message is first offered to the connection's handler; if the
    /// handler does not consume it, `fallback` runs. The loop exits on a
    /// Close frame, on the first read error, or when `close` is called from
    /// elsewhere, and always finishes by closing the connection.
    pub async fn handle(self: Arc<Self>, fallback: Option<MessageCallback>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if self.is_closed() {
                break;
            }

            let result = tokio::select! {
                result = self.read_message() => result,
                _ = shutdown_rx.changed() => break,
            };

            match result {
                Ok(Incoming::Message(message)) => self.dispatch(message, fallback.as_ref()).await,
                Ok(Incoming::Control) => continue,
                Ok(Incoming::Closed) => break,
                Err(ConnectionError::Transport(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    info!("Connection {} closed by peer", self.id);
                    break;
                }
                Err(ConnectionError::Closed) => break,
                Err(e) => {
                    warn!("Error reading from connection {}: {}", self.id, e);
                    break;
                }
            }
        }

        if let Err(e) = self.close().await {
            debug!("Connection {} close: {}", self.id, e);
        }
    }

    async fn dispatch(self: &Arc<Self>, message: Vec<u8>, fallback: Option<&MessageCallback>) {
        let handler = self.handler.read().await.clone();
        if let Some(handler) = handler {
            if handler.handle(self, &message).await {
                return;
            }
        }

        if let Some(fallback) = fallback {
            fallback(Arc::clone(self), message).await;
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("protocol", &self.protocol)
            .field("closed", &self.is_closed())
            .finish()
    }
}
