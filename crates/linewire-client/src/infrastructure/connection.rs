//! TCP connection with a background receive task and listener dispatch.
//!
//! Architecture:
//! - [`Connection`] owns the socket lifecycle.  `connect` splits the
//!   `TcpStream`; the read half moves into a spawned receive task, the write
//!   half is shared with every [`ConnectionSender`].
//! - The receive task reads into a fixed buffer, feeds a [`LineFramer`],
//!   decodes each complete line with the connection's [`Decoder`], and
//!   dispatches the result through the [`ListenerSet`].
//! - `disconnect` fires a `oneshot` shutdown signal that the task observes
//!   through `tokio::select!`, so a task parked in `read()` stops promptly.
//!
//! # Lifecycle
//!
//! ```text
//!            connect() ok                     disconnect()
//!   idle ─────────────────────► live ─────────────────────────► idle
//!                                 │
//!                                 └── peer closed / read error ─► idle
//! ```
//!
//! There is no reconnect policy: once idle, the connection stays idle until
//! `connect` is called again.  Dropping a live `Connection` drops the shutdown
//! sender, which also stops the receive task.
//!
//! # Delivery guarantees
//!
//! Lines are dispatched in arrival order.  Every listener registered when a
//! line is dispatched sees it before the next line is dispatched.  A listener
//! that blocks stalls delivery for the whole connection.

use std::borrow::Cow;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{oneshot, Mutex, Notify},
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, trace, warn};

use linewire_core::{
    dispatch::{ListenerSet, SharedListener},
    protocol::{
        decode::{Decoder, RawDecoder},
        framing::{terminate_line, LineFramer},
    },
};

use crate::domain::config::ConnectionConfig;

/// Errors that can occur in the connection layer.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Resolving or connecting to the remote endpoint failed.
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// The TCP handshake did not complete within the timeout.
    #[error("timed out after {timeout:?} connecting to {addr}")]
    ConnectTimeout { addr: String, timeout: Duration },
    /// A send was attempted while the connection is not alive, or the
    /// connection closed before a pending send finished.
    #[error("not connected")]
    NotConnected,
    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] io::Error),
}

/// State shared by the connection, its receive task, and all senders.
#[derive(Debug, Default)]
struct Shared {
    alive: AtomicBool,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Wakes sends that are waiting on the writer or on a full socket, so
    /// they release the writer lock before `close` takes it.
    closing: Notify,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Marks the connection dead and closes the write half, if still present.
    ///
    /// Pending sends are cancelled first, so a peer that stopped reading
    /// cannot hold `close` up.
    async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.closing.notify_waiters();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of write half failed: {e}");
            }
        }
    }
}

/// Bookkeeping for one live socket.
struct Session {
    peer: SocketAddr,
    local: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Cloneable handle for writing to a connection.
///
/// A sender shares only the write half and the alive flag, not the listener
/// set, so a listener can hold one to reply to the server without creating a
/// reference cycle with the [`Connection`] that owns it.  Writes go to
/// whichever socket the connection currently has open.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
}

impl ConnectionSender {
    /// Returns true while the owning connection is live.
    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Writes `data` to the socket unchanged.
    ///
    /// A send blocked on a peer that is not reading is abandoned as soon as
    /// the connection closes; part of `data` may already have been written.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] if the connection is not
    /// alive or closes before the write completes, or
    /// [`ConnectionError::Io`] if the write fails.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<(), ConnectionError> {
        // Registered before the alive check so a concurrent `close` cannot
        // slip between the two unnoticed.
        let closing = self.shared.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        if !self.shared.is_alive() {
            return Err(ConnectionError::NotConnected);
        }

        let write = async {
            let mut guard = self.shared.writer.lock().await;
            let writer = guard.as_mut().ok_or(ConnectionError::NotConnected)?;
            writer.write_all(data).await?;
            Ok::<(), ConnectionError>(())
        };

        tokio::select! {
            biased;
            _ = &mut closing => {
                debug!("send of {} bytes cancelled by close", data.len());
                Err(ConnectionError::NotConnected)
            }
            result = write => {
                result?;
                trace!("sent {} bytes", data.len());
                Ok(())
            }
        }
    }

    /// Sends `message` as UTF-8.  With `ensure_line_ending`, a `\r\n` is
    /// appended unless the message already ends with one.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionSender::send_bytes`].
    pub async fn send_text(
        &self,
        message: &str,
        ensure_line_ending: bool,
    ) -> Result<(), ConnectionError> {
        let text = if ensure_line_ending {
            terminate_line(message)
        } else {
            Cow::Borrowed(message)
        };
        self.send_bytes(text.as_bytes()).await
    }

    /// Sends `message` terminated by exactly one `\r\n`.
    ///
    /// # Errors
    ///
    /// Same as [`ConnectionSender::send_bytes`].
    pub async fn send_line(&self, message: &str) -> Result<(), ConnectionError> {
        self.send_text(message, true).await
    }
}

/// A persistent, line-oriented client connection.
///
/// `D` is the decode hook applied to every received line; the default
/// [`RawDecoder`] hands listeners the raw line bytes.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use linewire_client::Connection;
/// use linewire_core::{MessageListener, Utf8Decoder};
///
/// # async fn example() -> anyhow::Result<()> {
/// let conn = Connection::with_decoder(Utf8Decoder);
/// conn.add_listener(MessageListener::accept_all(|line: &String| println!("{line}")).shared());
///
/// if conn.connect("127.0.0.1", 6667, Duration::from_secs(10)).await? {
///     conn.send_line("NICK linewire").await?;
/// }
/// conn.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct Connection<D: Decoder = RawDecoder> {
    config: ConnectionConfig,
    decoder: Arc<D>,
    listeners: Arc<ListenerSet<D::Message>>,
    sender: ConnectionSender,
    /// Serialises connect/disconnect and holds the live session, if any.
    session: Mutex<Option<Session>>,
}

impl Connection<RawDecoder> {
    /// Creates an idle connection that dispatches raw line bytes.
    pub fn new() -> Self {
        Self::with_decoder(RawDecoder)
    }
}

impl Default for Connection<RawDecoder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Decoder> Connection<D> {
    /// Creates an idle connection using `decoder` and default settings.
    pub fn with_decoder(decoder: D) -> Self {
        Self::with_config(decoder, ConnectionConfig::default())
    }

    /// Creates an idle connection using `decoder` and `config`.
    pub fn with_config(decoder: D, config: ConnectionConfig) -> Self {
        Self {
            config,
            decoder: Arc::new(decoder),
            listeners: Arc::new(ListenerSet::new()),
            sender: ConnectionSender {
                shared: Arc::new(Shared::default()),
            },
            session: Mutex::new(None),
        }
    }

    /// The settings this connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The decode hook applied to received lines.
    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Connects to `host:port` and starts the receive task.
    ///
    /// Returns `Ok(true)` when the connection was established and `Ok(false)`
    /// when it was already alive (nothing is changed in that case).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectFailed`] if the host cannot be
    /// resolved or refuses the connection, [`ConnectionError::ConnectTimeout`]
    /// if the handshake exceeds `timeout`, and [`ConnectionError::Io`] if the
    /// new socket cannot be inspected.  The connection stays idle on error.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<bool, ConnectionError> {
        let mut session = self.session.lock().await;
        if self.is_alive() {
            debug!("connect to {host}:{port} ignored; already connected");
            return Ok(false);
        }

        let addr = format!("{host}:{port}");
        let stream = match time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                warn!("could not connect to {addr}: {source}");
                return Err(ConnectionError::ConnectFailed { addr, source });
            }
            Err(_) => {
                warn!("connect to {addr} timed out after {timeout:?}");
                return Err(ConnectionError::ConnectTimeout { addr, timeout });
            }
        };

        self.start(&mut session, stream).await?;
        Ok(true)
    }

    /// Connects using the configured connect timeout.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::connect`].
    pub async fn connect_default(&self, host: &str, port: u16) -> Result<bool, ConnectionError> {
        self.connect(host, port, self.config.connect_timeout()).await
    }

    /// Adopts an already-connected stream and starts the receive task.
    ///
    /// Returns `Ok(false)` (and drops `stream`) if the connection is already
    /// alive.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Io`] if the stream's addresses cannot be
    /// read, which usually means it is no longer connected.
    pub async fn connect_stream(&self, stream: TcpStream) -> Result<bool, ConnectionError> {
        let mut session = self.session.lock().await;
        if self.is_alive() {
            debug!("connect_stream ignored; already connected");
            return Ok(false);
        }
        self.start(&mut session, stream).await?;
        Ok(true)
    }

    async fn start(
        &self,
        session: &mut Option<Session>,
        stream: TcpStream,
    ) -> Result<(), ConnectionError> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for {peer}: {e}");
            }
        }

        // A task that ended on its own (peer close) is reaped before the
        // shared state is reused, so its cleanup cannot clobber the new socket.
        if let Some(stale) = session.take() {
            reap(stale).await;
        }

        let (read_half, write_half) = stream.into_split();
        let shared = Arc::clone(&self.sender.shared);
        *shared.writer.lock().await = Some(write_half);
        shared.alive.store(true, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(receive_loop(
            read_half,
            shutdown_rx,
            Arc::clone(&self.decoder),
            Arc::clone(&self.listeners),
            shared,
            self.config.clone(),
            peer,
        ));

        info!("connected to {peer} from {local}");
        *session = Some(Session {
            peer,
            local,
            shutdown: Some(shutdown_tx),
            task,
        });
        Ok(())
    }

    /// Closes the socket and stops the receive task.
    ///
    /// Returns true if the connection was alive.  Calling it on an idle
    /// connection returns false; any task left over from a peer-initiated
    /// close is reaped either way.
    pub async fn disconnect(&self) -> bool {
        let mut guard = self.session.lock().await;
        let was_alive = self.sender.shared.alive.swap(false, Ordering::AcqRel);
        let Some(mut session) = guard.take() else {
            return false;
        };

        if let Some(shutdown) = session.shutdown.take() {
            // The task may already have exited after a peer close.
            let _ = shutdown.send(());
        }
        self.sender.shared.close().await;
        let peer = session.peer;
        reap(session).await;

        if was_alive {
            info!("disconnected from {peer}");
        }
        was_alive
    }

    /// Point-in-time snapshot of the alive flag.
    pub fn is_alive(&self) -> bool {
        self.sender.shared.is_alive()
    }

    /// Remote address of the live socket.
    pub async fn peer_addr(&self) -> Option<SocketAddr> {
        let guard = self.session.lock().await;
        guard.as_ref().filter(|_| self.is_alive()).map(|s| s.peer)
    }

    /// Local address of the live socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let guard = self.session.lock().await;
        guard.as_ref().filter(|_| self.is_alive()).map(|s| s.local)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Returns a cloneable write handle for this connection.
    pub fn sender(&self) -> ConnectionSender {
        self.sender.clone()
    }

    /// Writes raw bytes.  See [`ConnectionSender::send_bytes`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when idle.
    pub async fn send_bytes(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.sender.send_bytes(data).await
    }

    /// Writes UTF-8 text.  See [`ConnectionSender::send_text`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when idle.
    pub async fn send_text(
        &self,
        message: &str,
        ensure_line_ending: bool,
    ) -> Result<(), ConnectionError> {
        self.sender.send_text(message, ensure_line_ending).await
    }

    /// Writes one CRLF-terminated line.  See [`ConnectionSender::send_line`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::NotConnected`] when idle.
    pub async fn send_line(&self, message: &str) -> Result<(), ConnectionError> {
        self.sender.send_line(message).await
    }

    // ── Listeners ─────────────────────────────────────────────────────────────

    /// Registers a listener.  Returns false if that `Arc` is already
    /// registered.  Safe to call while the receive task is dispatching.
    pub fn add_listener(&self, listener: SharedListener<D::Message>) -> bool {
        self.listeners.add(listener)
    }

    /// Unregisters a listener.  Once this returns, the listener is not
    /// offered any line whose dispatch starts afterwards.  Returns false if
    /// it was not registered.
    pub fn remove_listener(&self, listener: &SharedListener<D::Message>) -> bool {
        self.listeners.remove(listener)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

async fn reap(session: Session) {
    if let Err(e) = session.task.await {
        if e.is_panic() {
            error!("receive task for {} panicked: {e}", session.peer);
        }
    }
}

// ── Receive loop ──────────────────────────────────────────────────────────────

/// Reads from the socket until shutdown, peer close, or a read failure.
///
/// Whatever ends the loop, the shared state is closed on the way out, so
/// `is_alive()` turns false without anyone calling `disconnect`.
async fn receive_loop<D: Decoder>(
    mut reader: OwnedReadHalf,
    mut shutdown: oneshot::Receiver<()>,
    decoder: Arc<D>,
    listeners: Arc<ListenerSet<D::Message>>,
    shared: Arc<Shared>,
    config: ConnectionConfig,
    peer: SocketAddr,
) {
    let mut framer = LineFramer::with_max_line_length(config.max_line_length);
    let mut read_buf = vec![0u8; config.read_buffer_size.max(1)];
    let read_timeout = config.read_timeout();

    debug!("receive loop for {peer} started");

    while shared.is_alive() {
        let read = tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("receive loop for {peer} received shutdown");
                break;
            }
            result = read_chunk(&mut reader, &mut read_buf, read_timeout) => result,
        };

        let n = match read {
            Ok(0) => {
                info!("{peer} closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("no data from {peer} within {read_timeout:?}; closing");
                break;
            }
            Err(e) => {
                if shared.is_alive() {
                    warn!("read from {peer} failed: {e}");
                }
                break;
            }
        };

        trace!("read {n} bytes from {peer}");
        framer.push(&read_buf[..n]);

        while shared.is_alive() {
            match framer.next_line() {
                Ok(Some(line)) => dispatch_line(decoder.as_ref(), &listeners, &line, peer),
                Ok(None) => break,
                Err(e) => warn!("{peer}: {e}"),
            }
        }
    }

    shared.close().await;
    debug!("receive loop for {peer} stopped");
}

async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    read_timeout: Option<Duration>,
) -> io::Result<usize> {
    match read_timeout {
        Some(limit) => time::timeout(limit, reader.read(buf))
            .await
            .unwrap_or_else(|_| Err(io::Error::from(io::ErrorKind::TimedOut))),
        None => reader.read(buf).await,
    }
}

fn dispatch_line<D: Decoder>(
    decoder: &D,
    listeners: &ListenerSet<D::Message>,
    line: &[u8],
    peer: SocketAddr,
) {
    match decoder.decode(line) {
        Ok(message) => {
            let outcome = listeners.dispatch(&message);
            trace!(
                "{peer}: line delivered={} rejected={} failed={}",
                outcome.delivered,
                outcome.rejected,
                outcome.failed
            );
        }
        Err(e) => warn!("{peer}: dropping undecodable line: {e}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use linewire_core::MessageListener;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn local_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn test_new_connection_is_idle() {
        // Arrange / Act
        let conn = Connection::new();

        // Assert
        assert!(!conn.is_alive());
        assert_eq!(conn.listener_count(), 0);
        assert_eq!(conn.config(), &ConnectionConfig::default());
    }

    #[tokio::test]
    async fn test_send_while_idle_is_not_connected_error() {
        let conn = Connection::new();

        let result = conn.send_text("PING", true).await;

        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_disconnect_while_idle_returns_false() {
        let conn = Connection::new();
        assert!(!conn.disconnect().await);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error_and_stays_idle() {
        // Arrange: bind then drop to obtain a port nobody listens on
        let (listener, port) = local_listener().await;
        drop(listener);
        let conn = Connection::new();

        // Act
        let result = conn.connect("127.0.0.1", port, TIMEOUT).await;

        // Assert
        assert!(matches!(result, Err(ConnectionError::ConnectFailed { .. })));
        assert!(!conn.is_alive());
        assert_eq!(conn.peer_addr().await, None);
    }

    #[tokio::test]
    async fn test_connect_sets_alive_and_addresses() {
        // Arrange
        let (listener, port) = local_listener().await;
        let conn = Connection::new();

        // Act
        let connected = conn.connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        let (_server, client_addr) = listener.accept().await.unwrap();

        // Assert
        assert!(connected);
        assert!(conn.is_alive());
        assert_eq!(conn.peer_addr().await.map(|a| a.port()), Some(port));
        assert_eq!(conn.local_addr().await, Some(client_addr));

        assert!(conn.disconnect().await);
        assert!(!conn.is_alive());
        assert_eq!(conn.peer_addr().await, None);
    }

    #[tokio::test]
    async fn test_connect_stream_adopts_existing_socket() {
        let (listener, port) = local_listener().await;
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let conn = Connection::new();

        assert!(conn.connect_stream(stream).await.unwrap());
        assert!(conn.is_alive());

        let second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert!(!conn.connect_stream(second).await.unwrap());
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_sender_observes_connection_state() {
        let (listener, port) = local_listener().await;
        let conn = Connection::new();
        let sender = conn.sender();
        assert!(!sender.is_alive());

        conn.connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        assert!(sender.is_alive());

        conn.disconnect().await;
        assert!(!sender.is_alive());
        assert!(matches!(
            sender.send_line("late").await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_send_blocked_on_unread_peer() {
        // Arrange: the peer accepts but never reads
        let (listener, port) = local_listener().await;
        let conn = Connection::new();
        conn.connect("127.0.0.1", port, TIMEOUT).await.unwrap();
        let (_server, _) = listener.accept().await.unwrap();
        let sender = conn.sender();
        let payload = vec![b'x'; 64 * 1024 * 1024];
        let send = tokio::spawn(async move { sender.send_bytes(&payload).await });
        time::sleep(Duration::from_millis(200)).await;

        // Act
        let disconnected = time::timeout(TIMEOUT, conn.disconnect()).await;

        // Assert
        assert_eq!(disconnected.ok(), Some(true), "disconnect must not wait for the send");
        let result = time::timeout(TIMEOUT, send).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
    }

    #[test]
    fn test_add_and_remove_listener_through_connection() {
        let conn = Connection::new();
        let listener = MessageListener::accept_all(|_: &Vec<u8>| {}).shared();

        assert!(conn.add_listener(Arc::clone(&listener)));
        assert!(!conn.add_listener(Arc::clone(&listener)));
        assert_eq!(conn.listener_count(), 1);
        assert!(conn.remove_listener(&listener));
        assert!(!conn.remove_listener(&listener));
    }

    #[test]
    fn test_connection_error_messages() {
        let err = ConnectionError::ConnectTimeout {
            addr: "10.0.0.1:6667".to_string(),
            timeout: Duration::from_secs(3),
        };
        assert_eq!(err.to_string(), "timed out after 3s connecting to 10.0.0.1:6667");
        assert_eq!(ConnectionError::NotConnected.to_string(), "not connected");
    }
}
