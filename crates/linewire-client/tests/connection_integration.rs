//! Integration tests for the connection lifecycle and receive loop.
//!
//! # Purpose
//!
//! Each test plays the server side itself: it binds a `TcpListener` on an
//! ephemeral loopback port, lets a [`Connection`] connect to it, and then
//! writes raw bytes to (or reads raw bytes from) the accepted socket.  This
//! exercises the real socket path end to end:
//!
//! ```text
//! test "server"  ──bytes──►  Connection receive task  ──►  listeners ──► channel
//! test "server"  ◄──bytes──  Connection::send_*
//! ```
//!
//! Listeners forward what they receive into an unbounded channel so the test
//! can await delivery with a timeout instead of sleeping.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

use linewire_client::{Connection, ConnectionConfig, ConnectionError};
use linewire_core::{IrcDecoder, IrcMessage, MessageListener, SharedListener, Utf8Decoder};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn accept(listener: &TcpListener) -> TcpStream {
    timeout(TIMEOUT, listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept failed")
        .0
}

/// Connects a fresh text connection and returns it with the server socket.
async fn connected_pair(config: ConnectionConfig) -> (Connection<Utf8Decoder>, TcpStream) {
    let (listener, port) = bind().await;
    let conn = Connection::with_config(Utf8Decoder, config);
    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    let server = accept(&listener).await;
    (conn, server)
}

fn channel_listener() -> (SharedListener<String>, UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = MessageListener::accept_all(move |line: &String| {
        let _ = tx.send(line.clone());
    })
    .shared();
    (listener, rx)
}

async fn next(rx: &mut UnboundedReceiver<String>) -> String {
    timeout(TIMEOUT, rx.recv())
        .await
        .expect("no message within timeout")
        .expect("listener channel closed")
}

/// Asserts that nothing more arrives within a short grace period.
async fn assert_quiet(rx: &mut UnboundedReceiver<String>) {
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected extra message");
}

async fn wait_until_idle<D: linewire_core::Decoder>(conn: &Connection<D>) {
    timeout(TIMEOUT, async {
        while conn.is_alive() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection did not become idle");
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Several complete lines in a single write are all dispatched, in order.
#[tokio::test]
async fn test_three_lines_in_one_write_dispatch_three_messages() {
    // Arrange
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    // Act
    server.write_all(b"A\r\nB\r\nC\r\n").await.unwrap();

    // Assert
    assert_eq!(next(&mut rx).await, "A");
    assert_eq!(next(&mut rx).await, "B");
    assert_eq!(next(&mut rx).await, "C");
    assert_quiet(&mut rx).await;

    conn.disconnect().await;
}

/// A line split across two reads is reassembled into one message.
#[tokio::test]
async fn test_line_split_across_reads_dispatches_once() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    server.write_all(b"AB").await.unwrap();
    server.flush().await.unwrap();
    sleep(Duration::from_millis(50)).await;
    server.write_all(b"C\r\n").await.unwrap();

    assert_eq!(next(&mut rx).await, "ABC");
    assert_quiet(&mut rx).await;

    conn.disconnect().await;
}

/// A tiny read buffer forces many partial reads; lines must still survive.
#[tokio::test]
async fn test_small_read_buffer_reassembles_lines() {
    let config = ConnectionConfig {
        read_buffer_size: 3,
        ..Default::default()
    };
    let (conn, mut server) = connected_pair(config).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    server
        .write_all(b":srv NOTICE * :hello\r\nPING :42\r\n")
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, ":srv NOTICE * :hello");
    assert_eq!(next(&mut rx).await, "PING :42");

    conn.disconnect().await;
}

/// An over-long line is dropped without killing the connection.
#[tokio::test]
async fn test_overlong_line_is_discarded_and_loop_continues() {
    let config = ConnectionConfig {
        max_line_length: 8,
        ..Default::default()
    };
    let (conn, mut server) = connected_pair(config).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    server.write_all(b"0123456789abcdef\r\nok\r\n").await.unwrap();

    assert_eq!(next(&mut rx).await, "ok");
    assert!(conn.is_alive());

    conn.disconnect().await;
}

/// The tail of an over-long line that arrives in a later read is dropped too.
#[tokio::test]
async fn test_overlong_line_spanning_reads_never_leaks_its_tail() {
    // Arrange
    let config = ConnectionConfig {
        max_line_length: 8,
        ..Default::default()
    };
    let (conn, mut server) = connected_pair(config).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    // Act: the line overflows in the first read and ends in the second
    server.write_all(b"0123456789").await.unwrap();
    server.flush().await.unwrap();
    sleep(Duration::from_millis(100)).await;
    server.write_all(b"abcdef\r\nok\r\n").await.unwrap();

    // Assert
    assert_eq!(next(&mut rx).await, "ok");
    assert_quiet(&mut rx).await;

    conn.disconnect().await;
}

// ── Listener contract ─────────────────────────────────────────────────────────

/// `receive` runs only for accepted messages, exactly once each.
#[tokio::test]
async fn test_accept_filter_controls_receive() {
    // Arrange
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    let offered = Arc::new(AtomicUsize::new(0));
    let offered_clone = Arc::clone(&offered);
    let (tx, mut rx) = mpsc::unbounded_channel();
    conn.add_listener(
        MessageListener::new(
            move |line: &String| {
                offered_clone.fetch_add(1, Ordering::SeqCst);
                line.starts_with("PING")
            },
            move |line: &String| {
                let _ = tx.send(line.clone());
            },
        )
        .shared(),
    );

    // Act
    server
        .write_all(b"NOTICE a\r\nPING :1\r\nNOTICE b\r\nPING :2\r\n")
        .await
        .unwrap();

    // Assert
    assert_eq!(next(&mut rx).await, "PING :1");
    assert_eq!(next(&mut rx).await, "PING :2");
    assert_quiet(&mut rx).await;
    assert_eq!(offered.load(Ordering::SeqCst), 4);

    conn.disconnect().await;
}

/// After `remove_listener` returns, the listener sees no further messages.
#[tokio::test]
async fn test_removed_listener_receives_nothing_afterwards() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    let (a, mut rx_a) = channel_listener();
    let (b, mut rx_b) = channel_listener();
    conn.add_listener(Arc::clone(&a));
    conn.add_listener(b);

    server.write_all(b"one\r\n").await.unwrap();
    assert_eq!(next(&mut rx_a).await, "one");
    assert_eq!(next(&mut rx_b).await, "one");

    assert!(conn.remove_listener(&a));
    server.write_all(b"two\r\n").await.unwrap();

    assert_eq!(next(&mut rx_b).await, "two");
    assert_quiet(&mut rx_a).await;

    conn.disconnect().await;
}

/// A panicking listener neither stops other listeners nor the receive loop.
#[tokio::test]
async fn test_panicking_listener_is_isolated() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    conn.add_listener(MessageListener::accept_all(|_: &String| panic!("listener bug")).shared());
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    server.write_all(b"first\r\n").await.unwrap();
    assert_eq!(next(&mut rx).await, "first");
    server.write_all(b"second\r\n").await.unwrap();
    assert_eq!(next(&mut rx).await, "second");

    assert!(conn.is_alive());
    conn.disconnect().await;
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// A second `connect` while alive is a no-op returning false.
#[tokio::test]
async fn test_double_connect_returns_false() {
    // Arrange
    let (listener, port) = bind().await;
    let conn = Connection::with_decoder(Utf8Decoder);
    let (l, _rx) = channel_listener();
    conn.add_listener(l);
    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    let _server = accept(&listener).await;

    // Act
    let second = assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await);

    // Assert
    assert!(!second);
    assert!(conn.is_alive());
    assert_eq!(conn.listener_count(), 1);
    assert!(
        timeout(Duration::from_millis(100), listener.accept()).await.is_err(),
        "no second socket may be opened"
    );

    conn.disconnect().await;
}

/// `disconnect` on a live connection returns true once, then false.
#[tokio::test]
async fn test_double_disconnect_returns_false() {
    let (conn, _server) = connected_pair(ConnectionConfig::default()).await;

    assert!(conn.disconnect().await);
    assert!(!conn.disconnect().await);
    assert!(!conn.is_alive());
}

/// `disconnect` unblocks a receive task parked in `read()` and the peer sees EOF.
#[tokio::test]
async fn test_disconnect_interrupts_pending_read() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;

    let disconnected = timeout(TIMEOUT, conn.disconnect())
        .await
        .expect("disconnect must not hang on a blocked read");

    assert!(disconnected);
    let mut buf = [0u8; 16];
    let n = timeout(TIMEOUT, server.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0, "server must observe end of stream");
}

/// `disconnect` stays prompt while a send is stuck on a peer that never reads.
#[tokio::test]
async fn test_disconnect_is_prompt_with_send_stalled_on_unread_peer() {
    // Arrange
    let (conn, _server) = connected_pair(ConnectionConfig::default()).await;
    let sender = conn.sender();
    let payload = vec![b'x'; 64 * 1024 * 1024];
    let stalled = tokio::spawn(async move { sender.send_bytes(&payload).await });
    sleep(Duration::from_millis(200)).await;

    // Act
    let disconnected = timeout(Duration::from_secs(3), conn.disconnect())
        .await
        .expect("disconnect must not wait for the pending send");

    // Assert
    assert!(disconnected);
    assert!(!conn.is_alive());
    let result = timeout(TIMEOUT, stalled).await.unwrap().unwrap();
    assert!(matches!(result, Err(ConnectionError::NotConnected)));
}

/// A peer close turns the connection idle without calling `disconnect`.
#[tokio::test]
async fn test_peer_close_marks_connection_idle() {
    let (conn, server) = connected_pair(ConnectionConfig::default()).await;

    drop(server);
    wait_until_idle(&conn).await;

    assert!(!conn.is_alive());
    assert!(matches!(
        conn.send_line("anyone there?").await,
        Err(ConnectionError::NotConnected)
    ));
    // Nothing left to disconnect.
    assert!(!conn.disconnect().await);
}

/// Lines that arrive together with the close are still delivered.
#[tokio::test]
async fn test_lines_before_peer_close_are_delivered() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;
    let (listener, mut rx) = channel_listener();
    conn.add_listener(listener);

    server.write_all(b"bye\r\n").await.unwrap();
    drop(server);

    assert_eq!(next(&mut rx).await, "bye");
    wait_until_idle(&conn).await;
}

/// After a peer close the same connection can connect again.
#[tokio::test]
async fn test_reconnect_after_peer_close() {
    let (listener, port) = bind().await;
    let conn = Connection::with_decoder(Utf8Decoder);
    let (l, mut rx) = channel_listener();
    conn.add_listener(l);

    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    drop(accept(&listener).await);
    wait_until_idle(&conn).await;

    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    let mut server = accept(&listener).await;
    server.write_all(b"again\r\n").await.unwrap();

    assert_eq!(next(&mut rx).await, "again");
    assert!(conn.disconnect().await);
}

/// With a read timeout configured, a silent peer ends the connection.
#[tokio::test]
async fn test_read_timeout_closes_silent_connection() {
    let config = ConnectionConfig {
        read_timeout_secs: 1,
        ..Default::default()
    };
    let (conn, _server) = connected_pair(config).await;

    wait_until_idle(&conn).await;

    assert!(!conn.is_alive());
}

/// Connecting to a closed port fails, and the error is surfaced.
#[tokio::test]
async fn test_connect_failure_is_reported() {
    let (listener, port) = bind().await;
    drop(listener);
    let conn = Connection::new();

    let err = assert_err!(conn.connect("127.0.0.1", port, TIMEOUT).await);

    assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
    assert!(!conn.is_alive());
}

// ── Sending ───────────────────────────────────────────────────────────────────

/// `send_text` appends CRLF once and never doubles it.
#[tokio::test]
async fn test_send_text_ensures_single_crlf() {
    // Arrange
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;

    // Act
    assert_ok!(conn.send_text("PING", true).await);
    assert_ok!(conn.send_text("PING\r\n", true).await);
    assert_ok!(conn.send_text("raw", false).await);
    conn.disconnect().await;

    // Assert
    let mut received = Vec::new();
    timeout(TIMEOUT, server.read_to_end(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, b"PING\r\nPING\r\nraw");
}

/// `send_bytes` writes bytes verbatim, including non-UTF-8 data.
#[tokio::test]
async fn test_send_bytes_is_verbatim() {
    let (conn, mut server) = connected_pair(ConnectionConfig::default()).await;

    assert_ok!(conn.send_bytes(&[0x00, 0xff, b'\r', b'\n']).await);

    let mut buf = [0u8; 4];
    timeout(TIMEOUT, server.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, [0x00, 0xff, b'\r', b'\n']);

    conn.disconnect().await;
}

// ── Decode hook ───────────────────────────────────────────────────────────────

/// An IRC connection answers PING through a cloned sender from a listener.
#[tokio::test]
async fn test_irc_listener_replies_to_ping_via_sender() {
    // Arrange
    let (listener, port) = bind().await;
    let conn = Connection::with_decoder(IrcDecoder);
    let sender = conn.sender();
    conn.add_listener(
        MessageListener::new(
            |msg: &IrcMessage| msg.is_ping(),
            move |msg: &IrcMessage| {
                let reply = format!("PONG :{}", msg.ping_token().unwrap_or_default());
                let sender = sender.clone();
                tokio::spawn(async move {
                    let _ = sender.send_line(&reply).await;
                });
            },
        )
        .shared(),
    );
    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    let mut server = accept(&listener).await;

    // Act: an undecodable (blank-command) line first, then the PING
    server
        .write_all(b":prefix.only\r\nPING :abc123\r\n")
        .await
        .unwrap();

    // Assert
    let mut buf = vec![0u8; b"PONG :abc123\r\n".len()];
    timeout(TIMEOUT, server.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(buf, b"PONG :abc123\r\n");
    assert!(conn.is_alive());

    conn.disconnect().await;
}

/// The default connection hands listeners the raw line bytes.
#[tokio::test]
async fn test_raw_connection_dispatches_bytes() {
    let (listener, port) = bind().await;
    let conn = Connection::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    conn.add_listener(
        MessageListener::accept_all(move |bytes: &Vec<u8>| {
            let _ = tx.send(bytes.clone());
        })
        .shared(),
    );
    assert!(assert_ok!(conn.connect("127.0.0.1", port, TIMEOUT).await));
    let mut server = accept(&listener).await;

    server.write_all(b"\xfe\xff\r\n").await.unwrap();

    let got = timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, vec![0xfe, 0xff]);

    conn.disconnect().await;
}
