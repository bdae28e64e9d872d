//! Integration tests for the connection facade.
//!
//! Each test runs a small scripted server on a loopback listener.
//! Set `RUST_LOG=mailwire=trace` to see the transport's logs.

#![allow(clippy::unwrap_used, clippy::similar_names)]

use std::future::Future;
use std::time::Duration;

use mailwire::{CloseReason, Config, Connection, ConnectionState, Error, Security};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Binds a loopback listener and runs `script` on the first accepted socket.
async fn serve<F, Fut>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        script(socket).await;
    });
    (port, handle)
}

/// Reads until the client closes its side.
async fn wait_for_eof(socket: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    while let Ok(n) = socket.read(&mut buf).await {
        if n == 0 {
            break;
        }
    }
}

fn plain(port: u16) -> Config {
    Config::builder("127.0.0.1", port)
        .security(Security::Plain)
        .receive_timeout(WAIT)
        .build()
}

#[tokio::test]
async fn test_greeting_line() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        socket.write_all(b"+OK ready\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.peer_addr().is_some());

    assert_eq!(conn.receive_line().await.unwrap(), "+OK ready\r\n");
    assert_eq!(conn.pending_lines(), 0);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.await.unwrap();
}

#[tokio::test]
async fn test_receive_until_across_chunks() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        socket.write_all(b"line1\r\nli").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(b"ne2\r\nTAG OK do").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(b"ne\r\n* 5 EXISTS\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    let pattern = Regex::new("^TAG ").unwrap();

    let reply = conn.receive_until(&pattern).await.unwrap();
    assert_eq!(reply, "line1\r\nline2\r\nTAG OK done\r\n");
    assert_eq!(conn.receive_line().await.unwrap(), "* 5 EXISTS\r\n");

    conn.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_send_and_reply() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        socket.write_all(b"* OK IMAP ready\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"A1 NOOP\r\n");
        socket
            .write_all(b"* 3 EXISTS\r\nA1 OK NOOP completed\r\n")
            .await
            .unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    assert_eq!(conn.receive_line().await.unwrap(), "* OK IMAP ready\r\n");

    assert!(conn.send("A1 NOOP\r\n").await);
    let tagged = Regex::new(r"^A1 (OK|NO|BAD)").unwrap();
    assert_eq!(
        conn.receive_until(&tagged).await.unwrap(),
        "* 3 EXISTS\r\nA1 OK NOOP completed\r\n"
    );

    conn.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_lines_arrive_in_order() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        let mut payload = Vec::new();
        for i in 0..200 {
            payload.extend_from_slice(format!("* {i} FETCH (FLAGS ())\r\n").as_bytes());
        }
        for chunk in payload.chunks(37) {
            socket.write_all(chunk).await.unwrap();
        }
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    for i in 0..200 {
        assert_eq!(
            conn.receive_line().await.unwrap(),
            format!("* {i} FETCH (FLAGS ())\r\n")
        );
    }

    conn.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_peer_close_breaks_connection() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        socket.write_all(b"* BYE shutting down\r\n").await.unwrap();
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    server.await.unwrap();

    assert_eq!(conn.receive_line().await.unwrap(), "* BYE shutting down\r\n");
    assert!(matches!(
        conn.receive_line().await,
        Err(Error::QueueClosed(CloseReason::EndOfStream))
    ));
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert!(!conn.send("A2 LOGOUT\r\n").await);

    conn.close().await;
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_broken_connection_releases_socket() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        socket.write_all(b"* BYE\r\n").await.unwrap();
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    server.await.unwrap();
    assert_eq!(conn.receive_line().await.unwrap(), "* BYE\r\n");
    assert!(conn.receive_line().await.is_err());
    assert!(conn.peer_addr().is_some());

    assert!(matches!(
        conn.try_send("A1 LOGOUT\r\n").await,
        Err(Error::InvalidState(_))
    ));
    assert!(conn.peer_addr().is_none());
    assert_eq!(conn.state(), ConnectionState::Broken);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_send_write_failure_keeps_state() {
    init_tracing();
    let (port, server) = serve(|socket| async move {
        drop(socket);
    })
    .await;

    // No pump runs before the upgrade, so only the write can notice the
    // peer is gone.
    let mut conn = Connection::open(Config::new("127.0.0.1", port)).await.unwrap();
    server.await.unwrap();

    let payload = "x".repeat(1 << 20);
    let mut failed = false;
    for _ in 0..20 {
        if !conn.send(&payload).await {
            failed = true;
            break;
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(matches!(
        conn.try_send("A1 NOOP\r\n").await,
        Err(Error::Write(_))
    ));
    assert_eq!(conn.state(), ConnectionState::Connected);

    conn.close().await;
}

#[tokio::test]
async fn test_undersized_read_buffer_is_raised() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        socket.write_all(b"+OK ready\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut config = plain(port);
    config.read_buffer_size = 0;
    let mut conn = Connection::open(config).await.unwrap();

    assert_eq!(conn.receive_line().await.unwrap(), "+OK ready\r\n");
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await;
}

#[tokio::test]
async fn test_close_wakes_blocked_consumer() {
    init_tracing();
    let (port, server) = serve(|mut socket| async move {
        wait_for_eof(&mut socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .security(Security::Plain)
        .build();
    let mut conn = Connection::open(config).await.unwrap();

    let lines = conn.lines();
    let consumer = tokio::spawn(async move { lines.receive_line().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!consumer.is_finished());

    tokio::time::timeout(WAIT, conn.close()).await.unwrap();
    let result = tokio::time::timeout(WAIT, consumer).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::QueueClosed(CloseReason::Closed))
    ));

    server.await.unwrap();
}

#[tokio::test]
async fn test_drop_wakes_blocked_consumer() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        wait_for_eof(&mut socket).await;
    })
    .await;

    let conn = Connection::open(plain(port)).await.unwrap();
    let lines = conn.lines();
    let consumer = tokio::spawn(async move { lines.receive_line().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(conn);

    let result = tokio::time::timeout(WAIT, consumer).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::QueueClosed(_))));
}

#[tokio::test]
async fn test_receive_timeout() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        wait_for_eof(&mut socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .security(Security::Plain)
        .receive_timeout(Duration::from_millis(50))
        .build();
    let mut conn = Connection::open(config).await.unwrap();

    assert!(matches!(conn.receive_line().await, Err(Error::Timeout(_))));
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await;
}

#[tokio::test]
async fn test_no_framing_before_upgrade() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        socket.write_all(b"* OK plaintext greeting\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(Config::new("127.0.0.1", port)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(matches!(
        conn.receive_line().await,
        Err(Error::InvalidState(_))
    ));
    conn.close().await;
}

#[tokio::test]
async fn test_failed_upgrade_breaks_connection() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        let mut buf = [0u8; 2048];
        let _ = socket.read(&mut buf).await;
        socket.write_all(b"* BAD this is not TLS\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .handshake_timeout(WAIT)
        .build();
    let mut conn = Connection::open(config).await.unwrap();

    let result = conn.upgrade_to_secure().await;
    assert!(matches!(result, Err(Error::Handshake(_))));
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert!(conn.tls_info().is_none());
    assert!(!conn.send("A1 NOOP\r\n").await);
    assert!(matches!(
        conn.receive_line().await,
        Err(Error::QueueClosed(CloseReason::HandshakeFailed(_)))
    ));

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_implicit_tls_against_plaintext_server() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        socket.write_all(b"220 plaintext only\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .security(Security::Implicit)
        .handshake_timeout(WAIT)
        .build();
    let mut conn = Connection::new(config);

    assert!(matches!(conn.connect().await, Err(Error::Handshake(_))));
    assert_eq!(conn.state(), ConnectionState::Broken);
    conn.close().await;
}

#[tokio::test]
async fn test_starttls_discards_plaintext() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        socket.write_all(b"220 mail ready\r\n").await.unwrap();
        let mut buf = [0u8; 2048];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"STARTTLS\r\n");
        socket
            .write_all(b"220 go ahead\r\n250 injected\r\n")
            .await
            .unwrap();
        let _ = socket.read(&mut buf).await;
        socket.write_all(b"not a server hello\r\n").await.unwrap();
        wait_for_eof(&mut socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .security(Security::Plain)
        .handshake_timeout(WAIT)
        .receive_timeout(WAIT)
        .build();
    let mut conn = Connection::open(config).await.unwrap();

    assert_eq!(conn.receive_line().await.unwrap(), "220 mail ready\r\n");
    assert!(conn.send("STARTTLS\r\n").await);
    assert_eq!(conn.receive_line().await.unwrap(), "220 go ahead\r\n");

    // The server never speaks TLS, so the upgrade fails, but the injected
    // plaintext line must not be handed out afterwards.
    assert!(conn.upgrade_to_secure().await.is_err());
    assert_eq!(conn.pending_lines(), 0);
    assert!(matches!(
        conn.try_receive_line(),
        Err(Error::QueueClosed(CloseReason::HandshakeFailed(_)))
    ));
    conn.close().await;
}

#[tokio::test]
async fn test_connect_refused() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut conn = Connection::new(plain(port));
    assert!(matches!(conn.connect().await, Err(Error::Connect { .. })));
    assert_eq!(conn.state(), ConnectionState::Unconnected);
}

#[tokio::test]
async fn test_resolution_failure() {
    init_tracing();
    let config = Config::builder("no-such-host.invalid", 993)
        .connect_timeout(Duration::from_secs(10))
        .build();
    let mut conn = Connection::new(config);

    let result = conn.connect().await;
    assert!(
        matches!(result, Err(Error::Resolution { .. } | Error::Timeout(_))),
        "unexpected result: {result:?}"
    );
    assert_eq!(conn.state(), ConnectionState::Unconnected);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    init_tracing();
    let (port, _server) = serve(|mut socket| async move {
        wait_for_eof(&mut socket).await;
    })
    .await;

    let mut conn = Connection::open(plain(port)).await.unwrap();
    assert!(matches!(conn.connect().await, Err(Error::InvalidState(_))));
    assert_eq!(conn.state(), ConnectionState::Connected);
    conn.close().await;
}
