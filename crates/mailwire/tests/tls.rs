//! TLS integration tests against a loopback server with a self-signed
//! certificate.

#![allow(clippy::unwrap_used, clippy::similar_names)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use mailwire::{CertificateVerification, Config, Connection, ConnectionState, Error, Security};
use regex::Regex;
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tls_acceptor() -> TlsAcceptor {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

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

async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &[u8]) {
    stream.write_all(data).await.unwrap();
    stream.flush().await.unwrap();
}

/// Greets, answers one `A1 NOOP`, then expects a clean close.
///
/// The final read fails with `UnexpectedEof` unless the client sent
/// `close_notify`.
async fn imap_session<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) {
    send(stream, b"* OK secure\r\n").await;
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"A1 NOOP\r\n");
    send(stream, b"* 1 EXISTS\r\nA1 OK done\r\n").await;
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
}

async fn run_client_session(conn: &mut Connection) {
    assert_eq!(conn.receive_line().await.unwrap(), "* OK secure\r\n");
    assert!(conn.send("A1 NOOP\r\n").await);
    let tagged = Regex::new(r"^A1 (OK|NO|BAD)").unwrap();
    assert_eq!(
        conn.receive_until(&tagged).await.unwrap(),
        "* 1 EXISTS\r\nA1 OK done\r\n"
    );
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}

fn assert_session_details(conn: &Connection) {
    let tls = conn.tls_info().unwrap();
    assert_eq!(tls.protocol_version.as_deref(), Some("TLSv1_3"));
    assert!(tls.cipher_suite.as_deref().unwrap().starts_with("TLS13_"));

    let subject = tls.peer.subject.as_deref().unwrap();
    assert!(subject.contains("rcgen self signed cert"), "subject: {subject}");
    // Self-signed.
    assert_eq!(tls.peer.subject, tls.peer.issuer);
    assert!(!tls.peer.der.is_empty());
}

fn config(port: u16, security: Security) -> Config {
    Config::builder("127.0.0.1", port)
        .security(security)
        .handshake_timeout(WAIT)
        .receive_timeout(WAIT)
        .build()
}

#[tokio::test]
async fn test_implicit_tls_session() {
    init_tracing();
    let acceptor = tls_acceptor();
    let (port, server) = serve(move |socket| async move {
        let mut tls = acceptor.accept(socket).await.unwrap();
        imap_session(&mut tls).await;
    })
    .await;

    let mut conn = Connection::open(config(port, Security::Implicit)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Secured);
    assert!(conn.is_secure());
    assert_session_details(&conn);

    run_client_session(&mut conn).await;
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_starttls_upgrade_starts_framing() {
    init_tracing();
    let acceptor = tls_acceptor();
    let (port, server) = serve(move |socket| async move {
        let mut tls = acceptor.accept(socket).await.unwrap();
        imap_session(&mut tls).await;
    })
    .await;

    let mut conn = Connection::open(config(port, Security::StartTls)).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.tls_info().is_none());

    let info = conn.upgrade_to_secure().await.unwrap();
    assert_eq!(info.protocol_version.as_deref(), Some("TLSv1_3"));
    assert_eq!(conn.state(), ConnectionState::Secured);
    assert_session_details(&conn);

    run_client_session(&mut conn).await;
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mid_session_starttls() {
    init_tracing();
    let acceptor = tls_acceptor();
    let (port, server) = serve(move |mut socket| async move {
        send(&mut socket, b"220 mail ready\r\n").await;
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"STARTTLS\r\n");
        send(&mut socket, b"220 go ahead\r\n").await;

        let mut tls = acceptor.accept(socket).await.unwrap();
        imap_session(&mut tls).await;
    })
    .await;

    let mut conn = Connection::open(config(port, Security::Plain)).await.unwrap();
    assert_eq!(conn.receive_line().await.unwrap(), "220 mail ready\r\n");
    assert!(conn.send("STARTTLS\r\n").await);
    assert_eq!(conn.receive_line().await.unwrap(), "220 go ahead\r\n");

    conn.upgrade_to_secure().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Secured);
    assert_session_details(&conn);

    run_client_session(&mut conn).await;
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_strict_rejects_self_signed() {
    init_tracing();
    let acceptor = tls_acceptor();
    let (port, _server) = serve(move |socket| async move {
        let _ = acceptor.accept(socket).await;
    })
    .await;

    let config = Config::builder("127.0.0.1", port)
        .security(Security::Implicit)
        .verification(CertificateVerification::Strict)
        .handshake_timeout(WAIT)
        .build();
    let mut conn = Connection::new(config);

    assert!(matches!(conn.connect().await, Err(Error::Handshake(_))));
    assert_eq!(conn.state(), ConnectionState::Broken);
    assert!(conn.tls_info().is_none());
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
}
