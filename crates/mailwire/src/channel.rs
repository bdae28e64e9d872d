//! Byte-level channel over TCP with optional TLS.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, lookup_host};
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use crate::config::{CertificateVerification, Config, MIN_READ_BUFFER_SIZE};
use crate::tls::{TlsInfo, create_tls_connector};
use crate::{Error, Result};

/// A TCP stream that may have been upgraded to TLS.
#[derive(Debug)]
pub enum Transport {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Result of a single channel read.
#[derive(Debug, PartialEq, Eq)]
pub enum Chunk<'a> {
    /// Bytes read, never empty.
    Data(&'a [u8]),
    /// The peer closed the stream.
    EndOfStream,
}

/// Where a channel is connected to.
#[derive(Debug, Clone)]
struct Endpoint {
    host: String,
    port: u16,
    peer_addr: SocketAddr,
}

/// A connected channel that can be upgraded to TLS in place.
#[derive(Debug)]
pub struct SecureChannel {
    transport: Option<Transport>,
    endpoint: Endpoint,
    tls: Option<TlsInfo>,
    read_buf: Vec<u8>,
}

impl SecureChannel {
    /// Resolves the configured host and opens a TCP connection.
    ///
    /// Resolved addresses are tried in order. `connect_timeout` bounds
    /// resolution and all attempts together. A read buffer smaller than
    /// [`MIN_READ_BUFFER_SIZE`] is raised to it.
    pub async fn connect(config: &Config) -> Result<Self> {
        let (tcp, peer_addr) =
            with_timeout(config.connect_timeout, open(&config.host, config.port)).await?;

        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle's algorithm");
        }

        Ok(Self {
            transport: Some(Transport::Plain(tcp)),
            endpoint: Endpoint {
                host: config.host.clone(),
                port: config.port,
                peer_addr,
            },
            tls: None,
            read_buf: vec![0; config.read_buffer_size.max(MIN_READ_BUFFER_SIZE)],
        })
    }

    /// Performs a TLS handshake over the open connection.
    ///
    /// The socket is released if the handshake fails or the server presents
    /// no certificate; the channel is then closed.
    pub async fn upgrade_to_secure(&mut self, config: &Config) -> Result<&TlsInfo> {
        match &self.transport {
            Some(Transport::Plain(_)) => {}
            Some(Transport::Tls(_)) => {
                return Err(Error::InvalidState("channel is already secure".into()));
            }
            None => return Err(Error::InvalidState("channel is closed".into())),
        }

        let connector = create_tls_connector(config.verification)?;
        let server_name = ServerName::try_from(self.endpoint.host.clone())?;

        let Some(Transport::Plain(tcp)) = self.transport.take() else {
            return Err(Error::InvalidState("channel is not plaintext".into()));
        };

        if config.verification == CertificateVerification::AcceptAny {
            warn!(
                host = %self.endpoint.host,
                "Server certificate and host name will not be verified"
            );
        }

        let handshake = async {
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::Handshake(e.to_string()))
        };
        let mut tls = with_timeout(config.handshake_timeout, handshake).await?;

        let info = match TlsInfo::from_connection(tls.get_ref().1) {
            Ok(info) => info,
            Err(e) => {
                if let Err(shutdown) = tls.shutdown().await {
                    debug!(error = %shutdown, "TLS shutdown after rejected handshake failed");
                }
                return Err(e);
            }
        };

        info!(
            host = %self.endpoint.host,
            protocol = ?info.protocol_version,
            cipher = ?info.cipher_suite,
            subject = ?info.peer.subject,
            issuer = ?info.peer.issuer,
            "TLS session established"
        );

        self.transport = Some(Transport::Tls(Box::new(tls)));
        let info: &TlsInfo = self.tls.insert(info);
        Ok(info)
    }

    /// Writes all of `data`, then flushes.
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::InvalidState("channel is closed".into()))?;
        write_all_flush(transport, data).await
    }

    /// Performs one read of up to the configured buffer size.
    pub async fn read_bytes(&mut self) -> Result<Chunk<'_>> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::InvalidState("channel is closed".into()))?;
        read_chunk(transport, &mut self.read_buf).await
    }

    /// Returns true if the channel has not been closed.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Returns true if the channel is TLS-encrypted.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_tls)
    }

    /// Returns the negotiated TLS session, if secure.
    #[must_use]
    pub const fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Returns the address the socket is connected to.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.endpoint.peer_addr
    }

    /// Splits the channel so reads and writes can proceed concurrently.
    pub fn into_split(self) -> Result<(ChannelReader, ChannelWriter)> {
        let transport = self
            .transport
            .ok_or_else(|| Error::InvalidState("channel is closed".into()))?;
        let (read, write) = tokio::io::split(transport);
        Ok((
            ChannelReader { half: read },
            ChannelWriter {
                half: write,
                endpoint: self.endpoint,
                tls: self.tls,
                read_buffer_size: self.read_buf.len(),
            },
        ))
    }

    /// Shuts down the TLS session (if any) and the socket.
    ///
    /// Calling this more than once is a no-op.
    pub async fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if let Err(e) = transport.shutdown().await {
            debug!(error = %e, "Shutdown of closing channel failed");
        }
        drop(transport);
        self.tls = None;
        info!(host = %self.endpoint.host, port = self.endpoint.port, "Channel closed");
    }
}

/// Read side of a split channel.
#[derive(Debug)]
pub struct ChannelReader {
    half: ReadHalf<Transport>,
}

impl ChannelReader {
    /// Rejoins the two halves of a channel.
    pub fn unsplit(self, writer: ChannelWriter) -> Result<SecureChannel> {
        if !self.half.is_pair_of(&writer.half) {
            return Err(Error::InvalidState(
                "reader and writer belong to different channels".into(),
            ));
        }
        Ok(SecureChannel {
            transport: Some(self.half.unsplit(writer.half)),
            endpoint: writer.endpoint,
            tls: writer.tls,
            read_buf: vec![0; writer.read_buffer_size],
        })
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().half).poll_read(cx, buf)
    }
}

/// Write side of a split channel.
#[derive(Debug)]
pub struct ChannelWriter {
    half: WriteHalf<Transport>,
    endpoint: Endpoint,
    tls: Option<TlsInfo>,
    read_buffer_size: usize,
}

impl ChannelWriter {
    /// Writes all of `data`, then flushes.
    pub async fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        write_all_flush(&mut self.half, data).await
    }

    /// Shuts down the write side, including the TLS session.
    ///
    /// Used when the read half could not be recovered.
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.half.shutdown().await {
            debug!(error = %e, "Shutdown of write half failed");
        }
    }

    /// Returns the negotiated TLS session, if secure.
    #[must_use]
    pub const fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Returns the address the socket is connected to.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.endpoint.peer_addr
    }
}

/// Resolves `host` and connects to the first address that accepts.
async fn open(host: &str, port: u16) -> Result<(TcpStream, SocketAddr)> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| Error::Resolution {
            host: host.to_string(),
            source,
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::Resolution {
            host: host.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                info!(host, %addr, "TCP connection established");
                return Ok((tcp, addr));
            }
            Err(e) => {
                debug!(host, %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(Error::Connect {
        host: host.to_string(),
        port,
        source: last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotConnected)),
    })
}

/// Reads once from `reader` into `buf`.
///
/// An unexpected EOF (TLS peer closing without `close_notify`) is reported
/// as [`Chunk::EndOfStream`] like a clean close.
pub(crate) async fn read_chunk<'a, R>(reader: &mut R, buf: &'a mut [u8]) -> Result<Chunk<'a>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read(buf).await {
        Ok(0) => Ok(Chunk::EndOfStream),
        Ok(n) => Ok(Chunk::Data(&buf[..n])),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            debug!(error = %e, "Peer closed without close_notify");
            Ok(Chunk::EndOfStream)
        }
        Err(e) => Err(Error::Read(e)),
    }
}

/// Writes every byte of `data` and flushes.
pub(crate) async fn write_all_flush<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(data).await.map_err(Error::Write)?;
    writer.flush().await.map_err(Error::Write)
}

/// Runs `fut`, failing with [`Error::Timeout`] if `limit` elapses first.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        None => fut.await,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_chunk() {
        let mut mock = Builder::new().read(b"* OK ready\r\n").build();
        let mut buf = [0u8; 1024];

        let chunk = read_chunk(&mut mock, &mut buf).await.unwrap();
        assert_eq!(chunk, Chunk::Data(b"* OK ready\r\n"));

        let chunk = read_chunk(&mut mock, &mut buf).await.unwrap();
        assert_eq!(chunk, Chunk::EndOfStream);
    }

    #[tokio::test]
    async fn test_read_chunk_error() {
        let mut mock = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let mut buf = [0u8; 1024];

        let result = read_chunk(&mut mock, &mut buf).await;
        assert!(matches!(result, Err(Error::Read(_))));
    }

    #[tokio::test]
    async fn test_read_chunk_unexpected_eof_is_end_of_stream() {
        let mut mock = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::UnexpectedEof))
            .build();
        let mut buf = [0u8; 1024];

        let chunk = read_chunk(&mut mock, &mut buf).await.unwrap();
        assert_eq!(chunk, Chunk::EndOfStream);
    }

    #[tokio::test]
    async fn test_write_all_flush() {
        let mut mock = Builder::new().write(b"A001 NOOP\r\n").build();
        write_all_flush(&mut mock, b"A001 NOOP\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_error() {
        let mut mock = Builder::new()
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let result = write_all_flush(&mut mock, b"A1 NOOP\r\n").await;
        assert!(matches!(result, Err(Error::Write(_))));
    }

    #[tokio::test]
    async fn test_with_timeout() {
        let ok = with_timeout(Some(Duration::from_secs(1)), async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let slow = with_timeout(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(slow, Err(Error::Timeout(_))));

        let unbounded = with_timeout(None, async { Ok("done") }).await;
        assert_eq!(unbounded.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = Config::new("127.0.0.1", port);
        let result = SecureChannel::connect(&config).await;
        assert!(matches!(result, Err(Error::Connect { .. })));
    }

    #[tokio::test]
    async fn test_channel_roundtrip_and_close() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 ready\r\n").await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let config = Config::new("127.0.0.1", port);
        let mut channel = SecureChannel::connect(&config).await.unwrap();
        assert!(channel.is_open());
        assert!(!channel.is_secure());
        assert!(channel.tls_info().is_none());

        let chunk = channel.read_bytes().await.unwrap();
        assert_eq!(chunk, Chunk::Data(b"220 ready\r\n"));

        channel.write_bytes(b"QUIT\r\n").await.unwrap();
        assert_eq!(server.await.unwrap(), b"QUIT\r\n");

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_open());
        assert!(matches!(
            channel.write_bytes(b"x").await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_split_and_unsplit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let config = Config::new("127.0.0.1", port);
        let channel = SecureChannel::connect(&config).await.unwrap();
        let peer = channel.peer_addr();
        let _socket = server.await.unwrap();

        let (reader, writer) = channel.into_split().unwrap();
        assert_eq!(writer.peer_addr(), peer);
        let mut channel = reader.unsplit(writer).unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.peer_addr(), peer);
        channel.close().await;
    }

    #[tokio::test]
    async fn test_upgrade_against_plaintext_server_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"* BAD not tls\r\n").await.unwrap();
        });

        let config = Config::builder("127.0.0.1", port)
            .handshake_timeout(Duration::from_secs(5))
            .build();
        let mut channel = SecureChannel::connect(&config).await.unwrap();
        let result = channel.upgrade_to_secure(&config).await;
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(!channel.is_open());
        channel.close().await;
    }
}
