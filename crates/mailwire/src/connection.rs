//! Connection facade used by protocol clients.
//!
//! ## States
//!
//! ```text
//! ┌─────────────┐  connect()  ┌───────────┐  upgrade_to_secure()  ┌─────────┐
//! │ Unconnected │ ──────────→ │ Connected │ ────────────────────→ │ Secured │
//! └─────────────┘             └───────────┘                       └─────────┘
//!
//!   any state ── pump EOF / read error / failed upgrade ──→ Broken
//!   any state ── close() ──→ Closed (terminal)
//! ```
//!
//! Line framing starts when the read pump starts: at `Connected` for
//! [`Security::Plain`], otherwise at `Secured`.
//!
//! ## Example
//!
//! ```ignore
//! use mailwire::{Config, Connection};
//! use regex::Regex;
//!
//! let mut conn = Connection::new(Config::new("imap.example.com", 993));
//! conn.connect().await?;
//! conn.upgrade_to_secure().await?;
//!
//! let greeting = conn.receive_line().await?;
//! conn.send("A1 CAPABILITY\r\n").await;
//! let reply = conn.receive_until(&Regex::new("^A1 ")?).await?;
//!
//! conn.close().await;
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::{ChannelReader, ChannelWriter, SecureChannel};
use crate::config::{Config, Security};
use crate::error::CloseReason;
use crate::pump::ReadPump;
use crate::queue::LineQueue;
use crate::receiver::{LineReceiver, Terminator};
use crate::tls::TlsInfo;
use crate::{Error, Result};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Unconnected,
    /// TCP connected, not encrypted.
    Connected,
    /// TLS established.
    Secured,
    /// The peer closed, a read failed, or the TLS upgrade failed.
    Broken,
    /// Closed locally. Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns true if sending is allowed.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Connected | Self::Secured)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unconnected => "unconnected",
            Self::Connected => "connected",
            Self::Secured => "secured",
            Self::Broken => "broken",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// The channel, either whole or split between the caller and the pump.
enum Link {
    /// Connected, no pump yet.
    Idle(SecureChannel),
    /// The pump owns the read half.
    Pumping {
        writer: ChannelWriter,
        pump: ReadPump<ChannelReader>,
    },
}

impl Link {
    /// Stops the pump, if any, then shuts down TLS and the socket.
    async fn shut_down(self) {
        match self {
            Self::Pumping { mut writer, pump } => match pump.stop().await {
                Some(exit) => match exit.reader.unsplit(writer) {
                    Ok(mut channel) => channel.close().await,
                    Err(e) => warn!(error = %e, "Could not rejoin channel halves"),
                },
                None => writer.shutdown().await,
            },
            Self::Idle(mut channel) => channel.close().await,
        }
    }
}

/// A line-oriented connection to a mail server.
///
/// Writes go straight to the channel from the caller. Reads are done by a
/// background pump that queues complete lines; [`receive_line`](Self::receive_line)
/// and [`receive_until`](Self::receive_until) take from that queue.
///
/// Sends are not serialized internally; use one sender at a time.
pub struct Connection {
    config: Config,
    state: ConnectionState,
    link: Option<Link>,
    queue: Arc<LineQueue>,
    tls: Option<TlsInfo>,
}

impl Connection {
    /// Creates an unconnected connection.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: ConnectionState::Unconnected,
            link: None,
            queue: Arc::new(LineQueue::new()),
            tls: None,
        }
    }

    /// Creates a connection and connects it.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub async fn open(config: Config) -> Result<Self> {
        let mut conn = Self::new(config);
        conn.connect().await?;
        Ok(conn)
    }

    /// Resolves the host and opens the TCP connection.
    ///
    /// With [`Security::Plain`] the read pump starts here. With
    /// [`Security::Implicit`] the TLS handshake runs here too.
    ///
    /// # Errors
    ///
    /// Returns `Resolution`, `Connect` or `Timeout` if the connection cannot
    /// be opened (the state stays `Unconnected`), `InvalidState` if already
    /// connected, and for `Implicit` any error of
    /// [`upgrade_to_secure`](Self::upgrade_to_secure).
    pub async fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Unconnected {
            return Err(Error::InvalidState(format!("cannot connect when {state}")));
        }

        let channel = SecureChannel::connect(&self.config).await?;
        self.state = ConnectionState::Connected;

        if self.config.security.frames_plaintext() {
            return self.start_pump(channel);
        }
        self.link = Some(Link::Idle(channel));
        if self.config.security == Security::Implicit {
            self.upgrade_to_secure().await?;
        }
        Ok(())
    }

    /// Negotiates TLS over the open connection and starts line framing.
    ///
    /// If a plaintext pump is running (STARTTLS), it is stopped first and
    /// any plaintext received but not yet read is discarded.
    ///
    /// # Errors
    ///
    /// Returns `Handshake`, `NoPeerCertificate` or `Timeout` if the upgrade
    /// fails; the connection is then `Broken` and its socket released.
    /// Returns `InvalidState` unless the connection is `Connected`.
    pub async fn upgrade_to_secure(&mut self) -> Result<&TlsInfo> {
        self.release_if_broken().await;
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(Error::InvalidState(format!("cannot upgrade when {state}")));
        }

        let mut channel = match self.link.take() {
            Some(Link::Idle(channel)) => channel,
            Some(Link::Pumping { writer, pump }) => self.reclaim(writer, pump).await?,
            None => return Err(Error::InvalidState("no channel to upgrade".into())),
        };

        match channel.upgrade_to_secure(&self.config).await.cloned() {
            Ok(info) => self.tls = Some(info),
            Err(e) => {
                warn!(host = %self.config.host, error = %e, "TLS upgrade failed");
                channel.close().await;
                self.state = ConnectionState::Broken;
                self.queue.close(CloseReason::HandshakeFailed(e.to_string()));
                return Err(e);
            }
        }

        self.state = ConnectionState::Secured;
        self.start_pump(channel)?;
        self.tls
            .as_ref()
            .ok_or_else(|| Error::InvalidState("TLS session missing after upgrade".into()))
    }

    /// Sends `text`, returning false if the write fails or the connection
    /// is not open. The state is left unchanged either way.
    pub async fn send(&mut self, text: &str) -> bool {
        match self.try_send(text).await {
            Ok(()) => true,
            Err(e) => {
                warn!(host = %self.config.host, error = %e, "Send failed");
                false
            }
        }
    }

    /// Sends `text`.
    ///
    /// # Errors
    ///
    /// Returns `Write` if the write fails, `InvalidState` if not open.
    pub async fn try_send(&mut self, text: &str) -> Result<()> {
        self.send_bytes(text.as_bytes()).await
    }

    /// Sends raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `Write` if the write fails, `InvalidState` if not open.
    pub async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.release_if_broken().await;
        let state = self.state();
        if !state.is_open() {
            return Err(Error::InvalidState(format!("cannot send when {state}")));
        }
        match &mut self.link {
            Some(Link::Idle(channel)) => channel.write_bytes(data).await,
            Some(Link::Pumping { writer, .. }) => writer.write_bytes(data).await,
            None => Err(Error::InvalidState("no channel".into())),
        }
    }

    /// Waits for the next line and returns it with CRLF re-appended.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the connection is broken or closed and
    /// every queued line has been read, `Timeout` if the configured receive
    /// timeout elapses, and `InvalidState` if line framing has not started.
    pub async fn receive_line(&self) -> Result<String> {
        self.ensure_framing()?;
        self.lines().receive_line().await
    }

    /// Returns the next line if one is already queued.
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the connection is gone and drained.
    pub fn try_receive_line(&self) -> Result<Option<String>> {
        self.lines().try_receive_line()
    }

    /// Reads lines until one matches `terminator` and returns them all,
    /// CRLF included. Later lines stay queued.
    ///
    /// # Errors
    ///
    /// As for [`receive_line`](Self::receive_line).
    pub async fn receive_until<T>(&self, terminator: &T) -> Result<String>
    where
        T: Terminator + ?Sized,
    {
        self.ensure_framing()?;
        self.lines().receive_until(terminator).await
    }

    /// Returns a handle other tasks can use to wait for lines.
    #[must_use]
    pub fn lines(&self) -> LineReceiver {
        LineReceiver::new(Arc::clone(&self.queue), self.config.receive_timeout)
    }

    /// Closes the connection.
    ///
    /// Waiting consumers are woken with `QueueClosed`, the read pump is
    /// stopped and joined, then the TLS session and socket are shut down.
    /// Calling this again is a no-op.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        self.queue.close(CloseReason::Closed);

        if let Some(link) = self.link.take() {
            link.shut_down().await;
        }

        info!(host = %self.config.host, port = self.config.port, "Connection closed");
    }

    /// Returns the current state.
    ///
    /// A connection becomes `Broken` as soon as the pump sees end of stream
    /// or a read error. Its socket is released by the next send or upgrade
    /// attempt, by [`close`](Self::close), or on drop.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.state == ConnectionState::Closed {
            return ConnectionState::Closed;
        }
        match self.queue.close_reason() {
            Some(reason) if reason.is_broken() => ConnectionState::Broken,
            _ => self.state,
        }
    }

    /// Returns true if the connection is `Secured`.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.state() == ConnectionState::Secured
    }

    /// Returns the negotiated TLS session, if one was established.
    #[must_use]
    pub const fn tls_info(&self) -> Option<&TlsInfo> {
        self.tls.as_ref()
    }

    /// Returns the configured host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Returns the configured port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.config.port
    }

    /// Returns the connected socket address, while a channel is held.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.link {
            Some(Link::Idle(channel)) => Some(channel.peer_addr()),
            Some(Link::Pumping { writer, .. }) => Some(writer.peer_addr()),
            None => None,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of lines waiting to be read.
    #[must_use]
    pub fn pending_lines(&self) -> usize {
        self.queue.len()
    }

    fn start_pump(&mut self, channel: SecureChannel) -> Result<()> {
        let (reader, writer) = channel.into_split()?;
        let pump = ReadPump::spawn(reader, Arc::clone(&self.queue), self.config.read_buffer_size);
        debug!(host = %self.config.host, state = %self.state, "Read pump running");
        self.link = Some(Link::Pumping { writer, pump });
        Ok(())
    }

    /// Stops the plaintext pump and rejoins the channel for a TLS upgrade.
    async fn reclaim(
        &mut self,
        mut writer: ChannelWriter,
        pump: ReadPump<ChannelReader>,
    ) -> Result<SecureChannel> {
        let Some(exit) = pump.stop().await else {
            writer.shutdown().await;
            self.state = ConnectionState::Broken;
            let reason = "read pump task failed".to_string();
            self.queue.close(CloseReason::ReadFailed(reason.clone()));
            return Err(Error::InvalidState(reason));
        };

        if !exit.framer.is_empty() {
            warn!(
                bytes = exit.framer.residual_len(),
                "Discarding buffered plaintext before TLS upgrade"
            );
        }
        let dropped = self.queue.clear();
        if dropped > 0 {
            warn!(lines = dropped, "Discarding unread plaintext lines before TLS upgrade");
        }

        exit.reader.unsplit(writer)
    }

    /// Releases the socket once the pump has found the connection broken.
    async fn release_if_broken(&mut self) {
        if self.state() != ConnectionState::Broken {
            return;
        }
        self.state = ConnectionState::Broken;
        if let Some(link) = self.link.take() {
            link.shut_down().await;
            debug!(host = %self.config.host, "Released socket of broken connection");
        }
    }

    fn ensure_framing(&self) -> Result<()> {
        let framing = matches!(self.link, Some(Link::Pumping { .. }));
        if !framing && self.queue.close_reason().is_none() && self.queue.is_empty() {
            return Err(Error::InvalidState(format!(
                "no lines are read when {}",
                self.state()
            )));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(host = %self.config.host, "Connection dropped without close");
            self.queue.close(CloseReason::Closed);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state())
            .field("pending_lines", &self.pending_lines())
            .finish_non_exhaustive()
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

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Unconnected.to_string(), "unconnected");
        assert_eq!(ConnectionState::Secured.to_string(), "secured");
        assert_eq!(ConnectionState::Broken.to_string(), "broken");
    }

    #[test]
    fn test_open_states() {
        assert!(ConnectionState::Connected.is_open());
        assert!(ConnectionState::Secured.is_open());
        assert!(!ConnectionState::Unconnected.is_open());
        assert!(!ConnectionState::Broken.is_open());
        assert!(!ConnectionState::Closed.is_open());
    }

    #[tokio::test]
    async fn test_unconnected_operations() {
        let mut conn = Connection::new(Config::new("imap.example.com", 993));
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        assert!(conn.peer_addr().is_none());

        assert!(!conn.send("A1 NOOP\r\n").await);
        assert_eq!(conn.state(), ConnectionState::Unconnected);

        assert!(matches!(
            conn.receive_line().await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            conn.upgrade_to_secure().await,
            Err(Error::InvalidState(_))
        ));
        assert_eq!(conn.try_receive_line().unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_unconnected_is_terminal() {
        let mut conn = Connection::new(Config::new("imap.example.com", 993));
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        assert!(matches!(conn.connect().await, Err(Error::InvalidState(_))));
        assert!(matches!(
            conn.receive_line().await,
            Err(Error::QueueClosed(CloseReason::Closed))
        ));
    }
}
