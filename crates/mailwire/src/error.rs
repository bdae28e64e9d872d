//! Error types for the transport.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Why the line queue stopped accepting lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the stream.
    EndOfStream,
    /// The read pump hit a read error.
    ReadFailed(String),
    /// The TLS upgrade failed and the socket was released.
    HandshakeFailed(String),
    /// The connection was closed locally.
    Closed,
}

impl CloseReason {
    /// Returns true if the queue closed because the connection broke,
    /// rather than because it was closed locally.
    #[must_use]
    pub const fn is_broken(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfStream => f.write_str("end of stream"),
            Self::ReadFailed(msg) => write!(f, "read failed: {msg}"),
            Self::HandshakeFailed(msg) => write!(f, "TLS upgrade failed: {msg}"),
            Self::Closed => f.write_str("connection closed"),
        }
    }
}

/// Errors that can occur on a mail transport connection.
#[derive(Debug, Error)]
pub enum Error {
    /// Host name resolution failed or produced no addresses.
    #[error("Failed to resolve {host}: {source}")]
    Resolution {
        /// Host that was looked up.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },

    /// TCP connect failed for every resolved address.
    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
        /// Error from the last attempted address.
        #[source]
        source: io::Error,
    },

    /// TLS handshake could not complete.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Handshake completed but the peer presented no certificate.
    #[error("Peer presented no certificate")]
    NoPeerCertificate,

    /// Writing to the channel failed.
    #[error("Write failed: {0}")]
    Write(#[source] io::Error),

    /// Reading from the channel failed.
    #[error("Read failed: {0}")]
    Read(#[source] io::Error),

    /// The line queue closed while (or before) a consumer was waiting.
    #[error("Line queue closed: {0}")]
    QueueClosed(CloseReason),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<rustls::pki_types::InvalidDnsNameError> for Error {
    fn from(err: rustls::pki_types::InvalidDnsNameError) -> Self {
        Self::Handshake(format!("invalid server name: {err}"))
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Self::Handshake(err.to_string())
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_broken() {
        assert!(CloseReason::EndOfStream.is_broken());
        assert!(CloseReason::ReadFailed("reset".into()).is_broken());
        assert!(CloseReason::HandshakeFailed("bad record".into()).is_broken());
        assert!(!CloseReason::Closed.is_broken());
    }

    #[test]
    fn test_error_display() {
        let err = Error::QueueClosed(CloseReason::EndOfStream);
        assert_eq!(err.to_string(), "Line queue closed: end of stream");

        let err = Error::Connect {
            host: "mail.example.com".into(),
            port: 993,
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("Failed to connect to mail.example.com:993"));
    }
}
