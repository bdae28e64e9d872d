//! Connection configuration types.

use std::time::Duration;

/// Smallest read buffer the channel will use.
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// When the connection becomes encrypted, and so when line framing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plaintext only. The read pump starts as soon as TCP connects.
    /// **Not recommended for production.**
    Plain,
    /// Connect in plaintext and wait for an explicit
    /// [`upgrade_to_secure`](crate::Connection::upgrade_to_secure).
    /// The read pump starts once the channel is secured.
    #[default]
    StartTls,
    /// Perform the TLS handshake as part of `connect`.
    Implicit,
}

impl Security {
    /// Returns true if lines are framed before the channel is encrypted.
    #[must_use]
    pub const fn frames_plaintext(self) -> bool {
        matches!(self, Self::Plain)
    }
}

/// How the server certificate is checked during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertificateVerification {
    /// Accept any certificate the peer presents, as long as it presents one.
    /// Handshake signatures are still checked, but neither the chain nor
    /// the host name is. **Insecure.**
    #[default]
    AcceptAny,
    /// Verify the chain against the Mozilla root set and match the host name.
    Strict,
}

/// Transport connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Certificate verification policy.
    pub verification: CertificateVerification,
    /// Bound on resolution plus TCP connect. `None` blocks indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Bound on the TLS handshake. `None` blocks indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// Bound on each wait for a line. `None` blocks indefinitely.
    pub receive_timeout: Option<Duration>,
    /// Size of a single channel read. Values below
    /// [`MIN_READ_BUFFER_SIZE`] are raised to it when the channel opens.
    pub read_buffer_size: usize,
}

impl Config {
    /// Creates a configuration with no timeouts, `StartTls` security and
    /// permissive certificate checking.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: Security::default(),
            verification: CertificateVerification::default(),
            connect_timeout: None,
            handshake_timeout: None,
            receive_timeout: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>, port: u16) -> ConfigBuilder {
        ConfigBuilder::new(host, port)
    }
}

/// Builder for connection configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new builder for the given endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            config: Config::new(host, port),
        }
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.config.security = security;
        self
    }

    /// Sets the certificate verification policy.
    #[must_use]
    pub const fn verification(mut self, verification: CertificateVerification) -> Self {
        self.config.verification = verification;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Sets the handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = Some(timeout);
        self
    }

    /// Sets the per-line receive timeout.
    #[must_use]
    pub const fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = Some(timeout);
        self
    }

    /// Sets the read buffer size, clamped to [`MIN_READ_BUFFER_SIZE`].
    #[must_use]
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(MIN_READ_BUFFER_SIZE);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
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
    fn test_config_new() {
        let config = Config::new("imap.example.com", 993);
        assert_eq!(config.host, "imap.example.com");
        assert_eq!(config.port, 993);
        assert_eq!(config.security, Security::StartTls);
        assert_eq!(config.verification, CertificateVerification::AcceptAny);
        assert!(config.connect_timeout.is_none());
        assert!(config.receive_timeout.is_none());
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder("smtp.example.com", 465)
            .security(Security::Implicit)
            .verification(CertificateVerification::Strict)
            .connect_timeout(Duration::from_secs(10))
            .handshake_timeout(Duration::from_secs(5))
            .receive_timeout(Duration::from_secs(30))
            .build();

        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 465);
        assert_eq!(config.security, Security::Implicit);
        assert_eq!(config.verification, CertificateVerification::Strict);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.receive_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_read_buffer_size_floor() {
        let config = Config::builder("pop.example.com", 995)
            .read_buffer_size(16)
            .build();
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = Config::builder("pop.example.com", 995)
            .read_buffer_size(16 * 1024)
            .build();
        assert_eq!(config.read_buffer_size, 16 * 1024);
    }

    #[test]
    fn test_plaintext_framing() {
        assert!(Security::Plain.frames_plaintext());
        assert!(!Security::StartTls.frames_plaintext());
        assert!(!Security::Implicit.frames_plaintext());
    }
}
