//! Process-wide TLS client state and session diagnostics.
//!
//! Client configurations are built once per verification mode and shared by
//! every connection in the process. They are never torn down explicitly;
//! they live until the process exits.

use std::fmt;
use std::sync::{Arc, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::CertificateVerification;
use crate::error::Error;

static PERMISSIVE: OnceLock<Arc<ClientConfig>> = OnceLock::new();
static STRICT: OnceLock<Arc<ClientConfig>> = OnceLock::new();

/// Returns the shared client configuration for a verification mode.
///
/// The first call per mode builds it; later calls return the same `Arc`.
///
/// # Errors
///
/// Returns [`Error::Handshake`] if the crypto provider rejects the default
/// protocol versions.
pub fn client_config(verification: CertificateVerification) -> crate::Result<Arc<ClientConfig>> {
    let cell = match verification {
        CertificateVerification::AcceptAny => &PERMISSIVE,
        CertificateVerification::Strict => &STRICT,
    };
    if let Some(config) = cell.get() {
        return Ok(Arc::clone(config));
    }

    let config = Arc::new(build_client_config(verification)?);
    // A racing initializer may have won; either value is equivalent.
    let _ = cell.set(Arc::clone(&config));
    Ok(cell.get().map_or(config, Arc::clone))
}

/// Creates a TLS connector for a verification mode.
///
/// # Errors
///
/// See [`client_config`].
pub fn create_tls_connector(verification: CertificateVerification) -> crate::Result<TlsConnector> {
    Ok(TlsConnector::from(client_config(verification)?))
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn build_client_config(verification: CertificateVerification) -> crate::Result<ClientConfig> {
    let provider = crypto_provider();
    let builder =
        ClientConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions()?;

    let config = match verification {
        CertificateVerification::AcceptAny => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
            .with_no_client_auth(),
        CertificateVerification::Strict => {
            let root_store = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    };
    debug!(?verification, "Built TLS client configuration");
    Ok(config)
}

/// Accepts any server certificate chain and name, but still checks that
/// the handshake was signed by the presented certificate's key.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// The server's end-entity certificate.
#[derive(Clone)]
pub struct PeerCertificate {
    /// Subject distinguished name, if the certificate could be parsed.
    pub subject: Option<String>,
    /// Issuer distinguished name, if the certificate could be parsed.
    pub issuer: Option<String>,
    /// Raw DER encoding.
    pub der: CertificateDer<'static>,
}

impl PeerCertificate {
    /// Parses subject and issuer out of a DER certificate.
    #[must_use]
    pub fn from_der(der: CertificateDer<'static>) -> Self {
        let (subject, issuer) = match x509_parser::parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => (
                Some(cert.subject().to_string()),
                Some(cert.issuer().to_string()),
            ),
            Err(e) => {
                debug!(error = %e, "Could not parse peer certificate");
                (None, None)
            }
        };
        Self {
            subject,
            issuer,
            der,
        }
    }
}

impl fmt::Debug for PeerCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerCertificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Details of a negotiated TLS session.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub protocol_version: Option<String>,
    /// Negotiated cipher suite, e.g. `TLS13_AES_256_GCM_SHA384`.
    pub cipher_suite: Option<String>,
    /// The server's end-entity certificate.
    pub peer: PeerCertificate,
}

impl TlsInfo {
    /// Collects session details from a completed handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoPeerCertificate`] if the server sent no certificate.
    pub fn from_connection(conn: &ClientConnection) -> crate::Result<Self> {
        let peer = require_peer_certificate(conn.peer_certificates())?;
        Ok(Self {
            protocol_version: conn.protocol_version().map(|v| format!("{v:?}")),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            peer,
        })
    }
}

/// Picks the end-entity certificate out of a presented chain.
fn require_peer_certificate(
    chain: Option<&[CertificateDer<'static>]>,
) -> crate::Result<PeerCertificate> {
    chain
        .and_then(<[_]>::first)
        .map(|der| PeerCertificate::from_der(der.clone()))
        .ok_or(Error::NoPeerCertificate)
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
    fn test_create_tls_connector() {
        assert!(create_tls_connector(CertificateVerification::AcceptAny).is_ok());
        assert!(create_tls_connector(CertificateVerification::Strict).is_ok());
    }

    #[test]
    fn test_client_config_is_shared() {
        let first = client_config(CertificateVerification::Strict).unwrap();
        let second = client_config(CertificateVerification::Strict).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let permissive = client_config(CertificateVerification::AcceptAny).unwrap();
        assert!(!Arc::ptr_eq(&first, &permissive));
    }

    #[test]
    fn test_missing_certificate_is_an_error() {
        assert!(matches!(
            require_peer_certificate(None),
            Err(Error::NoPeerCertificate)
        ));
        assert!(matches!(
            require_peer_certificate(Some(&[][..])),
            Err(Error::NoPeerCertificate)
        ));
    }

    #[test]
    fn test_unparseable_certificate_keeps_der() {
        let chain = [CertificateDer::from(vec![0x30, 0x03, 0x02, 0x01, 0x00])];
        let peer = require_peer_certificate(Some(&chain[..])).unwrap();
        assert!(peer.subject.is_none());
        assert!(peer.issuer.is_none());
        assert_eq!(peer.der.as_ref(), &[0x30, 0x03, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_first_certificate_is_end_entity() {
        let chain = [
            CertificateDer::from(vec![1u8]),
            CertificateDer::from(vec![2u8]),
        ];
        let peer = require_peer_certificate(Some(&chain[..])).unwrap();
        assert_eq!(peer.der.as_ref(), &[1u8]);
    }
}
