//! # mailwire
//!
//! CRLF line transport for text mail protocols (IMAP, POP3, SMTP) over TCP,
//! with in-place TLS upgrade.
//!
//! ## Features
//!
//! - **Line framing**: CRLF-delimited lines, independent of how the bytes
//!   were chunked on the wire
//! - **Background read pump**: one task per connection drains the socket
//!   into an ordered queue; consumers wait without polling
//! - **TLS via rustls**: implicit TLS or STARTTLS-style upgrade, with
//!   session and certificate details for display
//! - **Multi-line replies**: read until a caller-supplied terminator such as
//!   a tagged status line
//! - **Orderly teardown**: the pump is stopped and joined before the TLS
//!   session and socket are released
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailwire::{CertificateVerification, Config, Connection, Security};
//! use regex::Regex;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> mailwire::Result<()> {
//!     let config = Config::builder("imap.example.com", 993)
//!         .security(Security::Implicit)
//!         .verification(CertificateVerification::Strict)
//!         .receive_timeout(Duration::from_secs(60))
//!         .build();
//!
//!     let mut conn = Connection::open(config).await?;
//!     if let Some(tls) = conn.tls_info() {
//!         println!("Connected with {:?}", tls.cipher_suite);
//!     }
//!
//!     let greeting = conn.receive_line().await?;
//!     print!("{greeting}");
//!
//!     conn.send("A1 LOGIN user pass\r\n").await;
//!     let tagged = Regex::new("^A1 (OK|NO|BAD)").unwrap();
//!     let reply = conn.receive_until(&tagged).await?;
//!     print!("{reply}");
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Certificate verification
//!
//! The default, [`CertificateVerification::AcceptAny`], accepts any
//! certificate the server presents and does not check the host name. It
//! only insists that a certificate is presented. Use
//! [`CertificateVerification::Strict`] for chain and host name checks.
//!
//! ## Modules
//!
//! - [`channel`]: TCP/TLS byte channel
//! - [`connection`]: Connection facade and state machine
//! - [`framer`]: Sans-I/O CRLF line framer
//! - [`pump`]: Background read pump
//! - [`queue`]: Line queue shared by the pump and consumers
//! - [`tls`]: Shared TLS client configuration and session details

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod channel;
mod config;
pub mod connection;
mod error;
pub mod framer;
pub mod pump;
pub mod queue;
mod receiver;
pub mod tls;

pub use channel::{Chunk, SecureChannel, Transport};
pub use config::{
    CertificateVerification, Config, ConfigBuilder, DEFAULT_READ_BUFFER_SIZE,
    MIN_READ_BUFFER_SIZE, Security,
};
pub use connection::{Connection, ConnectionState};
pub use error::{CloseReason, Error, Result};
pub use framer::LineFramer;
pub use queue::LineQueue;
pub use receiver::{LineReceiver, Terminator};
pub use tls::{PeerCertificate, TlsInfo};
