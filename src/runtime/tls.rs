//! TLS capability consumed by the core.
//!
//! Certificate handling and session creation live outside this crate. The
//! core only needs to load a certificate/key pair into a context and to turn
//! a plain transport into a plaintext view over a TLS session.

use super::stream::Transport;
use crate::error::Result;
use mio::event::Source;
use std::io::{Read, Write};
use std::path::Path;

/// Plaintext byte stream backed by an encrypted transport.
///
/// Reads and writes follow non-blocking socket conventions: `WouldBlock`
/// means "try again on the next readiness event".
pub trait SecureStream: Read + Write + Source {}

impl<T: Read + Write + Source> SecureStream for T {}

/// Which side of the handshake a session performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsRole {
    /// Dial out, verifying the peer against `server_name`.
    Client { server_name: String },
    /// Accept, presenting a loaded certificate.
    Server,
}

/// Trust context able to create TLS sessions.
pub trait TlsContext {
    /// Load a certificate chain and private key, served for `server_name`.
    fn load_cert_key(
        &mut self,
        server_name: &str,
        certificate: &Path,
        private_key: &Path,
    ) -> Result<()>;

    /// Create one session over `transport`.
    fn create_session(&self, transport: Transport, role: TlsRole) -> Result<Box<dyn SecureStream>>;
}
