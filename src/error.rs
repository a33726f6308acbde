//! Error types for gatehouse.
//!
//! Decoders report fatal problems through [`CodecError`]; everything above the
//! codecs funnels into [`Error`].

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal outcome of a decode or encode step.
///
/// "Need more bytes" is not an error; see [`crate::protocols::Decode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Header fields are inconsistent with each other or with the buffer.
    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// Declared or encoded size reaches the watermark.
    #[error("{what} of {size} bytes exceeds limit of {limit}")]
    Overflow {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    /// Input is not the protocol it was sniffed for.
    #[error("not a {0} header")]
    Unrecognized(&'static str),
}

impl CodecError {
    pub(crate) fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        CodecError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

/// Unified error type for gatehouse operations.
#[derive(Debug, Error)]
pub enum Error {
    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("connect to {uri} failed: {reason}")]
    Connect { uri: String, reason: String },

    // -------------------------------------------------------------------------
    // Framing
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("TLS: {0}")]
    Tls(String),

    // -------------------------------------------------------------------------
    // Threads and channels
    // -------------------------------------------------------------------------
    #[error("channel: {0}")]
    Channel(String),

    #[error("worker: {0}")]
    Worker(String),

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Closed => std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "closed"),
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
