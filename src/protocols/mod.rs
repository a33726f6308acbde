//! Wire codecs.
//!
//! Every decoder here is pure: it looks at a byte slice and reports one of
//! three outcomes.
//!
//! - `Ok(Decode::Complete { value, consumed })`: one message, `consumed`
//!   bytes long, was found at the front of the slice
//! - `Ok(Decode::Incomplete)`: more bytes are needed; nothing was consumed
//! - `Err(CodecError)`: the bytes can never become a valid message
//!
//! ## Codecs
//! - `external`: client application header (big endian)
//! - `internal`: intra-process routing header (host order)
//! - `proxy`: HAProxy PROXY protocol v1/v2
//! - `rpc`: flag + length prefixed RPC framing
//! - `websocket`: RFC 6455 handshake and frames

pub mod cursor;
pub mod external;
pub mod internal;
pub mod proxy;
pub mod rpc;
pub mod websocket;

use crate::error::CodecError;

/// Successful decode outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode<T> {
    /// A complete value occupying the first `consumed` bytes.
    Complete { value: T, consumed: usize },
    /// Need more data.
    Incomplete,
}

impl<T> Decode<T> {
    /// Apply `f` to a complete value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Decode<U> {
        match self {
            Decode::Complete { value, consumed } => Decode::Complete {
                value: f(value),
                consumed,
            },
            Decode::Incomplete => Decode::Incomplete,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Decode::Complete { .. })
    }
}

/// Result of a decode step.
pub type DecodeResult<T> = Result<Decode<T>, CodecError>;
