//! WebSocket (RFC 6455) layered on a byte stream.
//!
//! - `handshake`: HTTP/1.1 upgrade request and response
//! - `frame`: frame header parsing, masking and encoding
//! - `session`: per-connection state machine with fragment reassembly

pub mod frame;
pub mod handshake;
pub mod session;

pub use frame::OpCode;
pub use session::{WsEvent, WsSession, WsStatus};
