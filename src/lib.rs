//! gatehouse: the network-facing core of a multi-worker service.
//!
//! A main thread supervises a fixed pool of worker threads. Every thread
//! runs its own single-threaded [`runtime::Reactor`]; the only path between
//! threads is a [`runtime::Channel`] carrying tagged envelopes.
//!
//! Workers terminate client protocols on [`net::ConnectionHandler`]s:
//! - raw TCP, UDP and Unix streams, delivered as coalesced byte runs
//! - WebSocket, with handshake, fragment reassembly and control frames
//! - HAProxy PROXY protocol v1/v2 in front of any of the above
//!
//! and use the codecs in [`protocols`] to turn bytes into messages.

pub mod config;
pub mod error;
pub mod gateway;
pub mod net;
pub mod protocols;
pub mod runtime;
pub mod worker;

pub use error::{CodecError, Error, Result};
