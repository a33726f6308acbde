//! Connection layer.
//!
//! - `connection`: link ids, stream types, schemas and flags
//! - `handler`: the per-socket state machine and write path
//! - `context`: per-worker registry and collaborators
//! - `manager`: id-keyed registry with type-scoped round robin
//! - `listener`: accepting sockets
//! - `uri`: `scheme://host[:port][/path]` parsing
//! - `http`: response framing for HTTP links

pub mod connection;
pub mod context;
pub mod handler;
pub mod http;
pub mod listener;
pub mod manager;
pub mod uri;

pub use connection::{ConnFlags, Connection, LinkId, Schema, StreamType};
pub use context::{ConnRef, NetContext};
pub use handler::{Callbacks, ConnectionHandler, HandlerState, Link};
pub use http::{HttpResponder, PlainResponder};
pub use listener::{listen, CallbackFactory, Listening};
pub use manager::ConnectionManager;
pub use uri::Uri;
