//! Single-threaded event runtime.
//!
//! Each thread that does I/O owns exactly one [`Reactor`]. Everything
//! registered with it is driven from that thread only:
//!
//! - `reactor`: readiness dispatch over mio plus named timers
//! - `token`: generation-tagged handle allocation
//! - `timer`: one-shot and persistent timer bookkeeping
//! - `buffer`: fixed-capacity scratch buffers
//! - `stream`: transports and watermark-bounded buffered streams
//! - `channel`: the typed envelope pipe between threads
//! - `tls`: the TLS capability supplied from outside

pub mod buffer;
pub mod channel;
pub mod reactor;
pub mod stream;
pub mod timer;
pub mod tls;
pub mod token;

pub use buffer::ScratchBuffer;
pub use channel::{
    envelope_fn, Channel, ChannelHandler, ChannelSender, Endpoint, Envelope, Side, Tag,
};
pub use reactor::{EventHandler, Reactor, DEFAULT_WATERMARK_MULTIPLE, MAX_FRAME_SIZE};
pub use stream::{BufferedStream, StreamWriter, Transport};
pub use tls::{SecureStream, TlsContext, TlsRole};
pub use token::EventHandle;
