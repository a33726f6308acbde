//! Passive record of one duplex byte-stream endpoint.
//!
//! A [`Connection`] only describes the endpoint: who the peer is, which wire
//! protocol it speaks and which flags are set. The socket and buffers belong
//! to the owning [`ConnectionHandler`](super::ConnectionHandler).

use crate::runtime::token::EventHandle;
use std::fmt;
use std::net::SocketAddr;

/// 64-bit link id: `src << 32 | dst`.
///
/// Accepted sockets use `(0, fd)`. Links created from this side use
/// `(src, 0)` where the top 16 bits of `src` carry the server type and the
/// low 16 bits a per-worker sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl LinkId {
    pub fn new(src: u32, dst: u32) -> Self {
        LinkId((src as u64) << 32 | dst as u64)
    }

    /// Id of an accepted socket.
    pub fn passive(fd: u32) -> Self {
        Self::new(0, fd)
    }

    /// Id of an internally created link.
    pub fn internal(server_type: u16, seq: u16) -> Self {
        Self::new((server_type as u32) << 16 | seq as u32, 0)
    }

    pub fn src(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn dst(self) -> u32 {
        self.0 as u32
    }

    /// Server type encoded in the id; 0 for accepted sockets.
    pub fn server_type(self) -> u16 {
        (self.src() >> 16) as u16
    }

    pub fn is_passive(self) -> bool {
        self.src() == 0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.src(), self.dst())
    }
}

/// Wire protocol family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Raw,
    HaProxy,
    Ws,
    Wss,
    Http,
    Https,
    Tcp,
    Udp,
    Unix,
}

impl StreamType {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        let kind = match scheme.to_ascii_lowercase().as_str() {
            "raw" => StreamType::Raw,
            "haproxy" => StreamType::HaProxy,
            "ws" => StreamType::Ws,
            "wss" => StreamType::Wss,
            "http" => StreamType::Http,
            "https" => StreamType::Https,
            "tcp" => StreamType::Tcp,
            "udp" => StreamType::Udp,
            "unix" => StreamType::Unix,
            _ => return None,
        };
        Some(kind)
    }

    pub fn scheme(self) -> &'static str {
        match self {
            StreamType::Raw => "raw",
            StreamType::HaProxy => "haproxy",
            StreamType::Ws => "ws",
            StreamType::Wss => "wss",
            StreamType::Http => "http",
            StreamType::Https => "https",
            StreamType::Tcp => "tcp",
            StreamType::Udp => "udp",
            StreamType::Unix => "unix",
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            StreamType::Ws | StreamType::Http => Some(80),
            StreamType::Wss | StreamType::Https => Some(443),
            _ => None,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, StreamType::Ws | StreamType::Wss)
    }

    pub fn is_http(self) -> bool {
        matches!(self, StreamType::Http | StreamType::Https)
    }

    /// Carried over TLS.
    pub fn is_secure(self) -> bool {
        matches!(self, StreamType::Wss | StreamType::Https)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// URI scheme of a connection, possibly `proxy->real`.
///
/// `haproxy->ws` means: expect a PROXY header first, then speak WebSocket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    outer: StreamType,
    inner: Option<StreamType>,
}

impl Schema {
    pub fn new(kind: StreamType) -> Self {
        Self {
            outer: kind,
            inner: None,
        }
    }

    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.split_once("->") {
            Some((outer, inner)) => Some(Self {
                outer: StreamType::from_scheme(outer.trim())?,
                inner: Some(StreamType::from_scheme(inner.trim())?),
            }),
            None => Some(Self::new(StreamType::from_scheme(scheme.trim())?)),
        }
    }

    /// Protocol spoken on the wire right now.
    pub fn stream_type(&self) -> StreamType {
        self.outer
    }

    /// Protocol behind the proxy header, if any.
    pub fn inner(&self) -> Option<StreamType> {
        self.inner
    }

    /// Drop the proxy layer after its header was consumed.
    ///
    /// A bare `haproxy` schema becomes `raw`.
    pub fn unwrap_proxy(&mut self) -> StreamType {
        self.outer = self.inner.take().unwrap_or(StreamType::Raw);
        self.outer
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Some(inner) => write!(f, "{}->{}", self.outer, inner),
            None => write!(f, "{}", self.outer),
        }
    }
}

/// Small flag set carried by a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnFlags(u8);

impl ConnFlags {
    /// Close once the current callback returns.
    pub const CLOSING: ConnFlags = ConnFlags(0x01);
    /// No traffic since the last heartbeat tick.
    pub const HEARTBEAT_LOST: ConnFlags = ConnFlags(0x02);

    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }
}

/// One endpoint: identity, peer, protocol and flags.
#[derive(Debug, Clone)]
pub struct Connection {
    id: LinkId,
    peer: Option<SocketAddr>,
    schema: Schema,
    flags: ConnFlags,
    /// Registration of the owning handler.
    owner: Option<EventHandle>,
}

impl Connection {
    pub fn new(id: LinkId, schema: Schema, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            schema,
            flags: ConnFlags::default(),
            owner: None,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Replace the peer address, e.g. with the one a proxy announced.
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }

    pub fn stream_type(&self) -> StreamType {
        self.schema.stream_type()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    pub fn flags(&self) -> ConnFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut ConnFlags {
        &mut self.flags
    }

    pub fn is_closing(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSING)
    }

    pub fn owner(&self) -> Option<EventHandle> {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: EventHandle) {
        self.owner = Some(owner);
    }
}
