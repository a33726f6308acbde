//! Active side of a connection: socket events, protocol sniffing, framing.
//!
//! State machine:
//!
//! ```text
//! accept ──────────────────────────┐
//!                                  ▼
//! connect ──► Connecting ──► Active ──► Closing ──► Destroyed
//!                  │                       ▲
//!                  └── connect failed ─────┘
//! ```
//!
//! Reads are drained until the socket would block. Each batch of new bytes
//! goes through the layer the schema names: a PROXY header first for
//! `haproxy` links, the WebSocket handshake and frame decoder for `ws`/`wss`,
//! and straight to the read callback for everything else.

use super::connection::{ConnFlags, Connection, LinkId, Schema, StreamType};
use super::context::{ConnRef, NetContext};
use super::uri::Uri;
use crate::error::{Error, Result};
use crate::protocols::external::{self, ExternalHeader};
use crate::protocols::internal::{self, InternalHeader};
use crate::protocols::websocket::frame::{self, OpCode};
use crate::protocols::websocket::{WsEvent, WsSession};
use crate::protocols::{proxy, Decode};
use crate::runtime::buffer::ScratchBuffer;
use crate::runtime::reactor::{EventHandler, Reactor, MAX_FRAME_SIZE};
use crate::runtime::stream::{BufferedStream, StreamWriter, Transport};
use crate::runtime::tls::TlsRole;
use crate::runtime::token::EventHandle;
use bytes::BytesMut;
use mio::net::{TcpStream, UdpSocket, UnixStream};
use mio::Interest;
use std::cell::RefCell;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Called with newly buffered input; returns how many bytes were consumed.
/// Unconsumed bytes are offered again, with whatever arrives next.
pub type ReadCallback = Box<dyn FnMut(&mut Reactor, &mut Link<'_>, &[u8]) -> usize>;
/// Called once an outbound connect resolves; `false` means it failed.
pub type ConnectedCallback = Box<dyn FnMut(&mut Reactor, &mut Link<'_>, bool)>;
/// Called exactly once when the connection is torn down.
pub type CloseCallback = Box<dyn FnMut(&mut Reactor, &Connection)>;

/// Application hooks of one connection.
#[derive(Default)]
pub struct Callbacks {
    on_read: Option<ReadCallback>,
    on_connected: Option<ConnectedCallback>,
    on_close: Option<CloseCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &mut Link<'_>, &[u8]) -> usize + 'static,
    {
        self.on_read = Some(Box::new(f));
        self
    }

    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &mut Link<'_>, bool) + 'static,
    {
        self.on_connected = Some(Box::new(f));
        self
    }

    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &Connection) + 'static,
    {
        self.on_close = Some(Box::new(f));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Connecting,
    Active,
    Closing,
    Destroyed,
}

/// Encodes outbound WebSocket frames through a reusable scratch buffer.
struct FrameWriter {
    scratch: Option<ScratchBuffer>,
    /// Frames we send as the client side are masked.
    masked: bool,
}

impl FrameWriter {
    fn new(masked: bool) -> Self {
        Self {
            scratch: None,
            masked,
        }
    }

    fn write(&mut self, opcode: OpCode, payload: &[u8], writer: &mut StreamWriter<'_>) -> Result<()> {
        let capacity = writer.watermark();
        let scratch = self
            .scratch
            .get_or_insert_with(|| ScratchBuffer::new(capacity));

        let mut mask = [0u8; 4];
        while self.masked && mask == [0; 4] {
            mask = rand::random();
        }
        frame::encode_frame(opcode, payload, mask, scratch)?;

        for chunk in scratch.chunks(MAX_FRAME_SIZE) {
            writer.write(chunk)?;
        }
        Ok(())
    }
}

/// Write access to one connection, handed to callbacks.
pub struct Link<'a> {
    conn: &'a mut Connection,
    writer: StreamWriter<'a>,
    frames: &'a mut FrameWriter,
    ctx: &'a NetContext,
}

impl Link<'_> {
    pub fn connection(&self) -> &Connection {
        &*self.conn
    }

    pub fn id(&self) -> LinkId {
        self.conn.id()
    }

    pub fn context(&self) -> &NetContext {
        self.ctx
    }

    /// Bytes accepted but not yet written to the socket.
    pub fn pending_output(&self) -> usize {
        self.writer.pending_output()
    }

    /// Send `payload` in this connection's framing: a binary frame on
    /// WebSocket links, an HTTP response on HTTP links, raw bytes otherwise.
    pub fn send_cmd(&mut self, payload: &[u8]) -> Result<()> {
        if self.conn.is_closing() {
            return Err(Error::Closed);
        }
        match self.conn.stream_type() {
            StreamType::Ws | StreamType::Wss => {
                self.frames.write(OpCode::Binary, payload, &mut self.writer)
            }
            StreamType::Http | StreamType::Https => {
                let mut out = BytesMut::new();
                self.ctx.responder().respond(payload, &mut out);
                Ok(self.writer.write(&out)?)
            }
            _ => Ok(self.writer.write(payload)?),
        }
    }

    /// Like [`send_cmd`](Self::send_cmd) but as a text frame on WebSocket
    /// links.
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        if self.conn.stream_type().is_websocket() && !self.conn.is_closing() {
            return self.send_frame(OpCode::Text, text.as_bytes());
        }
        self.send_cmd(text.as_bytes())
    }

    /// Send a client-framed message: external header, then payload.
    pub fn send_external(
        &mut self,
        main_cmd: u16,
        sub_cmd: u16,
        seq: u32,
        payload: &[u8],
    ) -> Result<()> {
        let mut out = BytesMut::new();
        external::encode(
            ExternalHeader::cmd_id(main_cmd, sub_cmd),
            seq,
            payload,
            &mut out,
            self.writer.watermark(),
        )?;
        self.send_cmd(&out)
    }

    /// Send a server-framed message: internal header, then payload.
    pub fn forward(&mut self, header: &InternalHeader, payload: &[u8]) -> Result<()> {
        let mut out = BytesMut::new();
        internal::encode(header, payload, &mut out, self.writer.watermark())?;
        self.send_cmd(&out)
    }

    /// Close once the current callback returns. Queued output is flushed
    /// first, as far as the socket takes it.
    pub fn close(&mut self) {
        self.conn.flags_mut().insert(ConnFlags::CLOSING);
    }

    fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        self.frames.write(opcode, payload, &mut self.writer)
    }
}

/// Owns one connection's socket, buffers and callbacks.
pub struct ConnectionHandler {
    conn: Connection,
    state: HandlerState,
    stream: BufferedStream,
    ws: Option<WsSession>,
    frames: FrameWriter,
    first_packet: bool,
    callbacks: Callbacks,
    ctx: Rc<NetContext>,
    handle: EventHandle,
    /// Dial target, kept for the WebSocket opening request.
    target: Option<Uri>,
}

/// Reactor-side view of a shared handler.
struct HandlerEvents(ConnRef);

impl EventHandler for HandlerEvents {
    fn on_readable(&mut self, reactor: &mut Reactor) {
        self.0.borrow_mut().on_readable(reactor);
    }

    fn on_writable(&mut self, reactor: &mut Reactor) {
        self.0.borrow_mut().on_writable(reactor);
    }

    fn on_error(&mut self, reactor: &mut Reactor, error: io::Error) {
        self.0.borrow_mut().on_error(reactor, error);
    }
}

/// Everything needed to register a handler.
struct Setup {
    conn: Connection,
    state: HandlerState,
    ws: Option<WsSession>,
    masked: bool,
    callbacks: Callbacks,
    target: Option<Uri>,
}

impl ConnectionHandler {
    /// Take over an accepted socket speaking `schema`.
    pub fn accept(
        ctx: &Rc<NetContext>,
        reactor: &mut Reactor,
        transport: Transport,
        schema: Schema,
        callbacks: Callbacks,
    ) -> Result<ConnRef> {
        let fd = transport.raw_fd().unwrap_or_default();
        let peer = transport.peer_addr();
        let kind = schema.stream_type();

        let transport = if kind.is_secure() {
            let tls = ctx
                .tls()
                .ok_or_else(|| Error::Tls(format!("{kind} listener without a TLS context")))?;
            Transport::Tls(tls.create_session(transport, TlsRole::Server)?)
        } else {
            transport
        };

        let ws = kind.is_websocket().then(|| {
            let mut session = WsSession::new(reactor.watermark());
            session.accept();
            session
        });

        let conn = Connection::new(LinkId::passive(fd as u32), schema, peer);
        Self::install(
            ctx,
            reactor,
            transport,
            Setup {
                conn,
                state: HandlerState::Active,
                ws,
                masked: false,
                callbacks,
                target: None,
            },
        )
    }

    /// Dial `uri` and register the link under a fresh id of `server_type`.
    ///
    /// The connect itself completes asynchronously; `on_connected` reports
    /// the outcome.
    pub fn connect(
        ctx: &Rc<NetContext>,
        reactor: &mut Reactor,
        uri: &str,
        server_type: u16,
        callbacks: Callbacks,
    ) -> Result<ConnRef> {
        let target = Uri::parse(uri)?;
        let kind = target.stream_type();
        let connect_err = |reason: String| Error::Connect {
            uri: uri.to_string(),
            reason,
        };

        let transport = match kind {
            StreamType::Unix => Transport::Unix(UnixStream::connect(target.unix_path())?),
            StreamType::Udp => {
                let addr = target.resolve()?;
                let local = match addr {
                    SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
                    SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
                };
                let socket = UdpSocket::bind(local)?;
                socket.connect(addr)?;
                Transport::Udp(socket)
            }
            StreamType::HaProxy => return Err(connect_err("cannot dial a proxy schema".into())),
            _ => Transport::Tcp(TcpStream::connect(target.resolve()?)?),
        };

        let transport = if kind.is_secure() {
            let tls = ctx
                .tls()
                .ok_or_else(|| connect_err("no TLS context".into()))?;
            let role = TlsRole::Client {
                server_name: target.host.clone(),
            };
            Transport::Tls(tls.create_session(transport, role)?)
        } else {
            transport
        };

        let id = ctx.next_link(server_type)?;
        let conn = Connection::new(id, target.schema.clone(), transport.peer_addr());
        debug!(link = %id, uri, "Connecting");
        Self::install(
            ctx,
            reactor,
            transport,
            Setup {
                conn,
                state: HandlerState::Connecting,
                ws: None,
                masked: true,
                callbacks,
                target: Some(target),
            },
        )
    }

    fn install(
        ctx: &Rc<NetContext>,
        reactor: &mut Reactor,
        transport: Transport,
        setup: Setup,
    ) -> Result<ConnRef> {
        let id = setup.conn.id();
        let watermark = reactor.watermark();
        let mut created: Option<ConnRef> = None;

        let handle = reactor.register_with(
            transport,
            Interest::READABLE | Interest::WRITABLE,
            |transport, handle| {
                let mut conn = setup.conn;
                conn.set_owner(handle);
                let handler = Rc::new(RefCell::new(ConnectionHandler {
                    conn,
                    state: setup.state,
                    stream: BufferedStream::new(transport, watermark),
                    ws: setup.ws,
                    frames: FrameWriter::new(setup.masked),
                    first_packet: true,
                    callbacks: setup.callbacks,
                    ctx: Rc::clone(ctx),
                    handle,
                    target: setup.target,
                }));
                created = Some(Rc::clone(&handler));
                HandlerEvents(handler)
            },
        )?;

        let Some(handler) = created else {
            return Err(Error::Closed);
        };
        if !ctx.insert(id, Rc::clone(&handler)) {
            let mut dup = handler.borrow_mut();
            reactor.unregister(handle);
            let _ = reactor.registry().deregister(dup.stream.transport_mut());
            dup.state = HandlerState::Destroyed;
            return Err(Error::Connect {
                uri: id.to_string(),
                reason: "link id already registered".to_string(),
            });
        }

        trace!(link = %id, "Registered connection");
        Ok(handler)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    /// WebSocket session, for `ws`/`wss` links.
    pub fn websocket(&self) -> Option<&WsSession> {
        self.ws.as_ref()
    }

    /// Write access outside of a callback.
    pub fn link(&mut self) -> Link<'_> {
        Link {
            conn: &mut self.conn,
            writer: self.stream.writer(),
            frames: &mut self.frames,
            ctx: &self.ctx,
        }
    }

    pub(crate) fn mark_heartbeat(&mut self) -> bool {
        let flags = self.conn.flags_mut();
        if flags.contains(ConnFlags::HEARTBEAT_LOST) {
            return false;
        }
        flags.insert(ConnFlags::HEARTBEAT_LOST);
        true
    }

    /// Tear the connection down and fire `on_close`. Idempotent.
    pub fn close(&mut self, reactor: &mut Reactor, reason: &str) {
        if matches!(self.state, HandlerState::Closing | HandlerState::Destroyed) {
            return;
        }
        self.state = HandlerState::Closing;
        debug!(
            link = %self.conn.id(),
            peer = ?self.conn.peer(),
            reason,
            "Connection closed"
        );

        if let Err(e) = self.stream.flush() {
            debug!(
                link = %self.conn.id(),
                error = %e,
                dropped = self.stream.pending_output(),
                "Flush on close failed"
            );
        }
        reactor.unregister(self.handle);
        let _ = reactor.registry().deregister(self.stream.transport_mut());
        drop(self.ctx.remove(self.conn.id()));

        if let Some(on_close) = self.callbacks.on_close.as_mut() {
            on_close(reactor, &self.conn);
        }
        self.state = HandlerState::Destroyed;
    }

    fn on_readable(&mut self, reactor: &mut Reactor) {
        if self.state == HandlerState::Connecting {
            self.complete_connect(reactor);
        }
        if self.state != HandlerState::Active {
            return;
        }

        loop {
            let fill = match self.stream.fill() {
                Ok(fill) => fill,
                Err(e) => {
                    debug!(link = %self.conn.id(), error = %e, "Read failed");
                    return self.close(reactor, "read error");
                }
            };

            if fill.read > 0 {
                self.conn.flags_mut().remove(ConnFlags::HEARTBEAT_LOST);
                if let Err(e) = self.process_input(reactor) {
                    warn!(link = %self.conn.id(), error = %e, "Protocol error");
                    return self.close(reactor, "protocol error");
                }
                if self.state != HandlerState::Active {
                    return;
                }
                if self.conn.is_closing() {
                    return self.close(reactor, "closed locally");
                }
            }

            if self.stream.input_full() {
                warn!(
                    link = %self.conn.id(),
                    watermark = self.stream.watermark(),
                    "Read buffer overflow"
                );
                return self.close(reactor, "overflow");
            }
            if fill.eof {
                return self.close(reactor, "peer closed");
            }
            if fill.read == 0 {
                break;
            }
        }
    }

    fn on_writable(&mut self, reactor: &mut Reactor) {
        if self.state == HandlerState::Connecting {
            self.complete_connect(reactor);
        }
        if self.state != HandlerState::Active {
            return;
        }
        match self.stream.flush() {
            Ok(_) if self.conn.is_closing() => self.close(reactor, "closed locally"),
            Ok(_) => {}
            Err(e) => {
                debug!(link = %self.conn.id(), error = %e, "Write failed");
                self.close(reactor, "write error");
            }
        }
    }

    fn on_error(&mut self, reactor: &mut Reactor, error: io::Error) {
        let error = match self.stream.transport().take_error() {
            Ok(Some(e)) => e,
            _ => error,
        };
        if self.state == HandlerState::Connecting {
            debug!(link = %self.conn.id(), error = %error, "Connect failed");
            self.notify_connected(reactor, false);
        } else {
            debug!(link = %self.conn.id(), error = %error, "Socket error");
        }
        self.close(reactor, "socket error");
    }

    fn complete_connect(&mut self, reactor: &mut Reactor) {
        let failure = match self.stream.transport().take_error() {
            Ok(Some(e)) | Err(e) => Some(e),
            Ok(None) => None,
        };
        if let Some(e) = failure {
            debug!(link = %self.conn.id(), error = %e, "Connect failed");
            self.notify_connected(reactor, false);
            return self.close(reactor, "connect failed");
        }
        if !self.stream.transport().is_connected() {
            return;
        }

        self.state = HandlerState::Active;
        if let Some(peer) = self.stream.transport().peer_addr() {
            self.conn.set_peer(peer);
        }
        debug!(link = %self.conn.id(), peer = ?self.conn.peer(), "Connected");

        if self.conn.stream_type().is_websocket() {
            let (host, path) = match &self.target {
                Some(target) => (host_header(target), target.path.clone()),
                None => (String::new(), "/".to_string()),
            };
            let mut session = WsSession::new(self.stream.watermark());
            let request = session.open(&host, &path);
            self.ws = Some(session);
            if let Err(e) = self.stream.write(request.as_bytes()) {
                debug!(link = %self.conn.id(), error = %e, "Handshake write failed");
                self.notify_connected(reactor, false);
                return self.close(reactor, "write error");
            }
        }
        self.notify_connected(reactor, true);
    }

    fn notify_connected(&mut self, reactor: &mut Reactor, ok: bool) {
        let Some(on_connected) = self.callbacks.on_connected.as_mut() else {
            return;
        };
        let mut link = Link {
            conn: &mut self.conn,
            writer: self.stream.writer(),
            frames: &mut self.frames,
            ctx: &self.ctx,
        };
        on_connected(reactor, &mut link, ok);
    }

    /// Run buffered input through the connection's protocol layers.
    fn process_input(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            if self.stream.input_len() == 0
                || self.conn.is_closing()
                || self.state != HandlerState::Active
            {
                return Ok(());
            }

            match self.conn.stream_type() {
                StreamType::HaProxy if self.first_packet => {
                    if !self.unwrap_proxy()? {
                        return Ok(());
                    }
                }
                StreamType::HaProxy => {
                    return Err(Error::Config(format!(
                        "unsupported schema {}",
                        self.conn.schema()
                    )))
                }
                StreamType::Ws | StreamType::Wss => {
                    if !self.process_websocket(reactor)? {
                        return Ok(());
                    }
                }
                _ => {
                    self.deliver(reactor);
                    return Ok(());
                }
            }
        }
    }

    /// Consume a PROXY header and switch to the protocol behind it.
    fn unwrap_proxy(&mut self) -> Result<bool> {
        let (header, consumed) = match proxy::decode(self.stream.input())? {
            Decode::Complete { value, consumed } => (value, consumed),
            Decode::Incomplete => return Ok(false),
        };
        self.stream.consume(consumed);
        self.first_packet = false;

        if let Some(addrs) = header.addrs() {
            self.conn.set_peer(addrs.source);
        }
        let real = self.conn.schema_mut().unwrap_proxy();
        debug!(
            link = %self.conn.id(),
            peer = ?self.conn.peer(),
            version = header.version(),
            protocol = %real,
            "Proxy header consumed"
        );

        match real {
            StreamType::HaProxy | StreamType::Wss | StreamType::Https => Err(Error::Config(
                format!("{real} cannot follow a proxy header"),
            )),
            StreamType::Ws => {
                let mut session = WsSession::new(self.stream.watermark());
                session.accept();
                self.ws = Some(session);
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    /// Handle one handshake step or one frame. Returns whether input was
    /// consumed.
    fn process_websocket(&mut self, reactor: &mut Reactor) -> Result<bool> {
        let Self {
            conn,
            stream,
            ws,
            frames,
            callbacks,
            ctx,
            first_packet,
            ..
        } = self;
        let session = ws
            .as_mut()
            .ok_or_else(|| Error::WebSocket("no session on a websocket link".into()))?;
        *first_packet = false;

        if !session.is_connected() {
            let (input, mut writer) = stream.split();
            let consumed = match session.handshake(input)? {
                Decode::Complete { value, consumed } => {
                    if let Some(response) = value {
                        writer.write(response.as_bytes())?;
                    }
                    consumed
                }
                Decode::Incomplete => return Ok(false),
            };
            stream.consume(consumed);
            debug!(link = %conn.id(), "WebSocket connected");
            return Ok(true);
        }

        let (input, writer) = stream.split();
        let mut link = Link {
            conn,
            writer,
            frames,
            ctx: &**ctx,
        };
        let consumed = match session.process(input)? {
            Decode::Incomplete => return Ok(false),
            Decode::Complete { value, consumed } => {
                match value {
                    WsEvent::Message { payload, .. } => {
                        if let Some(on_read) = callbacks.on_read.as_mut() {
                            on_read(reactor, &mut link, payload);
                        }
                    }
                    WsEvent::Fragment | WsEvent::Pong(_) => {}
                    WsEvent::Ping(payload) => link.send_frame(OpCode::Pong, &payload)?,
                    WsEvent::Close { code, reason } => {
                        debug!(link = %link.id(), code = ?code, reason = %reason, "WebSocket close received");
                        link.send_frame(OpCode::Close, &frame::close_payload(code, &reason))?;
                        link.close();
                    }
                }
                consumed
            }
        };
        stream.consume(consumed);
        Ok(true)
    }

    /// Hand all buffered input to the read callback.
    fn deliver(&mut self, reactor: &mut Reactor) {
        let Self {
            conn,
            stream,
            frames,
            callbacks,
            ctx,
            first_packet,
            ..
        } = self;
        *first_packet = false;

        let (input, writer) = stream.split();
        let len = input.len();
        let consumed = match callbacks.on_read.as_mut() {
            Some(on_read) => {
                let mut link = Link {
                    conn,
                    writer,
                    frames,
                    ctx: &**ctx,
                };
                on_read(reactor, &mut link, input).min(len)
            }
            None => len,
        };
        stream.consume(consumed);
    }
}

/// `Host` header value for an opening request.
fn host_header(target: &Uri) -> String {
    let default = target.schema.stream_type().default_port();
    if Some(target.port) == default {
        target.host.clone()
    } else if target.host.contains(':') {
        format!("[{}]:{}", target.host, target.port)
    } else {
        format!("{}:{}", target.host, target.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::http::PlainResponder;
    use crate::net::listener::listen;
    use std::cell::Cell;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::time::{Duration, Instant};

    fn spin(reactor: &mut Reactor, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            reactor.run_once(Some(Duration::from_millis(5))).unwrap();
        }
    }

    /// Run the reactor while reading from a plain client until `done`.
    fn exchange(
        reactor: &mut Reactor,
        client: &mut StdTcpStream,
        done: impl Fn(&[u8]) -> bool,
    ) -> Vec<u8> {
        let mut got = Vec::new();
        let mut buf = [0u8; 16 * 1024];
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(&got) && Instant::now() < deadline {
            reactor.run_once(Some(Duration::from_millis(5))).unwrap();
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => got.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        got
    }

    /// Write all of `data` from a non-blocking client, running the reactor
    /// whenever the socket pushes back.
    fn push(reactor: &mut Reactor, client: &mut StdTcpStream, mut data: &[u8]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !data.is_empty() && Instant::now() < deadline {
            match client.write(data) {
                Ok(n) => data = &data[n..],
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    reactor.run_once(Some(Duration::from_millis(5))).unwrap();
                }
                Err(e) => panic!("client write failed: {e}"),
            }
        }
        assert!(data.is_empty(), "{} bytes never written", data.len());
    }

    const UPGRADE: &[u8] = b"GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
        Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    /// Read the server's handshake response and check it accepts the key in
    /// [`UPGRADE`].
    fn expect_upgraded(reactor: &mut Reactor, client: &mut StdTcpStream) {
        let response = exchange(reactor, client, |got| {
            got.windows(4).any(|w| w == b"\r\n\r\n")
        });
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    fn masked(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mut scratch = ScratchBuffer::new(payload.len() + 64);
        frame::encode_frame(opcode, payload, [9, 8, 7, 6], &mut scratch).unwrap();
        scratch.data().to_vec()
    }

    fn serve(reactor: &mut Reactor, ctx: &Rc<NetContext>, uri: &str) -> SocketAddr {
        let listening = listen(
            ctx,
            reactor,
            uri,
            Rc::new(|| {
                Callbacks::new().on_read(|_, link, data| {
                    link.send_cmd(data).unwrap();
                    data.len()
                })
            }),
        )
        .unwrap();
        listening.local_addr.unwrap()
    }

    fn client(addr: SocketAddr) -> StdTcpStream {
        let stream = StdTcpStream::connect(addr).unwrap();
        stream.set_nonblocking(true).unwrap();
        stream
    }

    #[test]
    fn test_echo_over_tcp() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "tcp://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(b"hello").unwrap();
        let got = exchange(&mut reactor, &mut client, |got| got.len() >= 5);

        assert_eq!(got, b"hello");
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_proxy_header_restamps_peer() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let seen: Rc<RefCell<Option<(Option<SocketAddr>, StreamType, Vec<u8>)>>> =
            Rc::new(RefCell::new(None));

        let sink = Rc::clone(&seen);
        let listening = listen(
            &ctx,
            &mut reactor,
            "haproxy->tcp://127.0.0.1:0",
            Rc::new(move || {
                let sink = Rc::clone(&sink);
                Callbacks::new().on_read(move |_, link, data| {
                    let conn = link.connection();
                    *sink.borrow_mut() = Some((conn.peer(), conn.stream_type(), data.to_vec()));
                    data.len()
                })
            }),
        )
        .unwrap();

        let mut client = client(listening.local_addr.unwrap());
        client
            .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 5555 80\r\nping")
            .unwrap();
        spin(&mut reactor, || seen.borrow().is_some());

        let (peer, kind, data) = seen.borrow_mut().take().unwrap();
        assert_eq!(peer, Some("203.0.113.7:5555".parse().unwrap()));
        assert_eq!(kind, StreamType::Tcp);
        assert_eq!(data, b"ping");
    }

    #[test]
    fn test_not_a_proxy_header_closes() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "haproxy->tcp://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        spin(&mut reactor, || ctx.is_empty());
        let got = exchange(&mut reactor, &mut client, |_| false);

        assert!(ctx.is_empty());
        assert!(got.is_empty());
    }

    #[test]
    fn test_websocket_handshake_echo_and_ping() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "ws://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(UPGRADE).unwrap();
        expect_upgraded(&mut reactor, &mut client);

        client.write_all(&masked(OpCode::Binary, b"hi")).unwrap();
        let echoed = exchange(&mut reactor, &mut client, |got| got.len() >= 4);
        assert_eq!(echoed, [0x82, 0x02, b'h', b'i']);

        client.write_all(&masked(OpCode::Ping, b"beat")).unwrap();
        let pong = exchange(&mut reactor, &mut client, |got| got.len() >= 6);
        assert_eq!(pong, [0x8A, 0x04, b'b', b'e', b'a', b't']);
    }

    #[test]
    fn test_websocket_close_is_echoed() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "ws://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(UPGRADE).unwrap();
        expect_upgraded(&mut reactor, &mut client);
        assert_eq!(ctx.len(), 1);

        let body = frame::close_payload(Some(1000), "bye");
        client.write_all(&masked(OpCode::Close, &body)).unwrap();
        // Runs until the server closes its side.
        let got = exchange(&mut reactor, &mut client, |_| false);

        assert_eq!(got, [0x88, 0x05, 0x03, 0xE8, b'b', b'y', b'e']);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_websocket_message_larger_than_one_chunk() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "ws://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(UPGRADE).unwrap();
        expect_upgraded(&mut reactor, &mut client);

        let payload: Vec<u8> = (0..MAX_FRAME_SIZE + 34_464).map(|i| i as u8).collect();
        push(&mut reactor, &mut client, &masked(OpCode::Binary, &payload));
        let expected = frame::encoded_len(payload.len(), false);
        let echoed = exchange(&mut reactor, &mut client, |got| got.len() >= expected);

        assert_eq!(echoed.len(), expected);
        assert_eq!(echoed[..2], [0x82, 127]);
        assert_eq!(echoed[2..10], (payload.len() as u64).to_be_bytes());
        assert!(echoed[10..] == payload[..]);
    }

    #[test]
    fn test_proxy_in_front_of_websocket() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "haproxy->ws://127.0.0.1:0");

        let mut client = client(addr);
        let mut opening = b"PROXY TCP4 198.51.100.9 10.0.0.1 4242 80\r\n".to_vec();
        opening.extend_from_slice(UPGRADE);
        client.write_all(&opening).unwrap();
        expect_upgraded(&mut reactor, &mut client);

        client.write_all(&masked(OpCode::Binary, b"ok")).unwrap();
        let echoed = exchange(&mut reactor, &mut client, |got| got.len() >= 4);
        assert_eq!(echoed, [0x82, 0x02, b'o', b'k']);

        let link = ctx.get_by_type(0, 0).unwrap();
        let handler = link.borrow();
        assert_eq!(handler.connection().stream_type(), StreamType::Ws);
        assert_eq!(
            handler.connection().peer(),
            Some("198.51.100.9:4242".parse().unwrap())
        );
        assert!(handler.websocket().unwrap().is_connected());
    }

    #[test]
    fn test_proxy_v2_header_restamps_peer() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let seen: Rc<RefCell<Option<(Option<SocketAddr>, Vec<u8>)>>> = Rc::new(RefCell::new(None));

        let sink = Rc::clone(&seen);
        let listening = listen(
            &ctx,
            &mut reactor,
            "haproxy->tcp://127.0.0.1:0",
            Rc::new(move || {
                let sink = Rc::clone(&sink);
                Callbacks::new().on_read(move |_, link, data| {
                    *sink.borrow_mut() = Some((link.connection().peer(), data.to_vec()));
                    data.len()
                })
            }),
        )
        .unwrap();

        let mut header = proxy::V2_SIGNATURE.to_vec();
        header.extend_from_slice(&[0x21, 0x11, 0x00, 0x0C]);
        header.extend_from_slice(&[10, 1, 2, 3, 10, 0, 0, 1]);
        header.extend_from_slice(&6000u16.to_be_bytes());
        header.extend_from_slice(&80u16.to_be_bytes());
        header.extend_from_slice(b"ping");

        let mut client = client(listening.local_addr.unwrap());
        client.write_all(&header).unwrap();
        spin(&mut reactor, || seen.borrow().is_some());

        let (peer, data) = seen.borrow_mut().take().unwrap();
        assert_eq!(peer, Some("10.1.2.3:6000".parse().unwrap()));
        assert_eq!(data, b"ping");
    }

    #[test]
    fn test_http_link_wraps_response() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new().with_responder(PlainResponder::new("text/plain")));
        let addr = serve(&mut reactor, &ctx, "http://127.0.0.1:0");

        let mut client = client(addr);
        client.write_all(b"hello").unwrap();
        let got = exchange(&mut reactor, &mut client, |got| got.ends_with(b"hello"));

        let text = String::from_utf8(got).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_unix_listen_and_dial() {
        let path = std::env::temp_dir().join(format!("gatehouse-link-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let uri = format!("unix://{}", path.display());

        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let listening = listen(
            &ctx,
            &mut reactor,
            &uri,
            Rc::new(|| {
                Callbacks::new().on_read(|_, link, data| {
                    link.send_cmd(data).unwrap();
                    data.len()
                })
            }),
        )
        .unwrap();
        assert!(listening.local_addr.is_none());

        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let link = ConnectionHandler::connect(
            &ctx,
            &mut reactor,
            &uri,
            4,
            Callbacks::new()
                .on_connected(|_, link, ok| {
                    assert!(ok);
                    link.send_cmd(b"over unix").unwrap();
                })
                .on_read(move |_, _, data| {
                    sink.borrow_mut().extend_from_slice(data);
                    data.len()
                }),
        )
        .unwrap();
        spin(&mut reactor, || got.borrow().len() >= 9);
        let _ = std::fs::remove_file(&path);

        assert_eq!(&*got.borrow(), b"over unix");
        assert_eq!(link.borrow().connection().stream_type(), StreamType::Unix);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_udp_dial() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_nonblocking(true).unwrap();
        let addr = server.local_addr().unwrap();

        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let got = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&got);
        let link = ConnectionHandler::connect(
            &ctx,
            &mut reactor,
            &format!("udp://{addr}"),
            9,
            Callbacks::new()
                .on_connected(|_, link, ok| {
                    assert!(ok);
                    link.send_cmd(b"dgram").unwrap();
                })
                .on_read(move |_, _, data| {
                    sink.borrow_mut().extend_from_slice(data);
                    data.len()
                }),
        )
        .unwrap();

        let mut buf = [0u8; 64];
        let mut request = None;
        spin(&mut reactor, || match server.recv_from(&mut buf) {
            Ok((n, from)) => {
                request = Some((buf[..n].to_vec(), from));
                true
            }
            Err(_) => false,
        });
        let (data, from) = request.unwrap();
        assert_eq!(data, b"dgram");

        server.send_to(b"", from).unwrap();
        server.send_to(b"back", from).unwrap();
        spin(&mut reactor, || !got.borrow().is_empty());

        assert_eq!(&*got.borrow(), b"back");
        assert_eq!(link.borrow().state(), HandlerState::Active);
        assert_eq!(link.borrow().connection().id().server_type(), 9);
    }

    #[test]
    fn test_read_overflow_closes() {
        let mut reactor = Reactor::with_watermark(64).unwrap();
        let ctx = Rc::new(NetContext::new());
        let closed = Rc::new(Cell::new(false));

        let flag = Rc::clone(&closed);
        let listening = listen(
            &ctx,
            &mut reactor,
            "tcp://127.0.0.1:0",
            Rc::new(move || {
                let flag = Rc::clone(&flag);
                Callbacks::new()
                    .on_read(|_, _, _| 0)
                    .on_close(move |_, _| flag.set(true))
            }),
        )
        .unwrap();

        let mut client = client(listening.local_addr.unwrap());
        client.write_all(&[7u8; 100]).unwrap();
        spin(&mut reactor, || closed.get());

        assert!(closed.get());
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_heartbeat_closes_silent_link() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "tcp://127.0.0.1:0");

        let _client = client(addr);
        spin(&mut reactor, || ctx.len() == 1);

        assert_eq!(ctx.heartbeat(&mut reactor), 0);
        assert_eq!(ctx.heartbeat(&mut reactor), 1);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_outbound_tcp_link() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "tcp://127.0.0.1:0");
        let got = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&got);
        let link = ConnectionHandler::connect(
            &ctx,
            &mut reactor,
            &format!("tcp://{addr}"),
            7,
            Callbacks::new()
                .on_connected(|_, link, ok| {
                    assert!(ok);
                    link.send_cmd(b"round trip").unwrap();
                })
                .on_read(move |_, _, data| {
                    sink.borrow_mut().extend_from_slice(data);
                    data.len()
                }),
        )
        .unwrap();

        let id = link.borrow().connection().id();
        assert_eq!(id.server_type(), 7);
        spin(&mut reactor, || got.borrow().len() >= 10);

        assert_eq!(&*got.borrow(), b"round trip");
        assert_eq!(link.borrow().state(), HandlerState::Active);
        assert!(ctx.get_by_type(7, 0).is_some());
    }

    #[test]
    fn test_outbound_websocket_link() {
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let addr = serve(&mut reactor, &ctx, "ws://127.0.0.1:0");
        let got = Rc::new(RefCell::new(Vec::new()));

        let sink = Rc::clone(&got);
        ConnectionHandler::connect(
            &ctx,
            &mut reactor,
            &format!("ws://{addr}/chat"),
            3,
            Callbacks::new()
                .on_connected(|_, link, ok| {
                    assert!(ok);
                    link.send_cmd(b"over websocket").unwrap();
                })
                .on_read(move |_, _, data| {
                    sink.borrow_mut().extend_from_slice(data);
                    data.len()
                }),
        )
        .unwrap();

        spin(&mut reactor, || !got.borrow().is_empty());
        assert_eq!(&*got.borrow(), b"over websocket");
    }

    #[test]
    fn test_connect_refused() {
        let addr = {
            let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            spare.local_addr().unwrap()
        };
        let mut reactor = Reactor::new().unwrap();
        let ctx = Rc::new(NetContext::new());
        let failed = Rc::new(Cell::new(false));

        let flag = Rc::clone(&failed);
        let result = ConnectionHandler::connect(
            &ctx,
            &mut reactor,
            &format!("tcp://{addr}"),
            1,
            Callbacks::new().on_connected(move |_, _, ok| flag.set(!ok)),
        );
        match result {
            Err(_) => failed.set(true),
            Ok(_) => spin(&mut reactor, || failed.get()),
        }

        assert!(failed.get());
        assert!(ctx.is_empty());
    }
}
