//! Listening sockets that turn accepted streams into connection handlers.

use super::connection::{Schema, StreamType};
use super::context::NetContext;
use super::handler::{Callbacks, ConnectionHandler};
use super::uri::Uri;
use crate::error::{Error, Result};
use crate::runtime::reactor::{EventHandler, Reactor};
use crate::runtime::stream::Transport;
use crate::runtime::token::EventHandle;
use mio::event::Source;
use mio::net::{TcpListener, UnixListener};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use tracing::{debug, error, info};

/// Builds the callbacks for each accepted connection.
pub type CallbackFactory = Rc<dyn Fn() -> Callbacks>;

/// A registered listening socket.
#[derive(Debug, Clone, Copy)]
pub struct Listening {
    pub handle: EventHandle,
    /// Bound address of TCP listeners.
    pub local_addr: Option<SocketAddr>,
}

enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenSocket {
    fn accept(&self) -> io::Result<Transport> {
        match self {
            ListenSocket::Tcp(l) => l.accept().map(|(s, _)| Transport::Tcp(s)),
            ListenSocket::Unix(l) => l.accept().map(|(s, _)| Transport::Unix(s)),
        }
    }
}

impl Source for ListenSocket {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            ListenSocket::Tcp(l) => l.register(registry, token, interests),
            ListenSocket::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            ListenSocket::Tcp(l) => l.reregister(registry, token, interests),
            ListenSocket::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            ListenSocket::Tcp(l) => l.deregister(registry),
            ListenSocket::Unix(l) => l.deregister(registry),
        }
    }
}

struct Acceptor {
    socket: ListenSocket,
    schema: Schema,
    ctx: Rc<NetContext>,
    callbacks: CallbackFactory,
}

impl EventHandler for Acceptor {
    fn on_readable(&mut self, reactor: &mut Reactor) {
        loop {
            match self.socket.accept() {
                Ok(transport) => {
                    let peer = transport.peer_addr();
                    let callbacks = (self.callbacks)();
                    match ConnectionHandler::accept(
                        &self.ctx,
                        reactor,
                        transport,
                        self.schema.clone(),
                        callbacks,
                    ) {
                        Ok(handler) => {
                            debug!(
                                link = %handler.borrow().connection().id(),
                                peer = ?peer,
                                schema = %self.schema,
                                "Accepted connection"
                            );
                        }
                        Err(e) => debug!(peer = ?peer, error = %e, "Rejected connection"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }
}

/// Listen on `uri` and hand every accepted socket to a new
/// [`ConnectionHandler`].
///
/// TCP listeners set `SO_REUSEPORT`, so each worker binds its own socket on
/// the same address and the kernel spreads connections between them.
pub fn listen(
    ctx: &Rc<NetContext>,
    reactor: &mut Reactor,
    uri: &str,
    callbacks: CallbackFactory,
) -> Result<Listening> {
    let target = Uri::parse(uri)?;
    let schema = target.schema.clone();
    match (schema.stream_type(), schema.inner()) {
        (StreamType::Udp, _) => {
            return Err(Error::Config(format!("{uri}: datagram sockets cannot listen")))
        }
        (StreamType::HaProxy, Some(inner)) if inner.is_secure() || inner == StreamType::HaProxy => {
            return Err(Error::Config(format!("{uri}: {inner} cannot follow a proxy header")))
        }
        (kind, _) if kind.is_secure() && ctx.tls().is_none() => {
            return Err(Error::Tls(format!("{uri}: no TLS context")))
        }
        _ => {}
    }

    let (socket, local_addr) = if target.is_unix() {
        (ListenSocket::Unix(UnixListener::bind(target.unix_path())?), None)
    } else {
        let listener = TcpListener::from_std(create_listener_with_reuseport(target.resolve()?)?);
        let local_addr = listener.local_addr().ok();
        (ListenSocket::Tcp(listener), local_addr)
    };

    let ctx = Rc::clone(ctx);
    let handle = reactor.register_with(socket, Interest::READABLE, |socket, _| Acceptor {
        socket,
        schema,
        ctx,
        callbacks,
    })?;
    info!(uri, local_addr = ?local_addr, "Listening");
    Ok(Listening { handle, local_addr })
}

fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
