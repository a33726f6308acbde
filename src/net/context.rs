//! Per-worker networking context.
//!
//! One `NetContext` exists per reactor thread. It owns the registry of live
//! links plus the collaborators connections need (HTTP responder, optional
//! TLS context) and is shared by `Rc` with every handler on that thread.

use super::connection::LinkId;
use super::handler::ConnectionHandler;
use super::http::{HttpResponder, PlainResponder};
use super::manager::ConnectionManager;
use crate::error::{Error, Result};
use crate::runtime::reactor::Reactor;
use crate::runtime::tls::TlsContext;
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::debug;

/// Shared handle to a connection handler.
pub type ConnRef = Rc<RefCell<ConnectionHandler>>;

pub struct NetContext {
    connections: RefCell<ConnectionManager<ConnRef>>,
    responder: Box<dyn HttpResponder>,
    tls: Option<Box<dyn TlsContext>>,
    next_seq: Cell<u16>,
}

impl Default for NetContext {
    fn default() -> Self {
        Self::new()
    }
}

impl NetContext {
    pub fn new() -> Self {
        Self {
            connections: RefCell::new(ConnectionManager::new()),
            responder: Box::new(PlainResponder::default()),
            tls: None,
            next_seq: Cell::new(1),
        }
    }

    pub fn with_responder(mut self, responder: impl HttpResponder + 'static) -> Self {
        self.responder = Box::new(responder);
        self
    }

    pub fn with_tls(mut self, tls: impl TlsContext + 'static) -> Self {
        self.tls = Some(Box::new(tls));
        self
    }

    pub fn responder(&self) -> &dyn HttpResponder {
        self.responder.as_ref()
    }

    pub fn tls(&self) -> Option<&dyn TlsContext> {
        self.tls.as_deref()
    }

    /// The link registry.
    ///
    /// Do not hold a borrow across a call that may close a connection;
    /// closing removes the link from the registry.
    pub fn connections(&self) -> &RefCell<ConnectionManager<ConnRef>> {
        &self.connections
    }

    pub fn get(&self, id: LinkId) -> Option<ConnRef> {
        self.connections.borrow().get(id).cloned()
    }

    /// Round-robin or keyed pick among links of `server_type`.
    pub fn get_by_type(&self, server_type: u16, key: u64) -> Option<ConnRef> {
        self.connections
            .borrow_mut()
            .get_by_type(server_type, key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.borrow().is_empty()
    }

    pub(crate) fn insert(&self, id: LinkId, conn: ConnRef) -> bool {
        self.connections.borrow_mut().add(id, conn)
    }

    pub(crate) fn remove(&self, id: LinkId) -> Option<ConnRef> {
        self.connections.borrow_mut().remove(id)
    }

    /// A fresh id for an internally created link of `server_type`.
    pub(crate) fn next_link(&self, server_type: u16) -> Result<LinkId> {
        let id = self
            .connections
            .borrow()
            .free_internal_id(server_type, self.next_seq.get())
            .ok_or_else(|| Error::Connect {
                uri: format!("server type {server_type}"),
                reason: "every link id is in use".to_string(),
            })?;
        let seq = id.src() as u16;
        self.next_seq.set(seq.checked_add(1).unwrap_or(1));
        Ok(id)
    }

    /// Send `payload` on link `id` in that link's framing.
    pub fn send_to(&self, id: LinkId, payload: &[u8]) -> Result<()> {
        let conn = self.get(id).ok_or(Error::Closed)?;
        let mut handler = conn.try_borrow_mut().map_err(|_| {
            Error::Io(io::Error::new(io::ErrorKind::WouldBlock, "link is busy"))
        })?;
        let result = handler.link().send_cmd(payload);
        result
    }

    /// Close every link.
    pub fn close_all(&self, reactor: &mut Reactor, reason: &str) {
        let links: Vec<ConnRef> = self.snapshot();
        for link in links {
            if let Ok(mut handler) = link.try_borrow_mut() {
                handler.close(reactor, reason);
            }
        }
    }

    /// One heartbeat tick: close links that stayed silent for a whole period
    /// and flag the rest. Returns the number of links closed.
    pub fn heartbeat(&self, reactor: &mut Reactor) -> usize {
        let mut closed = 0;
        for link in self.snapshot() {
            let Ok(mut handler) = link.try_borrow_mut() else {
                continue;
            };
            if !handler.mark_heartbeat() {
                handler.close(reactor, "heartbeat lost");
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(closed, "Heartbeat closed idle links");
        }
        closed
    }

    /// Run [`heartbeat`](Self::heartbeat) every `period` on timer `timer_id`.
    pub fn start_heartbeat(self: &Rc<Self>, reactor: &mut Reactor, timer_id: u32, period: Duration) {
        let ctx: Weak<Self> = Rc::downgrade(self);
        reactor.add_persistent_timer(timer_id, period, move |reactor| {
            match ctx.upgrade() {
                Some(ctx) => {
                    ctx.heartbeat(reactor);
                }
                None => {
                    reactor.remove_timer(timer_id);
                }
            }
        });
    }

    fn snapshot(&self) -> Vec<ConnRef> {
        let mgr = self.connections.borrow();
        let mut links = Vec::with_capacity(mgr.len());
        mgr.for_each(|_, link| {
            links.push(Rc::clone(link));
            true
        });
        links
    }
}
