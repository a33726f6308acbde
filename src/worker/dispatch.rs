//! Main-thread routing of envelopes arriving from workers.

use crate::error::{Error, Result};
use crate::runtime::{ChannelSender, Envelope, Reactor, Tag};
use tracing::{debug, warn};

/// Main-side view of the pool during one dispatch: the worker that sent the
/// envelope plus write access to every worker's channel.
pub struct Origin<'a> {
    worker: usize,
    peers: &'a [ChannelSender],
}

impl<'a> Origin<'a> {
    pub(crate) fn new(worker: usize, peers: &'a [ChannelSender]) -> Self {
        Self { worker, peers }
    }

    /// Id of the sending worker.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Number of workers in the pool.
    pub fn workers(&self) -> usize {
        self.peers.len()
    }

    /// Answer the sending worker.
    pub fn reply(&self, tag: Tag, payload: &[u8]) -> Result<()> {
        self.send_to(self.worker, tag, payload)
    }

    pub fn send_to(&self, worker: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        self.peers
            .get(worker)
            .ok_or_else(|| Error::Worker(format!("no worker {worker}")))?
            .write(tag, payload)
    }

    /// Send to every worker; returns how many accepted the envelope.
    pub fn broadcast(&self, tag: Tag, payload: &[u8]) -> usize {
        broadcast(self.peers, tag, payload)
    }
}

pub(crate) fn broadcast(peers: &[ChannelSender], tag: Tag, payload: &[u8]) -> usize {
    let mut sent = 0;
    for (id, peer) in peers.iter().enumerate() {
        match peer.write(tag, payload) {
            Ok(()) => sent += 1,
            Err(e) => warn!(worker = id, error = %e, "Broadcast failed"),
        }
    }
    sent
}

/// Handles one envelope tag on the main thread.
pub type MainCallback = Box<dyn FnMut(&mut Reactor, &Origin<'_>, &[u8])>;

/// Tag-indexed callbacks for envelopes sent by workers.
///
/// Text payloads that are not UTF-8 and tags without a callback are dropped
/// with a log line.
#[derive(Default)]
pub struct DispatchTable {
    text: Option<MainCallback>,
    json: Option<MainCallback>,
    binary: Option<MainCallback>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &Origin<'_>, &[u8]) + 'static,
    {
        self.text = Some(Box::new(f));
        self
    }

    pub fn on_json<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &Origin<'_>, &[u8]) + 'static,
    {
        self.json = Some(Box::new(f));
        self
    }

    pub fn on_binary<F>(mut self, f: F) -> Self
    where
        F: FnMut(&mut Reactor, &Origin<'_>, &[u8]) + 'static,
    {
        self.binary = Some(Box::new(f));
        self
    }

    /// Route `envelope`. Returns whether a callback ran.
    pub fn dispatch(
        &mut self,
        reactor: &mut Reactor,
        origin: &Origin<'_>,
        envelope: Envelope<'_>,
    ) -> bool {
        let slot = match envelope.tag {
            Tag::Text => {
                if std::str::from_utf8(envelope.payload).is_err() {
                    warn!(worker = origin.worker(), "Dropped non-UTF-8 text envelope");
                    return false;
                }
                &mut self.text
            }
            Tag::Json => &mut self.json,
            Tag::Binary => &mut self.binary,
        };
        match slot {
            Some(callback) => {
                callback(reactor, origin, envelope.payload);
                true
            }
            None => {
                debug!(worker = origin.worker(), tag = ?envelope.tag, "No handler for envelope");
                false
            }
        }
    }
}
