//! Main-thread side of the worker pool.

use super::dispatch::{self, DispatchTable, Origin};
use super::worker::{run_worker, Launch, Readiness, Worker};
use crate::config::ReloadConfig;
use crate::error::{Error, Result};
use crate::runtime::reactor::{DEFAULT_WATERMARK_MULTIPLE, MAX_FRAME_SIZE};
use crate::runtime::{Channel, ChannelHandler, ChannelSender, Envelope, Reactor, Tag};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Builds the worker for a given id, on that worker's thread.
pub type WorkerFactory = Arc<dyn Fn(usize) -> Box<dyn Worker> + Send + Sync>;

/// Spawns workers, owns the main-side channel endpoints and routes envelopes
/// from workers through a [`DispatchTable`].
///
/// Lives on the main thread. Dispatch callbacks may send to workers through
/// their [`Origin`] but must not call back into the manager.
pub struct WorkerMgr {
    factory: Option<WorkerFactory>,
    table: Rc<RefCell<DispatchTable>>,
    peers: Rc<RefCell<Vec<ChannelSender>>>,
    threads: Vec<JoinHandle<()>>,
    readiness: Arc<Readiness>,
    baseline: ReloadConfig,
    watermark: usize,
}

impl Default for WorkerMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerMgr {
    pub fn new() -> Self {
        Self {
            factory: None,
            table: Rc::new(RefCell::new(DispatchTable::new())),
            peers: Rc::new(RefCell::new(Vec::new())),
            threads: Vec::new(),
            readiness: Arc::new(Readiness::new()),
            baseline: ReloadConfig::default(),
            watermark: MAX_FRAME_SIZE * DEFAULT_WATERMARK_MULTIPLE,
        }
    }

    /// Stream buffer limit of every worker reactor.
    pub fn with_watermark(mut self, watermark: usize) -> Self {
        self.watermark = watermark;
        self
    }

    /// Settings each worker applies before `init`.
    pub fn with_baseline(mut self, baseline: ReloadConfig) -> Self {
        self.baseline = baseline;
        self
    }

    /// Install the worker constructor and the main-side dispatch table.
    /// Allowed once.
    pub fn register<F>(&mut self, factory: F, table: DispatchTable) -> Result<()>
    where
        F: Fn(usize) -> Box<dyn Worker> + Send + Sync + 'static,
    {
        if self.factory.is_some() {
            return Err(Error::Worker("worker type already registered".into()));
        }
        self.factory = Some(Arc::new(factory));
        *self.table.borrow_mut() = table;
        Ok(())
    }

    /// Spawn the next worker, binding its channel to `reactor`. Refuses once
    /// `total` workers exist. Returns the new worker's id.
    pub fn create(&mut self, reactor: &mut Reactor, total: usize) -> Result<usize> {
        let factory = self
            .factory
            .clone()
            .ok_or_else(|| Error::Worker("no worker type registered".into()))?;
        let id = self.peers.borrow().len();
        if id >= total {
            return Err(Error::Worker(format!("pool already has {total} workers")));
        }

        let (left, right) = Channel::create()?.into_endpoints();
        let sender = right.bind(
            reactor,
            MainEvents {
                worker: id,
                table: Rc::clone(&self.table),
                peers: Rc::clone(&self.peers),
            },
        )?;

        let launch = Launch {
            id,
            name: format!("worker-{id}"),
            endpoint: left,
            watermark: self.watermark,
            baseline: self.baseline.clone(),
        };
        let readiness = Arc::clone(&self.readiness);
        let spawned = thread::Builder::new()
            .name(launch.name.clone())
            .spawn(move || {
                if let Err(e) = run_worker(launch, &*factory, &readiness) {
                    error!(worker = id, error = %e, "Worker failed");
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                sender.close();
                reactor.unregister(sender.handle());
                return Err(e.into());
            }
        };

        self.peers.borrow_mut().push(sender);
        self.threads.push(handle);
        info!(worker = id, "Worker created");
        Ok(id)
    }

    /// Workers created so far.
    pub fn len(&self) -> usize {
        self.peers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `total` workers have finished `init`.
    pub fn wait_for_all_workers(&self, total: usize) {
        self.readiness.wait_for(total);
    }

    /// Returns whether `total` workers came up within `timeout`.
    pub fn wait_for_all_workers_timeout(&self, total: usize, timeout: Duration) -> bool {
        self.readiness.wait_for_timeout(total, timeout)
    }

    /// Broadcast one envelope; returns how many workers accepted it.
    pub fn send_msg_to_all_workers(&self, tag: Tag, payload: &[u8]) -> usize {
        dispatch::broadcast(&self.peers.borrow(), tag, payload)
    }

    pub fn send_to_worker(&self, worker: usize, tag: Tag, payload: &[u8]) -> Result<()> {
        Origin::new(worker, &self.peers.borrow()).reply(tag, payload)
    }

    /// Close every channel so workers stop, then join their threads.
    pub fn shutdown(&mut self, reactor: &mut Reactor) {
        let peers = std::mem::take(&mut *self.peers.borrow_mut());
        for peer in &peers {
            peer.close();
            reactor.unregister(peer.handle());
        }
        for (id, handle) in self.threads.drain(..).enumerate() {
            if handle.join().is_err() {
                error!(worker = id, "Worker thread panicked");
            }
        }
        info!(workers = peers.len(), "Worker pool stopped");
    }
}

/// Main-side endpoint of one worker's channel.
struct MainEvents {
    worker: usize,
    table: Rc<RefCell<DispatchTable>>,
    peers: Rc<RefCell<Vec<ChannelSender>>>,
}

impl ChannelHandler for MainEvents {
    fn on_envelope(&mut self, reactor: &mut Reactor, envelope: Envelope<'_>) {
        let peers = self.peers.borrow();
        let origin = Origin::new(self.worker, &peers);
        self.table.borrow_mut().dispatch(reactor, &origin, envelope);
    }

    fn on_closed(&mut self, _reactor: &mut Reactor) {
        warn!(worker = self.worker, "Worker channel closed");
    }
}
