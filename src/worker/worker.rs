//! Worker threads: one reactor, one channel back to main, and the
//! application logic plugged in through [`Worker`].

use crate::config::{ReloadConfig, Settings};
use crate::error::Result;
use crate::net::NetContext;
use crate::runtime::{ChannelHandler, ChannelSender, Endpoint, Envelope, Reactor, Tag};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Application logic of one worker thread.
///
/// A worker is built on its own thread by the factory passed to
/// [`WorkerMgr::register`](super::WorkerMgr::register), so it may hold
/// thread-local state. Every method runs on that thread's reactor.
pub trait Worker {
    /// Runs once before the worker reports ready. A failure is logged; the
    /// worker still runs.
    fn init(&mut self, _ctx: &mut WorkerContext, _reactor: &mut Reactor) -> Result<()> {
        Ok(())
    }

    fn on_text(&mut self, ctx: &mut WorkerContext, _reactor: &mut Reactor, text: &str) {
        debug!(worker = ctx.id(), len = text.len(), "Ignored text envelope");
    }

    /// Default: treat the payload as a reload envelope.
    fn on_json(&mut self, ctx: &mut WorkerContext, _reactor: &mut Reactor, payload: &[u8]) {
        match ReloadConfig::from_json(payload) {
            Ok(reload) => {
                let id = ctx.id();
                let applied = reload.apply(ctx.settings_mut(), id);
                info!(worker = id, applied, "Applied config reload");
            }
            Err(e) => warn!(worker = ctx.id(), error = %e, "Rejected reload envelope"),
        }
    }

    fn on_binary(&mut self, ctx: &mut WorkerContext, _reactor: &mut Reactor, payload: &[u8]) {
        debug!(worker = ctx.id(), len = payload.len(), "Ignored binary envelope");
    }

    /// Runs once after the reactor stops.
    fn destroy(&mut self, _ctx: &mut WorkerContext, _reactor: &mut Reactor) {}
}

/// Per-thread state handed to every [`Worker`] method.
pub struct WorkerContext {
    id: usize,
    name: String,
    sender: ChannelSender,
    net: Rc<NetContext>,
    settings: Settings,
}

impl WorkerContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Write half of the channel to main.
    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Send one envelope to main.
    pub fn send(&self, tag: Tag, payload: &[u8]) -> Result<()> {
        self.sender.write(tag, payload)
    }

    /// Connections owned by this worker.
    pub fn net(&self) -> &Rc<NetContext> {
        &self.net
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

/// Startup barrier: workers signal, main waits for the count.
#[derive(Debug, Default)]
pub struct Readiness {
    ready: Mutex<usize>,
    changed: Condvar,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more worker as started.
    pub fn signal(&self) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        *ready += 1;
        self.changed.notify_all();
    }

    pub fn count(&self) -> usize {
        *self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until at least `total` workers have signalled.
    pub fn wait_for(&self, total: usize) {
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        while *ready < total {
            ready = self
                .changed
                .wait(ready)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_for`](Self::wait_for), giving up after `timeout`. Returns
    /// whether `total` was reached.
    pub fn wait_for_timeout(&self, total: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock().unwrap_or_else(PoisonError::into_inner);
        while *ready < total {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            ready = self
                .changed
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

struct Runner {
    worker: Box<dyn Worker>,
    ctx: WorkerContext,
}

/// Worker-side channel endpoint: routes envelopes into the [`Worker`] and
/// stops the reactor when main goes away.
struct WorkerEvents {
    id: usize,
    runner: Rc<RefCell<Option<Runner>>>,
}

impl ChannelHandler for WorkerEvents {
    fn on_envelope(&mut self, reactor: &mut Reactor, envelope: Envelope<'_>) {
        let mut slot = self.runner.borrow_mut();
        let Some(Runner { worker, ctx }) = slot.as_mut() else {
            return;
        };
        match envelope.tag {
            Tag::Text => match std::str::from_utf8(envelope.payload) {
                Ok(text) => worker.on_text(ctx, reactor, text),
                Err(_) => warn!(worker = self.id, "Dropped non-UTF-8 text envelope"),
            },
            Tag::Json => worker.on_json(ctx, reactor, envelope.payload),
            Tag::Binary => worker.on_binary(ctx, reactor, envelope.payload),
        }
    }

    fn on_closed(&mut self, reactor: &mut Reactor) {
        debug!(worker = self.id, "Main channel closed");
        reactor.stop();
    }
}

/// Everything a worker thread needs, moved onto it at spawn.
pub(crate) struct Launch {
    pub id: usize,
    pub name: String,
    pub endpoint: Endpoint,
    pub watermark: usize,
    pub baseline: ReloadConfig,
}

/// Body of a worker thread.
///
/// Readiness is signalled once `init` has run, or once startup has failed,
/// so main never waits on a worker that will not come up.
pub(crate) fn run_worker(
    launch: Launch,
    make: &dyn Fn(usize) -> Box<dyn Worker>,
    readiness: &Readiness,
) -> Result<()> {
    let id = launch.id;
    let started = start(launch, make);
    readiness.signal();
    let (mut reactor, runner) = started?;
    info!(worker = id, "Worker started");

    let result = reactor.run_until_stopped();

    let taken = runner.borrow_mut().take();
    if let Some(Runner {
        mut worker,
        mut ctx,
    }) = taken
    {
        worker.destroy(&mut ctx, &mut reactor);
        ctx.net.close_all(&mut reactor, "worker stopped");
        ctx.sender.close();
    }
    info!(worker = id, "Worker stopped");
    result.map_err(Into::into)
}

fn start(
    launch: Launch,
    make: &dyn Fn(usize) -> Box<dyn Worker>,
) -> Result<(Reactor, Rc<RefCell<Option<Runner>>>)> {
    let Launch {
        id,
        name,
        endpoint,
        watermark,
        baseline,
    } = launch;

    let mut reactor = Reactor::with_watermark(watermark)?;
    let runner = Rc::new(RefCell::new(None));
    let sender = endpoint.bind(
        &mut reactor,
        WorkerEvents {
            id,
            runner: Rc::clone(&runner),
        },
    )?;

    let mut settings = Settings::default();
    baseline.apply(&mut settings, id);
    let mut ctx = WorkerContext {
        id,
        name,
        sender,
        net: Rc::new(NetContext::new()),
        settings,
    };

    let mut worker = make(id);
    if let Err(e) = worker.init(&mut ctx, &mut reactor) {
        error!(worker = id, error = %e, "Worker init failed");
    }
    *runner.borrow_mut() = Some(Runner { worker, ctx });
    Ok((reactor, runner))
}
