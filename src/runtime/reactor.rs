//! Single-threaded readiness/timer dispatch loop.
//!
//! Readiness-based model: poll tells us when sources are ready, then the
//! registered [`EventHandler`] performs non-blocking reads and writes.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A reactor is created on, and never leaves, the thread that runs it.
//! Handlers are checked out of the token slab while they run, so a handler
//! may freely register new sources, arm timers, or unregister itself.

use super::stream::{BufferedStream, Transport};
use super::timer::{TimerCallback, Timers};
use super::token::{EventHandle, TokenAllocator};
use mio::event::Source;
use mio::{Events, Interest, Poll, Registry};
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

/// Largest single frame the core expects to move in one piece.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default multiple of [`MAX_FRAME_SIZE`] that may sit in a stream buffer.
pub const DEFAULT_WATERMARK_MULTIPLE: usize = 4;

const EVENTS_CAPACITY: usize = 1024;

/// Callbacks bound to one registered event source.
///
/// Each method runs on the reactor thread and must return promptly; there is
/// no blocking in the core. Panics are not caught.
pub trait EventHandler {
    /// Source is readable, or the peer half-closed.
    fn on_readable(&mut self, reactor: &mut Reactor);

    /// Source is writable. For an outbound connect this is the
    /// connect-completion notification.
    fn on_writable(&mut self, _reactor: &mut Reactor) {}

    /// Source reported an error condition.
    fn on_error(&mut self, reactor: &mut Reactor, error: io::Error) {
        let _ = error;
        self.on_readable(reactor);
    }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    handle: EventHandle,
    readable: bool,
    writable: bool,
    error: bool,
}

/// Event dispatch loop owning registered sources and named timers.
pub struct Reactor {
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    handlers: TokenAllocator<Box<dyn EventHandler>>,
    timers: Timers,
    stopped: bool,
    stop_at: Option<Instant>,
    watermark: usize,
}

impl Reactor {
    /// Create a reactor with the default watermark.
    pub fn new() -> io::Result<Self> {
        Self::with_watermark(MAX_FRAME_SIZE * DEFAULT_WATERMARK_MULTIPLE)
    }

    /// Create a reactor whose buffered streams hold at most `watermark` bytes
    /// per direction before backpressure applies.
    pub fn with_watermark(watermark: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            handlers: TokenAllocator::new(EVENTS_CAPACITY),
            timers: Timers::default(),
            stopped: false,
            stop_at: None,
            watermark,
        })
    }

    /// Buffer limit applied to every stream created by this reactor.
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Register `source` and bind `handler` to its readiness events.
    pub fn register<S>(
        &mut self,
        source: &mut S,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<EventHandle>
    where
        S: Source + ?Sized,
    {
        let handle = self.handlers.alloc(handler);
        if let Err(e) = self.poll.registry().register(source, handle.token(), interest) {
            self.handlers.free(handle);
            return Err(e);
        }
        trace!(token = handle.token().0, "Registered event");
        Ok(handle)
    }

    /// Register `source`, then build its handler with `make`, which receives
    /// ownership of the source together with the handle it was registered
    /// under.
    pub fn register_with<S, H, F>(
        &mut self,
        mut source: S,
        interest: Interest,
        make: F,
    ) -> io::Result<EventHandle>
    where
        S: Source,
        H: EventHandler + 'static,
        F: FnOnce(S, EventHandle) -> H,
    {
        let handle = self.handlers.next_handle();
        self.poll
            .registry()
            .register(&mut source, handle.token(), interest)?;
        let handler = make(source, handle);
        let allocated = self.handlers.alloc(Box::new(handler));
        debug_assert_eq!(allocated, handle);
        trace!(token = handle.token().0, "Registered event");
        Ok(handle)
    }

    /// Change the interest set of an already registered source.
    pub fn reregister<S>(
        &mut self,
        handle: EventHandle,
        source: &mut S,
        interest: Interest,
    ) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .reregister(source, handle.token(), interest)
    }

    /// Deregister `source` and drop its handler.
    pub fn deregister<S>(&mut self, handle: EventHandle, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.unregister(handle);
        self.poll.registry().deregister(source)
    }

    /// Drop the handler bound to `handle`.
    ///
    /// Synchronous: no callback fires for `handle` afterwards. If the handler
    /// is the one currently running it finishes and is dropped on return.
    /// Returns whether the handle was live.
    pub fn unregister(&mut self, handle: EventHandle) -> bool {
        let live = self.handlers.contains(handle);
        drop(self.handlers.free(handle));
        live
    }

    /// Whether `handle` is still registered.
    pub fn is_registered(&self, handle: EventHandle) -> bool {
        self.handlers.contains(handle)
    }

    /// Number of registered sources.
    pub fn registered(&self) -> usize {
        self.handlers.len()
    }

    /// Arm a one-shot timer under `id`, replacing any timer with that id.
    pub fn add_timer<F>(&mut self, id: u32, delay: Duration, callback: F)
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.timers.insert(id, delay, None, Box::new(callback) as TimerCallback);
    }

    /// Arm a timer firing every `period` under `id`, replacing any timer with
    /// that id.
    pub fn add_persistent_timer<F>(&mut self, id: u32, period: Duration, callback: F)
    where
        F: FnMut(&mut Reactor) + 'static,
    {
        self.timers
            .insert(id, period, Some(period), Box::new(callback) as TimerCallback);
    }

    /// Disarm timer `id`. Returns whether it was armed.
    pub fn remove_timer(&mut self, id: u32) -> bool {
        self.timers.remove(id)
    }

    pub fn has_timer(&self, id: u32) -> bool {
        self.timers.contains(id)
    }

    /// Stop the loop once the current iteration finishes.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Stop the loop after `delay` has elapsed.
    pub fn stop_after(&mut self, delay: Duration) {
        self.stop_at = Some(Instant::now() + delay);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Wrap a transport in a buffered stream bounded by this reactor's
    /// watermark.
    pub fn buffered(&self, transport: Transport) -> BufferedStream {
        BufferedStream::new(transport, self.watermark)
    }

    /// Dispatch events until [`stop`](Self::stop) is called or the
    /// [`stop_after`](Self::stop_after) deadline passes.
    pub fn run_until_stopped(&mut self) -> io::Result<()> {
        self.stopped = false;
        while !self.stopped {
            self.run_once(None)?;
        }
        self.stop_at = None;
        Ok(())
    }

    /// Poll once, waiting at most `max_wait` (or until the next timer), then
    /// dispatch ready sources and due timers.
    ///
    /// Returns the number of readiness events dispatched.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> io::Result<usize> {
        let now = Instant::now();
        if let Some(at) = self.stop_at {
            if now >= at {
                self.stop_at = None;
                self.stopped = true;
                return Ok(0);
            }
        }

        let timeout = [
            self.timers.next_timeout(now),
            self.stop_at.map(|at| at.saturating_duration_since(now)),
            max_wait,
        ]
        .into_iter()
        .flatten()
        .min();

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.extend(self.events.iter().map(|event| Readiness {
            handle: EventHandle(event.token()),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable(),
            error: event.is_error(),
        }));

        let dispatched = ready.len();
        for readiness in ready.drain(..) {
            self.dispatch(readiness);
        }
        self.ready = ready;

        self.fire_timers();
        Ok(dispatched)
    }

    fn dispatch(&mut self, readiness: Readiness) {
        let handle = readiness.handle;
        let Some(mut handler) = self.handlers.take(handle) else {
            trace!(token = handle.token().0, "Stale event ignored");
            return;
        };

        if readiness.error {
            handler.on_error(self, io::Error::new(io::ErrorKind::Other, "socket error"));
        } else {
            if readiness.readable {
                handler.on_readable(self);
            }
            if readiness.writable && self.handlers.contains(handle) {
                handler.on_writable(self);
            }
        }

        // Freed while running: drop it here, after the callback returned
        drop(self.handlers.restore(handle, handler));
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for (id, generation) in self.timers.expired(now) {
            let Some(mut callback) = self.timers.take(id, generation) else {
                continue;
            };
            callback(self);
            self.timers.finish(id, generation, callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::UnixStream;
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::rc::Rc;

    struct CountingReader {
        stream: UnixStream,
        handle: EventHandle,
        reads: Rc<Cell<usize>>,
    }

    impl EventHandler for CountingReader {
        fn on_readable(&mut self, reactor: &mut Reactor) {
            let mut buf = [0u8; 64];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => {
                        reactor.unregister(self.handle);
                        reactor.stop();
                        return;
                    }
                    Ok(_) => self.reads.set(self.reads.get() + 1),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => return,
                }
            }
        }
    }

    #[test]
    fn test_dispatch_and_self_unregister() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();

        let reads = Rc::new(Cell::new(0));
        let r = Rc::clone(&reads);
        let handle = reactor
            .register_with(a, Interest::READABLE, move |stream, handle| CountingReader {
                stream,
                handle,
                reads: r,
            })
            .unwrap();
        assert!(reactor.is_registered(handle));

        b.write_all(b"hello").unwrap();
        drop(b);

        reactor.stop_after(Duration::from_secs(5));
        reactor.run_until_stopped().unwrap();

        assert!(reads.get() >= 1);
        assert!(!reactor.is_registered(handle));
        assert_eq!(reactor.registered(), 0);
    }

    #[test]
    fn test_timers_fire_in_order_and_replace() {
        let mut reactor = Reactor::new().unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = Rc::clone(&log);
        reactor.add_timer(1, Duration::from_millis(30), move |_| l.borrow_mut().push("replaced"));
        let l = Rc::clone(&log);
        reactor.add_timer(1, Duration::from_millis(20), move |_| l.borrow_mut().push("one"));
        let l = Rc::clone(&log);
        reactor.add_timer(2, Duration::from_millis(1), move |_| l.borrow_mut().push("two"));
        let l = Rc::clone(&log);
        reactor.add_timer(3, Duration::from_millis(50), move |r| {
            l.borrow_mut().push("stop");
            r.stop();
        });

        reactor.run_until_stopped().unwrap();
        assert_eq!(*log.borrow(), vec!["two", "one", "stop"]);
        assert!(!reactor.has_timer(1));
    }

    #[test]
    fn test_persistent_timer_until_removed() {
        let mut reactor = Reactor::new().unwrap();
        let ticks = Rc::new(Cell::new(0));

        let t = Rc::clone(&ticks);
        reactor.add_persistent_timer(9, Duration::from_millis(2), move |r| {
            t.set(t.get() + 1);
            if t.get() == 3 {
                r.remove_timer(9);
                r.stop();
            }
        });

        reactor.stop_after(Duration::from_secs(5));
        reactor.run_until_stopped().unwrap();
        assert_eq!(ticks.get(), 3);
        assert!(!reactor.has_timer(9));
    }

    #[test]
    fn test_stop_after_ends_idle_loop() {
        let mut reactor = Reactor::new().unwrap();
        let start = Instant::now();
        reactor.stop_after(Duration::from_millis(10));
        reactor.run_until_stopped().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
