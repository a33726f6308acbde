//! gatehouse: a multi-worker protocol gateway
//!
//! The main thread supervises a pool of worker threads, each running its
//! own reactor. Workers terminate client connections on the configured
//! listen URIs:
//! - raw TCP and Unix streams
//! - WebSocket (`ws://`)
//! - HAProxy PROXY protocol in front of either (`haproxy->ws://`)
//!
//! Signals:
//! - SIGHUP re-reads the configuration file and broadcasts it to workers
//! - SIGINT / SIGTERM stop the pool and exit

use gatehouse::config::Config;
use gatehouse::gateway::{self, GatewayWorker};
use gatehouse::runtime::{Reactor, Tag};
use gatehouse::worker::{Worker, WorkerMgr};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const SIGNAL_TIMER: u32 = 1;
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_reload_signal(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_shutdown_signal(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let reload = on_reload_signal as extern "C" fn(libc::c_int);
    let shutdown = on_shutdown_signal as extern "C" fn(libc::c_int);
    // SAFETY: the handlers only store to atomics, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGHUP, reload as libc::sighandler_t);
        libc::signal(libc::SIGINT, shutdown as libc::sighandler_t);
        libc::signal(libc::SIGTERM, shutdown as libc::sighandler_t);
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging behind a reloadable filter
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let (filter, filter_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    info!(
        listen = ?config.listen,
        workers = config.workers,
        watermark = config.watermark(),
        heartbeat = ?config.heartbeat,
        "Starting gatehouse"
    );

    install_signal_handlers();
    let mut reactor = Reactor::with_watermark(config.watermark())?;

    let mut mgr = WorkerMgr::new()
        .with_watermark(config.watermark())
        .with_baseline(config.reload_envelope());
    let listen = config.listen.clone();
    let heartbeat = config.heartbeat;
    mgr.register(
        move |_| Box::new(GatewayWorker::new(listen.clone(), heartbeat)) as Box<dyn Worker>,
        gateway::main_dispatch(),
    )?;

    let total = config.workers;
    for _ in 0..total {
        mgr.create(&mut reactor, total)?;
    }
    mgr.wait_for_all_workers(total);
    info!(workers = total, "All workers ready");

    let mgr = Rc::new(RefCell::new(mgr));
    let config = Rc::new(RefCell::new(config));
    {
        let mgr = Rc::clone(&mgr);
        let config = Rc::clone(&config);
        reactor.add_persistent_timer(SIGNAL_TIMER, SIGNAL_POLL_INTERVAL, move |reactor| {
            if SHUTDOWN_REQUESTED.swap(false, Ordering::SeqCst) {
                info!("Shutdown requested");
                reactor.stop();
                return;
            }
            if RELOAD_REQUESTED.swap(false, Ordering::SeqCst) {
                reload_config(&config, &mgr.borrow(), &filter_handle);
            }
        });
    }

    reactor.run_until_stopped()?;

    mgr.borrow_mut().shutdown(&mut reactor);
    info!("Server stopped");
    Ok(())
}

/// Re-read the configuration file, apply the log level here and broadcast
/// the reloadable keys to every worker.
fn reload_config(config: &RefCell<Config>, mgr: &WorkerMgr, filter: &FilterHandle) {
    let fresh = match config.borrow().reload() {
        Ok(fresh) => fresh,
        Err(e) => {
            error!(error = %e, "Config reload failed");
            return;
        }
    };

    if let Err(e) = filter.reload(EnvFilter::new(&fresh.log_level)) {
        warn!(error = %e, "Log level not changed");
    }
    if fresh.listen != config.borrow().listen || fresh.workers != config.borrow().workers {
        warn!("Listen URIs and worker count apply on restart only");
    }

    match fresh.reload_envelope().to_json() {
        Ok(json) => {
            let sent = mgr.send_msg_to_all_workers(Tag::Json, &json);
            info!(workers = sent, "Config reloaded");
        }
        Err(e) => error!(error = %e, "Config reload failed"),
    }
    *config.borrow_mut() = fresh;
}
