//! Worker pool.
//!
//! The main thread owns a [`WorkerMgr`]. Each worker thread owns a reactor,
//! the worker side of a channel, and a [`Worker`] built on that thread.
//! Envelopes from main land in the `Worker` methods; envelopes from workers
//! land in the main-side [`DispatchTable`].

pub mod dispatch;
pub mod manager;
#[allow(clippy::module_inception)]
pub mod worker;

pub use dispatch::{DispatchTable, MainCallback, Origin};
pub use manager::{WorkerFactory, WorkerMgr};
pub use worker::{Readiness, Worker, WorkerContext};
