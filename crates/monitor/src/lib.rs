//! Heavyweight object monitors for a managed runtime.
//!
//! A [`MonitorRuntime`] inflates objects that carry an
//! [`ObjectHeader`](objectmodel::ObjectHeader) into [`ObjectMonitor`]s, which
//! native threads and virtual threads (futures) can lock, wait on and
//! notify. Idle monitors are deflated in the background.

pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use runtime::{MonitorRuntime, MonitorRuntimeBuilder};
pub use sync::{MonitorError, ObjectMonitor, Owner, WaitOutcome};
