//! Worker subprocess pool.
//!
//! A [`Pool`] keeps an ordered set of worker processes, each driven through a
//! [`Worker`] handle. Units of work travel to a worker over its stdin, and the worker
//! reports `busy`/`failed`/`dead` snapshots back over a dedicated status pipe. The
//! controller blocks on neither: scheduling pushes onto a queue that a writer thread
//! feeds into the pipe, and every state query drains what has arrived and keeps only
//! the newest snapshot.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Controller    │
//!                     │  Pool<U> + tx   │
//!                     └────────┬────────┘
//!          work (stdin) │      │      ▲ status (pipe)
//!               ┌───────┼──────┼──────┼───────┐
//!               │       ▼      │      │       │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         │ dispatch  │  │ dispatch  │  │ dispatch  │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker has its own memory space
//! - **Least-loaded dispatch**: units go to the worker with the fewest dispatches
//! - **Failure capture**: errors and panics in a unit are reported with a backtrace
//! - **Lifecycle control**: graceful stop (SIGTERM), forceful stop (SIGKILL), restart,
//!   resize, and deadline-bounded shutdown with escalation

mod channel;
mod handle;
mod ipc;
mod pool;
mod proc;
mod protocol;
mod signals;
mod spawn;
pub mod worker_main;

pub use handle::Worker;
pub use pool::{Pool, PoolConfig, PoolStats, WORKERS_ENV};
pub use protocol::{Status, WorkRequest};
pub use signals::TerminationReason;
pub use spawn::{DEFAULT_POLL_INTERVAL, POLL_INTERVAL_ENV, WORKER_ENV, WorkerCommand};
pub use worker_main::{DispatchConfig, is_worker_process, run_worker_main};
