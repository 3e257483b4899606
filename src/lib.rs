//! procpool - a pool of worker subprocesses.
//!
//! Units of work are serialized to JSON, sent to worker processes over pipes, and
//! executed there one at a time. The controller tracks each worker's busy, failed
//! and dead state without blocking, dispatches to the least-loaded worker, and can
//! resize, restart, or shut the pool down.
//!
//! A program hosting a pool re-executes itself as the worker:
//!
//! ```no_run
//! use procpool::builtin::Task;
//! use procpool::worker::{DispatchConfig, is_worker_process, run_worker_main};
//! use procpool::{Pool, PoolConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     if is_worker_process() {
//!         run_worker_main::<Task>(DispatchConfig::from_env());
//!     }
//!
//!     let mut pool: Pool<Task> = Pool::new(PoolConfig::for_current_exe()?.with_size(2))?;
//!     pool.schedule(&Task::Noop)?;
//!     pool.shutdown(None)?;
//!     Ok(())
//! }
//! ```

pub mod builtin;
pub mod error;
pub mod logging;
pub mod unit;
pub mod worker;

pub use error::{PoolError, Result};
pub use unit::Unit;
pub use worker::{Pool, PoolConfig, PoolStats, Worker, WorkerCommand};
