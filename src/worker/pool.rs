//! Worker pool with least-loaded dispatch.
//!
//! Manages an ordered set of worker subprocesses. Growth appends at the tail and
//! shrinking removes from the tail, so the oldest workers are the most stable.

use super::handle::Worker;
use super::spawn::{POLL_INTERVAL_ENV, WorkerCommand};
use crate::error::{PoolError, Result};
use crate::unit::Unit;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Environment variable overriding the pool size.
pub const WORKERS_ENV: &str = "PROCPOOL_WORKERS";

/// Pool size used when the available parallelism cannot be determined.
const FALLBACK_WORKERS: usize = 4;

/// How often a deadline-bounded shutdown checks for exited workers.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker processes to spawn.
    pub size: usize,
    /// How worker processes are launched.
    pub command: WorkerCommand,
    /// Label attached to the pool's log output.
    pub name: String,
}

impl PoolConfig {
    /// A pool of `size` workers launched with `command`.
    pub fn new(size: usize, command: WorkerCommand) -> Self {
        Self {
            size,
            command,
            name: "pool".to_string(),
        }
    }

    /// A pool sized to the available parallelism that re-executes the current binary.
    pub fn for_current_exe() -> Result<Self> {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(FALLBACK_WORKERS);
        Ok(Self::new(size, WorkerCommand::current_exe()?))
    }

    /// Set the pool size.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the idle poll interval handed to workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.command = self.command.with_poll_interval(interval);
        self
    }

    /// Set the label used in log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `PROCPOOL_WORKERS` for the size and `PROCPOOL_POLL_INTERVAL_MS` for the
    /// idle poll interval. Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(size) = std::env::var(WORKERS_ENV)
            && let Ok(size) = size.parse()
        {
            self.size = size;
        }
        if let Ok(millis) = std::env::var(POLL_INTERVAL_ENV)
            && let Ok(millis) = millis.parse()
        {
            self = self.with_poll_interval(Duration::from_millis(millis));
        }
        self
    }
}

/// Pick the worker with the fewest dispatched units among those still alive.
///
/// Ties go to the earliest position. Returns `None` when nothing is alive.
fn least_loaded(candidates: impl IntoIterator<Item = (bool, u64)>) -> Option<usize> {
    let mut best: Option<(usize, u64)> = None;
    for (idx, (alive, frequency)) in candidates.into_iter().enumerate() {
        if !alive {
            continue;
        }
        if best.is_none_or(|(_, lowest)| frequency < lowest) {
            best = Some((idx, frequency));
        }
    }
    best.map(|(idx, _)| idx)
}

/// Positions of the last `count` alive workers, from the tail backwards.
fn tail_positions(alive: &[bool], count: usize) -> Vec<usize> {
    alive
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, alive)| **alive)
        .map(|(idx, _)| idx)
        .take(count)
        .collect()
}

/// A pool of worker subprocesses.
pub struct Pool<U: Unit> {
    workers: Vec<Worker<U>>,
    command: Arc<WorkerCommand>,
    name: String,
}

impl<U: Unit> Pool<U> {
    /// Create a new pool and spawn its worker processes.
    pub fn new(config: PoolConfig) -> Result<Self> {
        let command = Arc::new(config.command);
        info!(
            pool = %config.name,
            workers = config.size,
            program = %command.program().display(),
            poll_interval_ms = command.poll_interval().as_millis(),
            "Initializing worker pool"
        );

        let mut workers = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            workers.push(Worker::spawn(Arc::clone(&command))?);
        }

        Ok(Self {
            workers,
            command,
            name: config.name,
        })
    }

    /// Number of workers in the sequence, dead ones included.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// All workers, in order.
    pub fn workers(&self) -> &[Worker<U>] {
        &self.workers
    }

    /// Mutable access to all workers, in order.
    pub fn workers_mut(&mut self) -> &mut [Worker<U>] {
        &mut self.workers
    }

    /// Label given to this pool in its configuration.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers not known to be dead.
    pub fn size(&mut self) -> usize {
        self.workers
            .iter_mut()
            .map(|w| w.is_dead())
            .filter(|dead| !dead)
            .count()
    }

    /// Whether every alive worker is busy. True for a pool with no alive workers.
    pub fn is_dry(&mut self) -> bool {
        self.workers.iter_mut().all(|w| w.is_dead() || w.is_busy())
    }

    /// Workers that reported a failed unit.
    pub fn failed_workers(&mut self) -> Vec<&mut Worker<U>> {
        self.workers
            .iter_mut()
            .filter_map(|w| if w.is_failed() { Some(w) } else { None })
            .collect()
    }

    /// Dispatch a unit to the alive worker with the fewest dispatched units.
    ///
    /// A chosen worker that turns out to have exited is skipped in favour of the next
    /// candidate.
    pub fn schedule(&mut self, unit: &U) -> Result<&mut Worker<U>> {
        let mut candidates: Vec<(bool, u64)> = self
            .workers
            .iter_mut()
            .map(|w| (!w.is_dead(), w.frequency()))
            .collect();
        loop {
            let idx = least_loaded(candidates.iter().copied()).ok_or(PoolError::DeadPool)?;
            match self.workers[idx].schedule(unit).map(|_| ()) {
                Ok(()) => return Ok(&mut self.workers[idx]),
                Err(PoolError::DeadWorker { pid }) => {
                    debug!(pool = %self.name, pid, "Selected worker has exited, trying the next one");
                    candidates[idx].0 = false;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Dispatch the same unit to every alive worker.
    ///
    /// A targeted worker whose work channel turns out to be closed fails the whole call
    /// with [`PoolError::DeadWorker`]; workers before it keep the unit.
    #[instrument(level = "debug", skip(self, unit), fields(pool = %self.name))]
    pub fn broadcast(&mut self, unit: &U) -> Result<Vec<&mut Worker<U>>> {
        let mut targeted = Vec::new();
        for worker in self.workers.iter_mut() {
            if worker.is_dead() {
                continue;
            }
            worker.schedule(unit)?;
            targeted.push(worker);
        }
        if targeted.is_empty() {
            return Err(PoolError::DeadPool);
        }
        debug!(workers = targeted.len(), "Broadcast unit");
        Ok(targeted)
    }

    /// Resize the pool to `new_size` alive workers.
    ///
    /// Shrinking stops workers from the tail (killing them if `force`) and removes
    /// them; growing appends freshly spawned workers.
    #[instrument(level = "debug", skip(self), fields(pool = %self.name))]
    pub fn resize(&mut self, new_size: usize, force: bool) -> Result<()> {
        let alive: Vec<bool> = self.workers.iter_mut().map(|w| !w.is_dead()).collect();
        let current = alive.iter().filter(|a| **a).count();

        if new_size < current {
            let mut positions = tail_positions(&alive, current - new_size);
            info!(from = current, to = new_size, force, "Shrinking worker pool");
            let mut first_err = None;
            for &idx in &positions {
                let worker = &mut self.workers[idx];
                let result = if force {
                    worker.shutdown_force()
                } else {
                    worker.shutdown()
                };
                if let Err(e) = result {
                    warn!(pid = %worker.pid(), error = %e, "Failed to stop worker during shrink");
                    first_err.get_or_insert(e);
                }
            }
            positions.sort_unstable();
            for idx in positions.into_iter().rev() {
                self.workers.remove(idx);
            }
            if let Some(e) = first_err {
                return Err(e);
            }
        } else if new_size > current {
            info!(from = current, to = new_size, "Growing worker pool");
            for _ in current..new_size {
                self.workers.push(Worker::spawn(Arc::clone(&self.command))?);
            }
        }
        Ok(())
    }

    /// Add `n` workers.
    pub fn expand(&mut self, n: usize) -> Result<()> {
        let size = self.size();
        self.resize(size + n, false)
    }

    /// Add `n` workers. Growing never stops anything, so this matches [`expand`](Self::expand).
    pub fn expand_force(&mut self, n: usize) -> Result<()> {
        let size = self.size();
        self.resize(size + n, true)
    }

    /// Gracefully remove `n` workers from the tail.
    pub fn shrink(&mut self, n: usize) -> Result<()> {
        self.shrink_with(n, false)
    }

    /// Forcefully remove `n` workers from the tail.
    pub fn shrink_force(&mut self, n: usize) -> Result<()> {
        self.shrink_with(n, true)
    }

    fn shrink_with(&mut self, n: usize, force: bool) -> Result<()> {
        let alive = self.size();
        if n > alive {
            return Err(PoolError::InvalidShrink {
                requested: n,
                alive,
            });
        }
        self.resize(alive - n, force)
    }

    /// Gracefully stop every alive worker.
    ///
    /// Without a timeout, each worker finishes its queued units before exiting. With a
    /// timeout, workers still running when it elapses are killed.
    #[instrument(level = "debug", skip(self), fields(pool = %self.name))]
    pub fn shutdown(&mut self, timeout: Option<Duration>) -> Result<()> {
        match timeout {
            None => {
                let mut first_err = None;
                for worker in self.workers.iter_mut() {
                    if let Err(e) = worker.shutdown() {
                        warn!(pid = %worker.pid(), error = %e, "Failed to stop worker");
                        first_err.get_or_insert(e);
                    }
                }
                first_err.map_or(Ok(()), Err)
            }
            Some(timeout) => self.shutdown_within(timeout),
        }
    }

    fn shutdown_within(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut first_err = None;

        let mut stopping = Vec::new();
        for (idx, worker) in self.workers.iter_mut().enumerate() {
            if worker.is_dead() {
                // Dead workers only need reaping, which never waits long.
                if let Err(e) = worker.shutdown() {
                    first_err.get_or_insert(e);
                }
                continue;
            }
            match worker.request_stop() {
                Ok(()) => stopping.push(idx),
                Err(e) => {
                    warn!(pid = %worker.pid(), error = %e, "Failed to request worker stop");
                    first_err.get_or_insert(e);
                }
            }
        }

        while !stopping.is_empty() {
            let mut still_running = Vec::with_capacity(stopping.len());
            for idx in stopping {
                match self.workers[idx].try_confirm_exit() {
                    Ok(true) => {}
                    Ok(false) => still_running.push(idx),
                    Err(e) => {
                        first_err.get_or_insert(e);
                        still_running.push(idx);
                    }
                }
            }
            stopping = still_running;

            if stopping.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = timeout.as_millis(),
                    remaining = stopping.len(),
                    "Shutdown timeout elapsed, switching to forceful shutdown"
                );
                for idx in stopping {
                    if let Err(e) = self.workers[idx].shutdown_force() {
                        first_err.get_or_insert(e);
                    }
                }
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Kill every worker immediately.
    #[instrument(level = "debug", skip(self), fields(pool = %self.name))]
    pub fn shutdown_force(&mut self) -> Result<()> {
        let mut first_err = None;
        for worker in self.workers.iter_mut() {
            if let Err(e) = worker.shutdown_force() {
                warn!(pid = %worker.pid(), error = %e, "Failed to kill worker");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Get statistics about the worker pool.
    pub fn stats(&mut self) -> PoolStats {
        let mut stats = PoolStats {
            worker_count: self.workers.len(),
            ..PoolStats::default()
        };
        for worker in self.workers.iter_mut() {
            stats.total_dispatched += worker.frequency();
            if worker.is_failed() {
                stats.failed += 1;
            }
            if !worker.is_dead() {
                stats.alive += 1;
                if worker.is_busy() {
                    stats.busy += 1;
                }
            }
        }
        stats
    }
}

impl<U: Unit> Drop for Pool<U> {
    fn drop(&mut self) {
        let _ = self.shutdown_force();
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of workers in the sequence.
    pub worker_count: usize,
    /// Workers not known to be dead.
    pub alive: usize,
    /// Alive workers executing a unit.
    pub busy: usize,
    /// Workers that reported a failed unit.
    pub failed: usize,
    /// Units dispatched since each worker was last (re)spawned.
    pub total_dispatched: u64,
}
