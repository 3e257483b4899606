//! Controller-side handle for one worker subprocess.

use super::channel::{StatusChannel, WorkChannel};
use super::proc::Proc;
use super::protocol::Status;
use super::signals::TerminationReason;
use super::spawn::{SpawnedWorker, WorkerCommand, spawn_worker};
use crate::error::{PoolError, Result};
use crate::unit::Unit;
use nix::unistd::Pid;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// A worker subprocess together with the controller's view of its state.
///
/// State queries are lazy: each one first drains the status channel and keeps only
/// the most recent snapshot. Nothing here waits for the worker to publish, except
/// [`shutdown`](Worker::shutdown) and [`shutdown_force`](Worker::shutdown_force),
/// which block until the process has been reaped.
pub struct Worker<U> {
    command: Arc<WorkerCommand>,
    work: WorkChannel<U>,
    status: StatusChannel,
    proc: Proc,
    /// Units accepted since the last spawn.
    frequency: u64,
    /// Last status reported by the worker.
    snapshot: Status,
    /// A shutdown was issued and the exit has been observed.
    terminated: bool,
    /// SIGTERM has been sent to the current process.
    stop_signalled: bool,
}

impl<U: Unit> Worker<U> {
    /// Start a new worker process.
    pub fn spawn(command: Arc<WorkerCommand>) -> Result<Self> {
        let SpawnedWorker { proc, work, status } = spawn_worker(&command)?;
        debug!(pid = %proc.pid(), program = %command.program().display(), "Spawned worker");
        Ok(Self {
            command,
            work,
            status,
            proc,
            frequency: 0,
            snapshot: Status::default(),
            terminated: false,
            stop_signalled: false,
        })
    }

    /// Process ID of the current subprocess.
    pub fn pid(&self) -> Pid {
        self.proc.pid()
    }

    /// Number of units scheduled on this worker since it was (re)spawned.
    pub fn frequency(&self) -> u64 {
        self.frequency
    }

    /// Enqueue a unit on this worker.
    ///
    /// Fails with [`PoolError::DeadWorker`] when the worker is known to be dead or its
    /// work pipe has been closed. The unit is only queued: this never waits for the
    /// worker to read or run it.
    pub fn schedule(&mut self, unit: &U) -> Result<&mut Self> {
        if self.is_dead() {
            return Err(PoolError::DeadWorker {
                pid: self.pid().as_raw(),
            });
        }
        match self.work.send(self.frequency + 1, unit) {
            Ok(()) => {
                self.frequency += 1;
                Ok(self)
            }
            Err(PoolError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(pid = %self.pid(), "Work channel closed by worker");
                Err(PoolError::DeadWorker {
                    pid: self.pid().as_raw(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the worker is executing a unit.
    pub fn is_busy(&mut self) -> bool {
        self.synchronize();
        !self.terminated && self.snapshot.busy
    }

    /// Whether a unit failed on this worker.
    pub fn is_failed(&mut self) -> bool {
        self.synchronize();
        self.snapshot.failed
    }

    /// Whether the worker process has stopped.
    pub fn is_dead(&mut self) -> bool {
        if self.terminated {
            return true;
        }
        self.synchronize();
        self.snapshot.dead
    }

    /// Failure report of the unit that killed this worker, if any.
    pub fn backtrace(&mut self) -> Option<&str> {
        self.synchronize();
        self.snapshot.backtrace.as_deref()
    }

    /// Stop the worker once its queued work is done, and wait for it to exit.
    ///
    /// Does nothing if the worker is already dead.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.is_dead() {
            return self.reap_dead();
        }
        self.work.flush();
        self.signal_stop_when_flushed()?;
        let reason = self.proc.wait()?;
        self.confirm_exit(&reason);
        Ok(())
    }

    /// Kill the worker immediately and wait for it to exit.
    ///
    /// Whatever unit was running is lost. Calling this again is harmless.
    pub fn shutdown_force(&mut self) -> Result<()> {
        let reason = self.proc.kill()?;
        if !self.terminated {
            self.confirm_exit(&reason);
        }
        Ok(())
    }

    /// Replace the process with a fresh one: new channels, clean snapshot, frequency 0.
    pub fn restart(&mut self) -> Result<()> {
        self.shutdown()?;
        let old_pid = self.pid();
        *self = Self::spawn(Arc::clone(&self.command))?;
        debug!(old_pid = %old_pid, pid = %self.pid(), "Restarted worker");
        Ok(())
    }

    /// Begin a graceful stop without waiting.
    ///
    /// The work channel is closed at once; the stop notification follows as soon as the
    /// units still queued have reached the pipe.
    pub(crate) fn request_stop(&mut self) -> Result<()> {
        self.work.close();
        self.signal_stop_when_flushed()
    }

    fn signal_stop_when_flushed(&mut self) -> Result<()> {
        if !self.stop_signalled && self.work.is_flushed() {
            debug!(pid = %self.pid(), "Requesting worker stop");
            self.proc.request_stop()?;
            self.stop_signalled = true;
        }
        Ok(())
    }

    /// Check without blocking whether a stopping worker has exited.
    pub(crate) fn try_confirm_exit(&mut self) -> Result<bool> {
        if self.terminated {
            return Ok(true);
        }
        self.signal_stop_when_flushed()?;
        match self.proc.try_wait()? {
            Some(reason) => {
                self.confirm_exit(&reason);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record an observed exit and merge the final status message.
    fn confirm_exit(&mut self, reason: &TerminationReason) {
        self.work.close();
        if let Some(last) = self.status.finish() {
            self.snapshot = last;
        }
        self.terminated = true;
        debug!(
            pid = %self.pid(),
            reason = %reason,
            failed = self.snapshot.failed,
            "Worker exited"
        );
    }

    /// Reap a worker that died on its own.
    fn reap_dead(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        let reason = self.proc.wait()?;
        self.confirm_exit(&reason);
        Ok(())
    }

    /// Replace the snapshot with the latest status the worker published.
    fn synchronize(&mut self) {
        if self.terminated {
            return;
        }
        let was_failed = self.snapshot.failed;
        if let Some(latest) = self.status.try_latest() {
            self.snapshot = latest;
        }

        if !self.snapshot.dead && self.status.is_disconnected() {
            // The status stream ended without a final report: the process crashed or
            // was killed from outside. Classify it once it can be reaped.
            if let Ok(Some(reason)) = self.proc.try_wait() {
                self.snapshot = vanished_status(&reason);
            }
        }

        if self.snapshot.failed && !was_failed {
            warn!(
                pid = %self.pid(),
                frequency = self.frequency,
                "Worker failed while executing a unit"
            );
        }
    }
}

/// Snapshot for a worker whose process ended without reporting a final status.
fn vanished_status(reason: &TerminationReason) -> Status {
    if reason.is_success() {
        Status {
            dead: true,
            ..Status::default()
        }
    } else {
        Status {
            busy: false,
            dead: true,
            failed: true,
            backtrace: Some(format!("worker process {} without reporting a status", reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::Task;
    use nix::sys::signal::Signal;

    #[test]
    fn test_shutdown_stops_program_without_stop_handler() {
        // `cat` keeps SIGTERM blocked; it ends because its stdin is closed first.
        let command = Arc::new(WorkerCommand::new("cat"));
        let mut worker = Worker::<Task>::spawn(command).unwrap();
        worker.schedule(&Task::Noop).unwrap();
        worker.shutdown().unwrap();

        assert!(worker.is_dead());
        assert!(!worker.is_failed());
        assert_eq!(worker.frequency(), 1);
    }

    #[test]
    fn test_vanished_status_after_crash() {
        let status = vanished_status(&TerminationReason::Signaled(Signal::SIGSEGV));
        assert!(status.dead);
        assert!(status.failed);
        assert!(!status.busy);
        assert!(status.backtrace.unwrap().contains("SIGSEGV"));
    }

    #[test]
    fn test_vanished_status_after_clean_exit() {
        let status = vanished_status(&TerminationReason::Exited(0));
        assert!(status.dead);
        assert!(!status.failed);
        assert!(status.backtrace.is_none());
    }

    #[test]
    fn test_vanished_status_after_error_exit() {
        let status = vanished_status(&TerminationReason::Exited(101));
        assert!(status.failed);
        assert!(status.backtrace.unwrap().contains("code 101"));
    }
}
