//! Process handle for worker subprocesses.
//!
//! Owns the pid and the control side of a worker: stop/kill notifications and
//! reaping. Once a process has been reaped it is never signalled again, so a recycled
//! pid can not be hit by mistake.

use super::signals::{STOP_SIGNAL, TerminationReason, analyze_wait_status};
use crate::error::{PoolError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::time::Duration;

/// Handle to a worker subprocess.
#[derive(Debug)]
pub struct Proc {
    /// Process ID
    pid: Pid,
    /// How the process ended, once reaped
    exit: Option<TerminationReason>,
}

impl Proc {
    /// Wrap an already spawned child process.
    pub fn new(pid: Pid) -> Self {
        Self { pid, exit: None }
    }

    /// Get the process ID.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the process has been reaped.
    pub fn is_reaped(&self) -> bool {
        self.exit.is_some()
    }

    /// Send the graceful-stop notification.
    ///
    /// A process that is already gone is not an error.
    pub fn request_stop(&self) -> Result<()> {
        self.send_signal(STOP_SIGNAL)
    }

    /// Send SIGKILL and wait for the process to exit.
    pub fn kill(&mut self) -> Result<TerminationReason> {
        self.send_signal(Signal::SIGKILL)?;
        self.wait()
    }

    /// Wait for the process to exit (blocking).
    pub fn wait(&mut self) -> Result<TerminationReason> {
        if let Some(reason) = &self.exit {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(reason) = analyze_wait_status(status) {
                        self.exit = Some(reason.clone());
                        return Ok(reason);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.mark_lost()),
                Err(e) => {
                    return Err(PoolError::Process(format!(
                        "waitpid({}) failed: {}",
                        self.pid, e
                    )));
                }
            }
        }
    }

    /// Try to reap the process without blocking.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<TerminationReason>> {
        if let Some(reason) = &self.exit {
            return Ok(Some(reason.clone()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                let reason = analyze_wait_status(status);
                if let Some(reason) = &reason {
                    self.exit = Some(reason.clone());
                }
                Ok(reason)
            }
            Err(Errno::ECHILD) => Ok(Some(self.mark_lost())),
            Err(e) => Err(PoolError::Process(format!(
                "waitpid({}) failed: {}",
                self.pid, e
            ))),
        }
    }

    fn send_signal(&self, sig: Signal) -> Result<()> {
        if self.is_reaped() {
            return Ok(());
        }
        match signal::kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(PoolError::Process(format!(
                "Failed to send {:?} to {}: {}",
                sig, self.pid, e
            ))),
        }
    }

    fn mark_lost(&mut self) -> TerminationReason {
        self.exit = Some(TerminationReason::Unknown);
        TerminationReason::Unknown
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.is_reaped() {
            return;
        }
        let _ = self.request_stop();
        std::thread::sleep(Duration::from_millis(10));
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        let _ = self.kill();
    }
}
