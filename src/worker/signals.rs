//! Signal plumbing and crash analysis for worker subprocesses.
//!
//! The controller asks a worker to stop with SIGTERM (graceful) or SIGKILL (forceful).
//! Inside the worker, SIGTERM only raises a flag that the dispatch loop checks between
//! units. On the controller side, wait statuses are turned into a [`TerminationReason`]
//! so a worker that vanished without reporting can still be classified.

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::WaitStatus;
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

/// Signal used for the graceful-stop notification.
pub const STOP_SIGNAL: Signal = Signal::SIGTERM;

/// Set by the SIGTERM handler inside a worker process.
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_: c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the graceful-stop handler and ignore SIGPIPE.
///
/// SA_RESTART is not set, so a blocking `poll` in the dispatch loop returns
/// EINTR and the stop flag is noticed without waiting out the poll interval.
pub fn install_worker_handlers() -> nix::Result<()> {
    let stop = SigAction::new(
        SigHandler::Handler(on_stop_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        signal::sigaction(STOP_SIGNAL, &stop)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    stop_signal_set().thread_unblock()
}

/// Block the graceful-stop signal for the calling thread.
///
/// Workers start with it blocked, so a stop request that arrives before
/// [`install_worker_handlers`] stays pending instead of terminating the process.
pub fn block_stop_signal() -> nix::Result<()> {
    stop_signal_set().thread_block()
}

fn stop_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(STOP_SIGNAL);
    set
}

/// Whether a graceful stop has been requested for this process.
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Reason why a worker process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Terminated, but the status was collected elsewhere (ECHILD).
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Get a human-readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(Signal::SIGSEGV) => "crashed (SIGSEGV)".to_string(),
            Self::Signaled(Signal::SIGBUS) => "crashed (SIGBUS)".to_string(),
            Self::Signaled(Signal::SIGABRT) => "aborted (SIGABRT)".to_string(),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::Unknown => "terminated for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
///
/// Returns `None` for statuses that do not mean the process is gone.
pub fn analyze_wait_status(status: WaitStatus) -> Option<TerminationReason> {
    match status {
        WaitStatus::Exited(_, code) => Some(TerminationReason::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Some(TerminationReason::Signaled(signal)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_termination_reason_success() {
        assert!(TerminationReason::Exited(0).is_success());
        assert!(!TerminationReason::Exited(1).is_success());
        assert!(!TerminationReason::Signaled(Signal::SIGKILL).is_success());
        assert!(!TerminationReason::Unknown.is_success());
    }

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(
            analyze_wait_status(status),
            Some(TerminationReason::Exited(0))
        );

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(
            analyze_wait_status(status),
            Some(TerminationReason::Signaled(Signal::SIGKILL))
        );

        assert_eq!(analyze_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(
            TerminationReason::Exited(3).to_string(),
            "exited with code 3"
        );
        assert!(
            TerminationReason::Signaled(Signal::SIGSEGV)
                .to_string()
                .contains("SIGSEGV")
        );
        assert!(
            TerminationReason::Signaled(Signal::SIGKILL)
                .to_string()
                .contains("SIGKILL")
        );
    }

    #[test]
    fn test_stop_flag_defaults_to_false() {
        // Handlers are only installed inside worker processes.
        assert!(!stop_requested());
    }
}
