//! Worker subprocess main entry point.
//!
//! A binary that hosts workers checks [`is_worker_process`] at the top of `main` and
//! hands over to [`run_worker_main`] with its unit type. Nothing may be written to
//! stdout before that call: the original stdout becomes the status channel.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{Status, WorkRequest};
use super::signals;
use super::spawn::{DEFAULT_POLL_INTERVAL, POLL_INTERVAL_ENV, WORKER_ENV};
use crate::unit::Unit;
use std::any::Any;
use std::backtrace::Backtrace;
use std::io;
use std::os::unix::io::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Report of the last panic, filled in by the panic hook.
static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Whether this process was started by a pool as a worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Settings for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long an idle worker waits for input before re-checking for a stop request.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl DispatchConfig {
    /// Read settings passed down by the pool through the environment.
    pub fn from_env() -> Self {
        let poll_interval = std::env::var(POLL_INTERVAL_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        Self { poll_interval }
    }
}

/// How the dispatch loop ended.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// Stop requested or controller gone; no work left.
    Clean,
    /// A unit failed and its status has been published.
    Failed,
}

/// Record each panic report for the status channel, then hand over to the previous hook.
fn install_panic_hook() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let trace = Backtrace::force_capture();
        if let Ok(mut slot) = LAST_PANIC.lock() {
            *slot = Some(format!("{}\n\nstack backtrace:\n{}", info, trace));
        }
        previous(info);
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("unit panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("unit panicked: {}", msg)
    } else {
        "unit panicked".to_string()
    }
}

/// Run one unit, capturing returned errors and panics as a failure report.
fn execute<U: Unit>(unit: &U) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| unit.run())) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{:?}", e)),
        Err(payload) => {
            let report = LAST_PANIC.lock().ok().and_then(|mut slot| slot.take());
            Err(report.unwrap_or_else(|| panic_message(payload.as_ref())))
        }
    }
}

/// Worker main loop.
///
/// Executes one unit at a time in arrival order and publishes a status around each.
fn dispatch_loop<U: Unit>(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    config: &DispatchConfig,
) -> io::Result<Exit> {
    let pid = std::process::id();

    loop {
        let pending = reader.poll_pending(Duration::ZERO)?;

        if signals::stop_requested() && !pending {
            debug!(pid, "Stop requested and no work pending, exiting");
            return Ok(Exit::Clean);
        }

        if !pending {
            // Idle: wait for input, a stop signal, or the poll interval to elapse.
            reader.poll_pending(config.poll_interval)?;
            continue;
        }

        let line = match reader.read_line()? {
            Some(line) => line.to_string(),
            None => {
                debug!(pid, "Work channel closed, exiting");
                return Ok(Exit::Clean);
            }
        };

        let request = match WorkRequest::<U>::from_line(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(pid, error = %e, "Undecodable unit of work");
                let status = Status::failure(format!("Failed to decode unit of work: {}", e));
                writer.write_line(&status.to_line())?;
                return Ok(Exit::Failed);
            }
        };

        writer.write_line(&Status::busy().to_line())?;
        trace!(pid, seq = request.seq, "Executing unit");

        match execute(&request.unit) {
            Ok(()) => writer.write_line(&Status::idle().to_line())?,
            Err(report) => {
                warn!(pid, seq = request.seq, "Unit failed, worker exiting");
                writer.write_line(&Status::failure(report).to_line())?;
                return Ok(Exit::Failed);
            }
        }
    }
}

/// Open the channel pair on the inherited descriptors.
///
/// The original stdout is kept for status messages and fd 1 is pointed at stderr.
fn open_channels() -> io::Result<(LineReader, LineWriter)> {
    let work = io::stdin().as_fd().try_clone_to_owned()?;
    let status = io::stdout().as_fd().try_clone_to_owned()?;
    nix::unistd::dup2_stdout(io::stderr())?;
    Ok((
        LineReader::new(PipeFd::new(work)),
        LineWriter::new(PipeFd::new(status)),
    ))
}

/// Run the worker subprocess main function.
///
/// This function never returns. It exits with status 0 after a graceful stop or when
/// the controller closes the work channel, and with status 1 after a unit failure.
pub fn run_worker_main<U: Unit>(config: DispatchConfig) -> ! {
    if let Err(e) = signals::install_worker_handlers() {
        eprintln!("Worker error: failed to install signal handlers: {}", e);
        std::process::exit(1);
    }
    install_panic_hook();

    let (mut reader, mut writer) = match open_channels() {
        Ok(channels) => channels,
        Err(e) => {
            eprintln!("Worker error: failed to open channels: {}", e);
            std::process::exit(1);
        }
    };

    debug!(
        pid = std::process::id(),
        poll_interval_ms = config.poll_interval.as_millis(),
        "Worker started"
    );

    match dispatch_loop::<U>(&mut reader, &mut writer, &config) {
        Ok(Exit::Clean) => std::process::exit(0),
        Ok(Exit::Failed) => std::process::exit(1),
        Err(e) => {
            error!(pid = std::process::id(), error = %e, "Worker channel error");
            std::process::exit(1);
        }
    }
}
