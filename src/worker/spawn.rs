//! Worker subprocess spawning.
//!
//! Workers are started with `std::process::Command`, which execs a fresh program
//! image, so the child begins with a clean address space and its own runtime. The
//! child recognises worker mode through [`WORKER_ENV`] and starts with the
//! graceful-stop signal blocked until its handler is in place.

use super::channel::{StatusChannel, WorkChannel};
use super::ipc::PipeFd;
use super::proc::Proc;
use super::signals;
use crate::error::{PoolError, Result};
use nix::unistd::Pid;
use serde::Serialize;
use std::ffi::OsString;
use std::io;
use std::os::unix::io::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Environment variable marking a process as a pool worker.
pub const WORKER_ENV: &str = "PROCPOOL_WORKER";

/// Environment variable carrying the worker's idle poll interval in milliseconds.
pub const POLL_INTERVAL_ENV: &str = "PROCPOOL_POLL_INTERVAL_MS";

/// Default idle poll interval of the dispatch loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How to launch a worker process.
///
/// The program must call [`crate::worker::run_worker_main`] when it finds
/// [`WORKER_ENV`] set, using the same unit type as the pool.
///
/// The process starts with SIGTERM blocked; `run_worker_main` unblocks it once its
/// handler is installed. A program that never gets there keeps it blocked, so a
/// graceful stop reaches it only through its stdin closing: it must exit at end of
/// input, or be stopped forcefully.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    poll_interval: Duration,
}

impl WorkerCommand {
    /// Launch workers by running `program`.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Launch workers by re-executing the current binary.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| PoolError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe))
    }

    /// Append a command-line argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Set how long an idle worker waits for input before re-checking for a stop request.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Program that will be executed.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Idle poll interval handed to workers.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        cmd.env(WORKER_ENV, "1");
        cmd.env(POLL_INTERVAL_ENV, self.poll_interval.as_millis().to_string());

        // Safety: only pthread_sigmask runs between fork and exec.
        unsafe {
            cmd.pre_exec(|| signals::block_stop_signal().map_err(io::Error::from));
        }

        // stdin is the work channel, stdout the status channel.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit()); // Worker logs go to parent's stderr
        cmd
    }
}

/// A freshly started worker process and its channel pair.
pub struct SpawnedWorker<U> {
    pub proc: Proc,
    pub work: WorkChannel<U>,
    pub status: StatusChannel,
}

/// Spawn a worker subprocess with a new channel pair.
pub fn spawn_worker<U: Serialize>(command: &WorkerCommand) -> Result<SpawnedWorker<U>> {
    let mut child = command.to_command().spawn().map_err(|e| {
        PoolError::Spawn(format!("{}: {}", command.program.display(), e))
    })?;

    // From here on the Proc owns the child: dropping it on an error path kills and reaps.
    let proc = Proc::new(Pid::from_raw(child.id() as i32));

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PoolError::Spawn("Child stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PoolError::Spawn("Child stdout not captured".into()))?;

    let work = WorkChannel::spawn(PipeFd::new(OwnedFd::from(stdin)), proc.pid())?;
    let status = StatusChannel::spawn(PipeFd::new(OwnedFd::from(stdout)), proc.pid())?;

    Ok(SpawnedWorker { proc, work, status })
}

/// Spawn a named channel thread.
pub fn spawn_channel_thread<F, T>(name: &str, f: F) -> io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_defaults() {
        let command = WorkerCommand::new("/bin/worker");
        assert_eq!(command.program(), Path::new("/bin/worker"));
        assert_eq!(command.poll_interval(), DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_worker_command_sets_marker_env() {
        let command = WorkerCommand::new("/bin/worker")
            .arg("--flag")
            .env("EXTRA", "yes")
            .with_poll_interval(Duration::from_millis(75));
        let cmd = command.to_command();

        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["--flag"]);

        let envs: Vec<_> = cmd
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert!(envs.contains(&(WORKER_ENV.to_string(), "1".to_string())));
        assert!(envs.contains(&(POLL_INTERVAL_ENV.to_string(), "75".to_string())));
        assert!(envs.contains(&("EXTRA".to_string(), "yes".to_string())));
    }

    #[test]
    fn test_current_exe_command() {
        let command = WorkerCommand::current_exe().unwrap();
        assert!(command.program().is_absolute());
    }

    #[test]
    fn test_spawn_missing_program_fails() {
        let command = WorkerCommand::new("/nonexistent/procpool-worker");
        let err = spawn_worker::<u32>(&command).err().expect("spawn should fail");
        assert!(matches!(err, PoolError::Spawn(_)));
        assert!(err.to_string().contains("/nonexistent/procpool-worker"));
    }

    #[test]
    fn test_spawn_plain_process_gets_channels() {
        // `cat` echoes work lines back, which the status collector ignores as malformed.
        let command = WorkerCommand::new("cat");
        let mut spawned = spawn_worker::<u32>(&command).unwrap();
        spawned.work.send(1, &5).unwrap();
        drop(spawned.work); // EOF makes cat exit

        let reason = spawned.proc.wait().unwrap();
        assert!(reason.is_success());
        assert_eq!(spawned.status.finish(), None);
    }
}
