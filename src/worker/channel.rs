//! The per-worker channel pair.
//!
//! The work channel carries units from the controller to the worker (the child's
//! stdin). The status channel carries [`Status`] snapshots back. Each direction has a
//! thread between the pipe and an in-process queue: the controller never blocks on a
//! full work pipe, a worker never blocks on a full status pipe, and the controller
//! can drain statuses without waiting.

use super::ipc::{LineReader, LineWriter, PipeFd};
use super::protocol::{Status, WorkRequest};
use super::spawn::spawn_channel_thread;
use crate::error::{PoolError, Result};
use nix::unistd::Pid;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Controller side of the work channel.
///
/// Units are queued in process and a writer thread moves them into the worker's
/// stdin pipe, so sending never waits for the worker to read. Once the worker's end
/// of the pipe is gone the writer thread stops and further sends fail with
/// `BrokenPipe`.
pub struct WorkChannel<U> {
    tx: Option<Sender<String>>,
    writer: Option<JoinHandle<()>>,
    _unit: PhantomData<fn(U)>,
}

impl<U: Serialize> WorkChannel<U> {
    /// Start a writer thread feeding the write end of the worker's stdin pipe.
    pub fn spawn(fd: PipeFd, pid: Pid) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let writer = LineWriter::new(fd);
        let handle = spawn_channel_thread(&format!("procpool-work-{}", pid), move || {
            feed(writer, rx, pid)
        })
        .map_err(|e| PoolError::Channel(format!("Failed to start work writer: {}", e)))?;
        Ok(Self {
            tx: Some(tx),
            writer: Some(handle),
            _unit: PhantomData,
        })
    }

    /// Enqueue one unit. Never waits for the worker.
    pub fn send(&mut self, seq: u64, unit: &U) -> Result<()> {
        let line = WorkRequest::new(seq, unit).to_line()?;
        let queued = self.tx.as_ref().is_some_and(|tx| tx.send(line).is_ok());
        if !queued {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        Ok(())
    }

    /// Stop accepting units. The writer still delivers what is queued, then closes
    /// the pipe.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Whether every queued unit has been handed to the pipe (or the pipe broke).
    pub fn is_flushed(&self) -> bool {
        self.tx.is_none() && self.writer.as_ref().is_none_or(|w| w.is_finished())
    }

    /// Close the channel and wait until the writer has delivered every queued unit.
    pub fn flush(&mut self) {
        self.close();
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!("Work writer thread panicked");
        }
    }
}

fn feed(mut writer: LineWriter, rx: Receiver<String>, pid: Pid) {
    for line in rx {
        if let Err(e) = writer.write_line(&line) {
            debug!(pid = %pid, error = %e, "Work channel write failed");
            break;
        }
    }
    trace!(pid = %pid, "Work writer finished");
}

/// Controller side of the status channel.
pub struct StatusChannel {
    rx: Receiver<Status>,
    collector: Option<JoinHandle<()>>,
    disconnected: bool,
}

impl StatusChannel {
    /// Start a collector thread reading status lines from `fd`.
    pub fn spawn(fd: PipeFd, pid: Pid) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let reader = LineReader::new(fd);
        let collector = spawn_channel_thread(&format!("procpool-status-{}", pid), move || {
            collect(reader, tx, pid)
        })
        .map_err(|e| PoolError::Channel(format!("Failed to start status collector: {}", e)))?;
        Ok(Self {
            rx,
            collector: Some(collector),
            disconnected: false,
        })
    }

    /// Drain every pending status and return the most recent one, if any.
    ///
    /// Never blocks. Intermediate statuses are discarded.
    pub fn try_latest(&mut self) -> Option<Status> {
        let mut latest = None;
        loop {
            match self.rx.try_recv() {
                Ok(status) => latest = Some(status),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        latest
    }

    /// Whether the worker closed its end and every status has been drained.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Wait for the collector to hit end-of-stream, then drain what is left.
    ///
    /// Only call this once the worker process has exited.
    pub fn finish(&mut self) -> Option<Status> {
        if let Some(collector) = self.collector.take()
            && collector.join().is_err()
        {
            warn!("Status collector thread panicked");
        }
        self.try_latest()
    }
}

fn collect(mut reader: LineReader, tx: Sender<Status>, pid: Pid) {
    loop {
        match reader.read_line() {
            Ok(Some(line)) => match Status::from_line(line) {
                Ok(status) => {
                    if tx.send(status).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(pid = %pid, error = %e, "Ignoring malformed status line"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(pid = %pid, error = %e, "Status channel read failed");
                break;
            }
        }
    }
    trace!(pid = %pid, "Status collector finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    fn pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> Option<T> {
        for _ in 0..200 {
            if let Some(value) = f() {
                return Some(value);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_work_channel_writes_requests() {
        let (read_fd, write_fd) = pipe();
        let mut channel = WorkChannel::<Ping>::spawn(write_fd, Pid::this()).unwrap();
        let mut reader = LineReader::new(read_fd);

        channel.send(1, &Ping { n: 7 }).unwrap();
        channel.send(2, &Ping { n: 8 }).unwrap();
        channel.flush();
        assert!(channel.is_flushed());

        let first: WorkRequest<Ping> =
            WorkRequest::from_line(reader.read_line().unwrap().unwrap()).unwrap();
        let second: WorkRequest<Ping> =
            WorkRequest::from_line(reader.read_line().unwrap().unwrap()).unwrap();
        assert_eq!((first.seq, first.unit.n), (1, 7));
        assert_eq!((second.seq, second.unit.n), (2, 8));
        // The writer closed the pipe after the last queued line.
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_work_channel_send_does_not_wait_for_reader() {
        let (_read_fd, write_fd) = pipe();
        let mut channel = WorkChannel::<String>::spawn(write_fd, Pid::this()).unwrap();

        // Far more than a pipe can hold, with nobody reading.
        let payload = "x".repeat(4096);
        for seq in 0..256 {
            channel.send(seq, &payload).unwrap();
        }
        assert!(!channel.is_flushed());
    }

    #[test]
    fn test_work_channel_reports_broken_pipe() {
        let (read_fd, write_fd) = pipe();
        let mut channel = WorkChannel::<Ping>::spawn(write_fd, Pid::this()).unwrap();
        drop(read_fd);

        // The first send is queued; the writer then hits EPIPE and stops.
        let broken = wait_for(|| match channel.send(1, &Ping { n: 1 }) {
            Err(PoolError::Io(e)) => Some(e.kind()),
            _ => None,
        });
        assert_eq!(broken, Some(io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_closed_work_channel_rejects_units() {
        let (_read_fd, write_fd) = pipe();
        let mut channel = WorkChannel::<Ping>::spawn(write_fd, Pid::this()).unwrap();
        channel.close();
        assert!(matches!(
            channel.send(1, &Ping { n: 1 }),
            Err(PoolError::Io(e)) if e.kind() == io::ErrorKind::BrokenPipe
        ));
        assert!(wait_for(|| channel.is_flushed().then_some(())).is_some());
    }

    #[test]
    fn test_status_channel_keeps_latest() {
        let (read_fd, write_fd) = pipe();
        let mut writer = LineWriter::new(write_fd);
        let mut channel = StatusChannel::spawn(read_fd, Pid::this()).unwrap();

        assert_eq!(channel.try_latest(), None);

        writer.write_line(&Status::busy().to_line()).unwrap();
        writer.write_line(&Status::idle().to_line()).unwrap();
        writer.write_line(&Status::busy().to_line()).unwrap();
        drop(writer);

        // After EOF every status is queued; only the last one survives the drain.
        let last = channel.finish();
        assert_eq!(last, Some(Status::busy()));
        assert!(channel.is_disconnected());
        assert_eq!(channel.try_latest(), None);
    }

    #[test]
    fn test_status_channel_skips_malformed_lines() {
        let (read_fd, write_fd) = pipe();
        let mut writer = LineWriter::new(write_fd);
        let mut channel = StatusChannel::spawn(read_fd, Pid::this()).unwrap();

        writer.write_line(&Status::failure("boom").to_line()).unwrap();
        writer.write_line("not json").unwrap();

        let status = wait_for(|| channel.try_latest()).expect("no status received");
        assert!(status.failed);
        assert!(!channel.is_disconnected());
    }
}
