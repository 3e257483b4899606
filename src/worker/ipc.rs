//! Newline-delimited pipe I/O shared by both ends of a worker's channels.
//!
//! Reads and writes are retried on EINTR, since workers take signals while blocked.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

/// Userspace buffer on each side of a pipe.
const PIPE_BUFFER_CAPACITY: usize = 64 * 1024;

/// Run a syscall wrapper until it completes without EINTR.
fn retry_interrupted<T>(mut op: impl FnMut() -> nix::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(Errno::EINTR) => continue,
            other => return other.map_err(io::Error::from),
        }
    }
}

/// One end of a pipe.
pub struct PipeFd(OwnedFd);

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        retry_interrupted(|| nix::unistd::read(&self.0, buf))
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        retry_interrupted(|| nix::unistd::write(&self.0, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Reads one message per line from a pipe.
pub struct LineReader {
    inner: BufReader<PipeFd>,
    line: String,
}

impl LineReader {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            inner: BufReader::with_capacity(PIPE_BUFFER_CAPACITY, fd),
            line: String::new(),
        }
    }

    /// Next line without its terminator, or `None` once the writer has hung up.
    ///
    /// The returned slice borrows an internal buffer reused by the next call.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line.clear();
        if self.inner.read_line(&mut self.line)? == 0 {
            return Ok(None);
        }
        let len = self.line.trim_end_matches(['\n', '\r']).len();
        self.line.truncate(len);
        Ok(Some(&self.line))
    }

    /// Check whether a read would make progress, waiting at most `timeout`.
    ///
    /// Returns `true` when buffered data is available, the pipe is readable, or the
    /// writer hung up (the next read reports EOF). A signal interrupting the wait
    /// returns `false` so the caller can re-check its own state.
    pub fn poll_pending(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.inner.buffer().is_empty() {
            return Ok(true);
        }

        let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.inner.get_ref().as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0].revents().is_some_and(|revents| {
                revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes one message per line to a pipe, flushing after each.
pub struct LineWriter {
    inner: BufWriter<PipeFd>,
}

impl LineWriter {
    pub fn new(fd: PipeFd) -> Self {
        Self {
            inner: BufWriter::with_capacity(PIPE_BUFFER_CAPACITY, fd),
        }
    }

    /// Send `line`, adding the terminator when it is missing.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.inner.write_all(b"\n")?;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_pair() -> (LineReader, LineWriter) {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        (
            LineReader::new(PipeFd::new(rx)),
            LineWriter::new(PipeFd::new(tx)),
        )
    }

    #[test]
    fn test_lines_arrive_in_order_then_eof() {
        let (mut reader, mut writer) = pipe_pair();
        writer.write_line(r#"{"busy":true}"#).unwrap();
        writer.write_line("{}\n").unwrap();
        writer.write_line("").unwrap();
        drop(writer);

        assert_eq!(reader.read_line().unwrap(), Some(r#"{"busy":true}"#));
        assert_eq!(reader.read_line().unwrap(), Some("{}"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_carriage_return_is_stripped() {
        let (mut reader, mut writer) = pipe_pair();
        writer.write_line("seq\r\n").unwrap();
        drop(writer);
        assert_eq!(reader.read_line().unwrap(), Some("seq"));
    }

    #[test]
    fn test_poll_pending_empty_pipe() {
        let (mut reader, _writer) = pipe_pair();
        assert!(!reader.poll_pending(Duration::ZERO).unwrap());
        assert!(!reader.poll_pending(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_poll_pending_sees_written_and_buffered_lines() {
        let (mut reader, mut writer) = pipe_pair();
        writer.write_line("one").unwrap();
        writer.write_line("two").unwrap();
        assert!(reader.poll_pending(Duration::ZERO).unwrap());

        // The first read pulls both lines into the buffer; the second is still pending.
        assert_eq!(reader.read_line().unwrap(), Some("one"));
        assert!(reader.poll_pending(Duration::ZERO).unwrap());
        assert_eq!(reader.read_line().unwrap(), Some("two"));
        assert!(!reader.poll_pending(Duration::ZERO).unwrap());
    }

    #[test]
    fn test_poll_pending_reports_hangup() {
        let (mut reader, writer) = pipe_pair();
        drop(writer);
        assert!(reader.poll_pending(Duration::ZERO).unwrap());
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn test_write_to_closed_pipe_is_broken_pipe() {
        // The test harness ignores SIGPIPE, so the write fails instead of killing us.
        let (reader, mut writer) = pipe_pair();
        drop(reader);
        let err = writer.write_line("lost").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
