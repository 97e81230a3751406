//! A live PTY session: the master channel plus the tracked child
//!
//! Reads and writes go straight to the master descriptor. There is no
//! internal thread; `read` polls for a bounded time and `wait` blocks, so
//! callers that need concurrency run those on threads of their own.

use crate::pty::{self, WindowSize};
use crate::status::ExitStatus;
use crate::PtyError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default upper bound for a single `read` call
pub const DEFAULT_READ_SIZE: usize = 4096;

/// Pause before retrying a write that hit a momentarily non-blocking master
const WRITE_BACKOFF: Duration = Duration::from_millis(1);

/// How long `read` keeps polling an idle master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// Consecutive empty polls before giving up; reset whenever data arrives
    pub max_idle_polls: u32,

    /// Sleep between empty polls
    pub poll_interval: Duration,
}

impl ReadPolicy {
    pub fn new(max_idle_polls: u32, poll_interval: Duration) -> Self {
        Self {
            max_idle_polls,
            poll_interval,
        }
    }

    /// Upper bound on the time spent waiting on an idle master
    pub fn patience(&self) -> Duration {
        self.poll_interval * self.max_idle_polls
    }
}

impl Default for ReadPolicy {
    /// 100 polls 10ms apart: about a second of patience
    fn default() -> Self {
        Self {
            max_idle_polls: 100,
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Observable session state.
///
/// `spawn` only returns after the fork, so a session starts out `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,

    /// The child has been reaped by `wait` or `try_wait`
    Exited(ExitStatus),

    /// The master descriptor has been released
    Closed,
}

/// A process running in a PTY
pub struct Session {
    master: Option<File>,
    pid: Pid,
    exit: OnceLock<ExitStatus>,
    /// Read error hit after some bytes were already returned
    pending_read_error: Mutex<Option<io::Error>>,
}

impl Session {
    pub(crate) fn new(master: File, pid: Pid) -> Self {
        Self {
            master: Some(master),
            pid,
            exit: OnceLock::new(),
            pending_read_error: Mutex::new(None),
        }
    }

    /// Get the process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The master descriptor, or `None` once closed
    pub fn master_fd(&self) -> Option<RawFd> {
        self.master.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn state(&self) -> SessionState {
        if self.master.is_none() {
            SessionState::Closed
        } else if let Some(status) = self.exit.get() {
            SessionState::Exited(*status)
        } else {
            SessionState::Running
        }
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none()
    }

    fn master(&self) -> Result<&File, PtyError> {
        self.master.as_ref().ok_or(PtyError::Closed)
    }

    /// Write once to the master, returning how many bytes were taken.
    ///
    /// Short counts are returned as-is. A child that has gone away shows up
    /// as `WriteFailed`.
    pub fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let mut master = self.master()?;

        loop {
            match master.write(data) {
                Ok(n) => {
                    trace!(pid = %self.pid, bytes = n, "wrote to pty");
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A concurrent `read` has the master in non-blocking mode.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(WRITE_BACKOFF),
                Err(e) => return Err(PtyError::WriteFailed(e)),
            }
        }
    }

    /// Keep writing until all of `data` has been taken.
    pub fn write_all(&self, mut data: &[u8]) -> Result<(), PtyError> {
        while !data.is_empty() {
            match self.write(data)? {
                0 => {
                    return Err(PtyError::WriteFailed(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "pty accepted no bytes",
                    )))
                }
                n => data = &data[n..],
            }
        }
        Ok(())
    }

    /// Read up to `max` bytes with the default [`ReadPolicy`].
    pub fn read(&self, max: usize) -> Result<Vec<u8>, PtyError> {
        self.read_with(max, &ReadPolicy::default())
    }

    /// Read up to `max` bytes, polling an idle master per `policy`.
    ///
    /// Returns early once `max` bytes have arrived. Running out of patience
    /// is not an error: whatever arrived, possibly nothing, is returned.
    ///
    /// An I/O error fails the call with `ReadFailed` if nothing was read
    /// yet. If bytes were already collected they are returned, and the error
    /// is held and returned by the next call before touching the master, so
    /// a one-off error is never lost. The master's blocking mode is restored
    /// on every path.
    ///
    /// The buffer grows with the data, so a huge `max` costs nothing up
    /// front; running out of memory is reported as `ReadFailed`.
    pub fn read_with(&self, max: usize, policy: &ReadPolicy) -> Result<Vec<u8>, PtyError> {
        let mut master = self.master()?;
        if let Some(e) = self.take_pending_read_error() {
            return Err(PtyError::ReadFailed(e));
        }
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = Vec::new();
        reserve(&mut buffer, max.min(DEFAULT_READ_SIZE))?;
        let mut chunk = [0u8; DEFAULT_READ_SIZE];

        let _nonblocking = NonBlockingGuard::enable(master.as_raw_fd())
            .map_err(|e| PtyError::ReadFailed(e.into()))?;

        let mut idle_polls = 0;

        while buffer.len() < max && idle_polls < policy.max_idle_polls {
            let want = (max - buffer.len()).min(chunk.len());
            match master.read(&mut chunk[..want]) {
                Ok(0) => {
                    debug!(pid = %self.pid, "pty reached end of file");
                    break;
                }
                Ok(n) => {
                    reserve(&mut buffer, n)?;
                    buffer.extend_from_slice(&chunk[..n]);
                    idle_polls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    idle_polls += 1;
                    thread::sleep(policy.poll_interval);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if !buffer.is_empty() => {
                    // EIO here usually means the slave side hung up.
                    debug!(pid = %self.pid, error = %e, "pty read stopped early");
                    self.set_pending_read_error(e);
                    break;
                }
                Err(e) => return Err(PtyError::ReadFailed(e)),
            }
        }

        trace!(pid = %self.pid, bytes = buffer.len(), "read from pty");
        Ok(buffer)
    }

    fn take_pending_read_error(&self) -> Option<io::Error> {
        self.pending_read_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn set_pending_read_error(&self, error: io::Error) {
        *self
            .pending_read_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Block until the child terminates.
    ///
    /// The status is recorded, so later calls return it again without
    /// touching the (possibly reused) pid.
    pub fn wait(&self) -> Result<ExitStatus, PtyError> {
        if let Some(status) = self.exit.get() {
            return Ok(*status);
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(report) => {
                    if let Some(status) = ExitStatus::from_wait_status(report) {
                        return Ok(self.record_exit(status));
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(source) => {
                    return Err(PtyError::WaitFailed {
                        pid: self.pid,
                        source,
                    })
                }
            }
        }
    }

    /// Reap the child if it has already terminated.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>, PtyError> {
        if let Some(status) = self.exit.get() {
            return Ok(Some(*status));
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(report) => Ok(ExitStatus::from_wait_status(report).map(|s| self.record_exit(s))),
            Err(source) => Err(PtyError::WaitFailed {
                pid: self.pid,
                source,
            }),
        }
    }

    fn record_exit(&self, status: ExitStatus) -> ExitStatus {
        let status = *self.exit.get_or_init(|| status);
        debug!(pid = %self.pid, %status, "child exited");
        status
    }

    /// Send `signal` to the child. Refused once the child has been reaped.
    pub fn signal(&self, signal: Signal) -> Result<(), PtyError> {
        if self.exit.get().is_some() {
            return Err(PtyError::NotRunning(self.pid));
        }

        signal::kill(self.pid, signal).map_err(|source| PtyError::Signal {
            signal,
            pid: self.pid,
            source,
        })
    }

    /// Kill the process
    pub fn kill(&self) -> Result<(), PtyError> {
        self.signal(Signal::SIGKILL)
    }

    /// Set the UTF-8 input flag if it is not already set.
    ///
    /// Returns whether the attributes had to be re-applied.
    pub fn set_utf8_mode(&self) -> Result<bool, PtyError> {
        pty::enable_utf8(self.master()?.as_fd()).map_err(PtyError::Terminal)
    }

    /// Resize the terminal
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        pty::set_window_size(self.master()?.as_raw_fd(), size).map_err(PtyError::Terminal)?;
        debug!(pid = %self.pid, rows = size.rows, cols = size.cols, "resized pty");
        Ok(())
    }

    pub fn window_size(&self) -> Result<WindowSize, PtyError> {
        pty::window_size(self.master()?.as_raw_fd()).map_err(PtyError::Terminal)
    }

    /// Release the master descriptor. Closing twice is a no-op.
    ///
    /// The child is not reaped; `wait` remains available afterwards.
    pub fn close(&mut self) {
        if let Some(master) = self.master.take() {
            drop(master);
            debug!(pid = %self.pid, "closed pty master");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.master.is_some() && self.exit.get().is_none() {
            debug!(pid = %self.pid, "dropping session with unreaped child");
        }
        // Master will be dropped by its own Drop impl
    }
}

fn reserve(buffer: &mut Vec<u8>, additional: usize) -> Result<(), PtyError> {
    buffer
        .try_reserve(additional)
        .map_err(|e| PtyError::ReadFailed(io::Error::new(io::ErrorKind::OutOfMemory, e)))
}

/// Puts a descriptor into non-blocking mode and restores its original
/// flags when dropped.
struct NonBlockingGuard {
    fd: RawFd,
    saved: OFlag,
}

impl NonBlockingGuard {
    fn enable(fd: RawFd) -> nix::Result<Self> {
        let saved = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        fcntl(fd, FcntlArg::F_SETFL(saved | OFlag::O_NONBLOCK))?;
        Ok(Self { fd, saved })
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        if let Err(e) = fcntl(self.fd, FcntlArg::F_SETFL(self.saved)) {
            warn!(fd = self.fd, error = %e, "failed to restore pty blocking mode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_read_policy() {
        let policy = ReadPolicy::default();
        assert_eq!(policy.max_idle_polls, 100);
        assert_eq!(policy.poll_interval, Duration::from_millis(10));
        assert_eq!(policy.patience(), Duration::from_secs(1));
    }

    #[test]
    fn test_nonblocking_guard_restores_flags() {
        let pty = crate::Pty::new().unwrap();
        let fd = pty.master_fd();
        let before = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert!(!before.contains(OFlag::O_NONBLOCK));

        {
            let _guard = NonBlockingGuard::enable(fd).unwrap();
            let during = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
            assert!(during.contains(OFlag::O_NONBLOCK));
        }

        let after = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        assert_eq!(before, after);
    }

    #[test]
    fn test_held_read_error_is_returned_once() {
        // A directory fails every read with EISDIR
        let session = Session::new(File::open("/").unwrap(), Pid::this());
        session.set_pending_read_error(io::Error::from_raw_os_error(libc::EIO));

        match session.read(16) {
            Err(PtyError::ReadFailed(e)) => assert_eq!(e.raw_os_error(), Some(libc::EIO)),
            other => panic!("expected the held error, got {other:?}"),
        }
        match session.read(16) {
            Err(PtyError::ReadFailed(e)) => assert_eq!(e.raw_os_error(), Some(libc::EISDIR)),
            other => panic!("expected a fresh error, got {other:?}"),
        }
    }

    #[test]
    fn test_huge_read_size_does_not_preallocate() {
        let session = Session::new(File::open("/").unwrap(), Pid::this());
        let policy = ReadPolicy::new(1, Duration::from_millis(1));

        // Fails on the descriptor, not on the allocation
        match session.read_with(usize::MAX, &policy) {
            Err(PtyError::ReadFailed(e)) => assert_eq!(e.raw_os_error(), Some(libc::EISDIR)),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
