//! PTY-backed subprocess sessions
//!
//! Allocates a raw-mode pseudo-terminal, forks a child attached to its slave
//! side and hands the master side back as a byte channel with bounded-timeout
//! reads, direct writes and exit-status observation.

pub mod pty;
pub mod session;
pub mod spawn;
pub mod status;

pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use pty::{Pty, WindowSize};
pub use session::{ReadPolicy, Session, SessionState, DEFAULT_READ_SIZE};
pub use spawn::{spawn, SpawnRequest, EXEC_FAILED_EXIT_CODE, SLAVE_OPEN_FAILED_EXIT_CODE};
pub use status::ExitStatus;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    /// Opening the multiplexer or preparing its slave side failed. No child
    /// was forked.
    #[error("Failed to allocate PTY ({stage}): {source}")]
    PtyAllocationFailed {
        stage: &'static str,
        #[source]
        source: Errno,
    },

    /// `fork(2)` failed. The PTY pair has already been released.
    #[error("Fork failed: {0}")]
    ForkFailed(#[source] Errno),

    /// A command, directory, argument or environment entry cannot be passed
    /// to `execvp`.
    #[error("Invalid spawn argument: {0}")]
    InvalidArgument(String),

    #[error("PTY write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("PTY read failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("Failed to wait for child {pid}: {source}")]
    WaitFailed {
        pid: Pid,
        #[source]
        source: Errno,
    },

    #[error("Failed to send {signal} to child {pid}: {source}")]
    Signal {
        signal: Signal,
        pid: Pid,
        #[source]
        source: Errno,
    },

    /// Terminal attribute or window-size control on a live session failed.
    #[error("Terminal control failed: {0}")]
    Terminal(#[source] std::io::Error),

    /// The session's master descriptor has been released.
    #[error("Session is closed")]
    Closed,

    /// The child has already been reaped; its pid may belong to someone else.
    #[error("Child {0} has already been reaped")]
    NotRunning(Pid),
}
