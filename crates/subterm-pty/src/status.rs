//! Child exit-status decoding

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::fmt;

/// How a session's child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal termination with the given exit code
    Exited(i32),

    /// Killed by a signal
    Signaled(Signal),
}

impl ExitStatus {
    /// Flatten to a single integer: the exit code for normal termination,
    /// the negated signal number otherwise.
    ///
    /// Exit codes are always in `0..=255`, so the two cases never collide.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => -(signal as i32),
        }
    }

    /// Shell-style status: signals map to `128 + signo`.
    pub fn shell_code(self) -> i32 {
        match self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => 128 + signal as i32,
        }
    }

    pub fn success(self) -> bool {
        self == ExitStatus::Exited(0)
    }

    pub fn signal(self) -> Option<Signal> {
        match self {
            ExitStatus::Signaled(signal) => Some(signal),
            ExitStatus::Exited(_) => None,
        }
    }

    /// Decode a `waitpid` report. Stop, continue and ptrace reports do not
    /// end the child and yield `None`.
    pub(crate) fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
            _ => None,
        }
    }
}

impl From<ExitStatus> for i32 {
    fn from(status: ExitStatus) -> i32 {
        status.code()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "killed by {signal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_exit_code_is_non_negative() {
        let status = ExitStatus::Exited(3);
        assert_eq!(status.code(), 3);
        assert_eq!(status.shell_code(), 3);
        assert!(!status.success());
        assert_eq!(status.signal(), None);
    }

    #[test]
    fn test_signal_is_negated() {
        let status = ExitStatus::Signaled(Signal::SIGKILL);
        assert_eq!(status.code(), -9);
        assert_eq!(status.shell_code(), 137);
        assert_eq!(i32::from(status), -9);
        assert_eq!(status.signal(), Some(Signal::SIGKILL));
    }

    #[test]
    fn test_decode_wait_status() {
        let pid = Pid::from_raw(42);

        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Exited(pid, 0)),
            Some(ExitStatus::Exited(0))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(ExitStatus::Signaled(Signal::SIGTERM))
        );
        assert_eq!(
            ExitStatus::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            None
        );
        assert_eq!(ExitStatus::from_wait_status(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitStatus::Exited(1).to_string(), "exit code 1");
        assert_eq!(
            ExitStatus::Signaled(Signal::SIGTERM).to_string(),
            "killed by SIGTERM"
        );
    }
}
