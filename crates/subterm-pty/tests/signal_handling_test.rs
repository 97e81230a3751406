//! Signal delivery and exit-status decoding tests

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use subterm_pty::{spawn, ExitStatus, PtyError, Signal};
use subterm_test_utils::{drain_until_exit, init_test_logging, read_until, shell, wait_timeout};
use test_case::test_case;

const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(unix)]
mod unix_tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Signal::SIGTERM ; "terminate")]
    #[test_case(Signal::SIGHUP ; "hangup")]
    #[test_case(Signal::SIGUSR1 ; "user defined")]
    fn test_signal_terminates_child(signal: Signal) {
        init_test_logging();
        let session = spawn(&shell("echo ready; sleep 30")).unwrap();
        read_until(&session, b"ready", EXIT_TIMEOUT).unwrap();

        session.signal(signal).unwrap();
        let status = session.wait().unwrap();

        assert_eq!(status, ExitStatus::Signaled(signal));
        assert_eq!(status.code(), -(signal as i32));
        assert_eq!(status.shell_code(), 128 + signal as i32);
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_reports_negated_sigkill() {
        let session = Arc::new(spawn(&shell("sleep 30")).unwrap());

        session.kill().unwrap();
        let status = wait_timeout(session, EXIT_TIMEOUT).await.unwrap();

        assert_eq!(status.signal(), Some(Signal::SIGKILL));
        assert_eq!(status.code(), -9);
        assert_eq!(i32::from(status), -9);
    }

    #[test]
    fn test_try_wait_before_and_after_exit() {
        let session = spawn(&shell("read line; exit 5")).unwrap();

        assert_eq!(session.try_wait().unwrap(), None);

        session.write_all(b"go\n").unwrap();
        let deadline = Instant::now() + EXIT_TIMEOUT;
        let status = loop {
            if let Some(status) = session.try_wait().unwrap() {
                break status;
            }
            assert!(Instant::now() < deadline, "child never exited");
            thread::sleep(Duration::from_millis(10));
        };

        assert_eq!(status, ExitStatus::Exited(5));
        assert_eq!(session.wait().unwrap(), status);
    }

    #[test]
    fn test_signal_after_reap_is_refused() {
        let session = spawn(&shell("exit 0")).unwrap();
        session.wait().unwrap();

        // The pid may already belong to an unrelated process
        let err = session.signal(Signal::SIGTERM).unwrap_err();
        assert!(matches!(err, PtyError::NotRunning(pid) if pid == session.pid()));
        assert!(matches!(session.kill(), Err(PtyError::NotRunning(_))));
    }

    #[test]
    fn test_child_starts_with_signals_unblocked() {
        // Block SIGTERM on this thread only; the fork inherits the mask
        let mut blocked = SigSet::empty();
        blocked.add(Signal::SIGTERM);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&blocked), Some(&mut previous)).unwrap();

        let spawned = spawn(&shell("echo ready; sleep 30"));
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None).unwrap();

        let session = spawned.unwrap();
        read_until(&session, b"ready", EXIT_TIMEOUT).unwrap();
        session.signal(Signal::SIGTERM).unwrap();

        assert_eq!(
            session.wait().unwrap(),
            ExitStatus::Signaled(Signal::SIGTERM)
        );
    }

    #[test]
    fn test_child_gets_default_sigpipe() {
        // The test process ignores SIGPIPE. A child that inherited that would
        // see `yes` exit 1 on EPIPE instead of dying from the signal.
        let session =
            spawn(&shell("(yes; echo \"status $?\" >&2) | head -n 1 >/dev/null")).unwrap();

        let output = read_until(&session, b"status", EXIT_TIMEOUT).unwrap();
        let output = [output, drain_until_exit(&session, EXIT_TIMEOUT).unwrap()].concat();
        session.wait().unwrap();

        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("status 141"), "unexpected output: {text:?}");
    }
}
