use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subterm_pty::{ExitStatus, PtyError, ReadPolicy, Session, SpawnRequest};

/// Short patience so helper loops can check their own deadline often
const HARNESS_POLICY: ReadPolicy = ReadPolicy {
    max_idle_polls: 5,
    poll_interval: Duration::from_millis(10),
};

/// `/bin/sh -c script` in `/` with only [`crate::TEST_PATH`] in its environment
pub fn shell(script: &str) -> SpawnRequest {
    SpawnRequest::new("/bin/sh", "/")
        .args(["sh", "-c", script])
        .env_entries([crate::TEST_PATH])
}

/// Read until `needle` shows up in the accumulated output.
///
/// Fails if the child hangs up or `timeout` passes first.
pub fn read_until(session: &Session, needle: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut output = Vec::new();

    while Instant::now() < deadline {
        match session.read_with(4096, &HARNESS_POLICY) {
            Ok(chunk) => output.extend_from_slice(&chunk),
            Err(PtyError::ReadFailed(_)) => break,
            Err(e) => return Err(e.into()),
        }
        if contains(&output, needle) {
            return Ok(output);
        }
    }

    bail!(
        "did not see {:?}; got {:?}",
        String::from_utf8_lossy(needle),
        String::from_utf8_lossy(&output)
    )
}

/// Collect output until the slave side hangs up or `timeout` passes.
pub fn drain_until_exit(session: &Session, timeout: Duration) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut output = Vec::new();

    while Instant::now() < deadline {
        match session.read_with(4096, &HARNESS_POLICY) {
            Ok(chunk) => output.extend_from_slice(&chunk),
            Err(PtyError::ReadFailed(_)) => return Ok(output),
            Err(e) => return Err(e.into()),
        }
    }

    bail!(
        "child {} still attached after {timeout:?}; got {:?}",
        session.pid(),
        String::from_utf8_lossy(&output)
    )
}

/// Run the blocking `wait` off the async runtime with an upper bound.
///
/// A child still running at the deadline is killed so the waiter thread
/// can finish.
pub async fn wait_timeout(session: Arc<Session>, limit: Duration) -> Result<ExitStatus> {
    let waiter = Arc::clone(&session);
    let handle = tokio::task::spawn_blocking(move || waiter.wait());

    match tokio::time::timeout(limit, handle).await {
        Ok(joined) => Ok(joined??),
        Err(_) => {
            let _ = session.kill();
            bail!("child {} did not exit within {limit:?}", session.pid())
        }
    }
}

pub fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        assert!(contains(b"hello world", b"lo w"));
        assert!(contains(b"abc", b""));
        assert!(!contains(b"abc", b"abcd"));
    }
}
