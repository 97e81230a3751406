//! Unattended execution: feed optional input, collect output, report status

use crate::cli::ExecArgs;
use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use subterm_pty::{spawn, PtyError, ReadPolicy, Session, WindowSize, DEFAULT_READ_SIZE};
use tracing::{debug, info};

pub async fn exec(args: ExecArgs) -> Result<i32> {
    let request = args.child.to_request(WindowSize::default())?;
    let policy = ReadPolicy::new(args.idle_polls, Duration::from_millis(args.poll_interval_ms));

    let session = Arc::new(
        spawn(&request)
            .with_context(|| format!("Failed to start {}", request.command().display()))?,
    );

    if let Some(input) = &args.input {
        session
            .write_all(input.as_bytes())
            .context("Failed to send input")?;
    }

    let pump = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || pump_output(&session, &policy, &mut io::stdout()))
    };
    let copied = pump.await.context("Output task panicked")??;
    debug!(bytes = copied, "output drained");

    let waiter = Arc::clone(&session);
    let status = tokio::task::spawn_blocking(move || waiter.wait())
        .await
        .context("Wait task panicked")?
        .context("Failed to wait for program")?;

    info!(pid = %session.pid(), %status, "program finished");
    Ok(status.shell_code())
}

/// Copy everything the session prints into `out` until it is done.
///
/// Done means the slave side hung up, or the child has exited and a final
/// read found nothing more. The second case covers descendants that keep
/// the slave open after the child itself is gone.
pub fn pump_output<W: Write>(session: &Session, policy: &ReadPolicy, out: &mut W) -> Result<usize> {
    let mut copied = 0;
    let mut exited = false;

    loop {
        let chunk = match session.read_with(DEFAULT_READ_SIZE, policy) {
            Ok(chunk) => chunk,
            Err(PtyError::ReadFailed(e)) => {
                debug!(error = %e, "pty hung up");
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if chunk.is_empty() {
            // One more read after the exit is seen picks up its last words
            if exited {
                break;
            }
            exited = session.try_wait()?.is_some();
            continue;
        }

        out.write_all(&chunk).context("Failed to write output")?;
        out.flush().context("Failed to write output")?;
        copied += chunk.len();
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use subterm_test_utils::shell;

    const QUICK: ReadPolicy = ReadPolicy {
        max_idle_polls: 5,
        poll_interval: Duration::from_millis(10),
    };

    #[test]
    fn test_pump_collects_until_hangup() {
        let session = spawn(&shell("echo one; echo two")).unwrap();
        let mut out = Vec::new();

        let copied = pump_output(&session, &QUICK, &mut out).unwrap();

        assert_eq!(out, b"one\ntwo\n");
        assert_eq!(copied, out.len());
        assert!(session.wait().unwrap().success());
    }

    #[test]
    fn test_pump_stops_when_child_exits_first() {
        // The background sleep keeps the slave open past the shell's exit
        let session = spawn(&shell("sleep 2 & echo done")).unwrap();
        let mut out = Vec::new();

        pump_output(&session, &QUICK, &mut out).unwrap();

        assert_eq!(out, b"done\n");
        assert!(session.wait().unwrap().success());
    }
}
