//! Interactive bridge between this terminal and a session

use crate::cli::RunArgs;
use crate::terminal_guard::TerminalGuard;
use anyhow::{Context, Result};
use crossterm::terminal;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use subterm_pty::{spawn, PtyError, ReadPolicy, Session, WindowSize, DEFAULT_READ_SIZE};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Short polls keep output latency low while a program is attached
const BRIDGE_POLICY: ReadPolicy = ReadPolicy {
    max_idle_polls: 10,
    poll_interval: Duration::from_millis(5),
};

/// Upper bound on flushing output that was still buffered at exit
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub async fn run(args: RunArgs) -> Result<i32> {
    let size = host_window_size();
    let mut request = args.child.to_request(size)?;
    if !args.child.sets_env("TERM") {
        if let Some(term) = args.term.or_else(|| std::env::var("TERM").ok()) {
            request = request.env("TERM", term);
        }
    }

    let session = Arc::new(
        spawn(&request)
            .with_context(|| format!("Failed to start {}", request.command().display()))?,
    );
    info!(pid = %session.pid(), rows = size.rows, cols = size.cols, "attached");

    let mut guard = TerminalGuard::acquire()?;
    guard
        .enable_raw_mode()
        .context("Failed to put terminal into raw mode")?;

    forward_input(Arc::clone(&session));
    let output = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || copy_output(&session))
    };

    let status = {
        let waiter = Arc::clone(&session);
        let mut wait = tokio::task::spawn_blocking(move || waiter.wait());
        let mut winch =
            signal(SignalKind::window_change()).context("Failed to watch window size")?;

        loop {
            tokio::select! {
                joined = &mut wait => break joined.context("Wait task panicked")?,
                _ = winch.recv() => {
                    if let Err(e) = session.resize(host_window_size()) {
                        warn!(error = %e, "failed to forward window size");
                    }
                }
            }
        }
    };

    // The child is gone; whatever it printed last is still in the pty
    match tokio::time::timeout(DRAIN_TIMEOUT, output).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "output copy failed"),
        Ok(Err(e)) => warn!(error = %e, "output task panicked"),
        Err(_) => debug!("output still open after exit, giving up on it"),
        Ok(Ok(Ok(()))) => {}
    }

    guard.disable_raw_mode()?;
    let status = status.context("Failed to wait for program")?;
    info!(%status, "detached");

    Ok(status.shell_code())
}

fn host_window_size() -> WindowSize {
    match terminal::size() {
        Ok((cols, rows)) => WindowSize::new(rows, cols),
        Err(e) => {
            debug!(error = %e, "terminal size unknown, using default");
            WindowSize::default()
        }
    }
}

/// Forward stdin to the session on a plain thread.
///
/// A read on stdin cannot be cancelled, so this thread is left behind when
/// the program exits; the process ends without joining it.
fn forward_input(session: Arc<Session>) {
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buffer = [0u8; DEFAULT_READ_SIZE];
        loop {
            let n = match stdin.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "stdin closed");
                    break;
                }
            };
            if let Err(e) = session.write_all(&buffer[..n]) {
                debug!(error = %e, "session stopped taking input");
                break;
            }
        }
    });
}

fn copy_output(session: &Session) -> Result<()> {
    let mut stdout = io::stdout();
    loop {
        match session.read_with(DEFAULT_READ_SIZE, &BRIDGE_POLICY) {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => {
                stdout.write_all(&chunk)?;
                stdout.flush()?;
            }
            Err(PtyError::ReadFailed(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
