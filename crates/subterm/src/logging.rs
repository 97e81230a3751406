//! Log output for the binary
//!
//! Everything goes to stderr, except while [`TerminalGuard`] holds the
//! terminal in raw mode: a log line written then would land in the middle
//! of the program's screen, so it is dropped instead.
//!
//! [`TerminalGuard`]: crate::terminal_guard::TerminalGuard

use crate::cli::LogLevel;
use crate::terminal_guard;
use std::io;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::from(level).as_str()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn writer() -> Box<dyn io::Write> {
    if terminal_guard::raw_mode_active() {
        Box::new(io::sink())
    } else {
        Box::new(io::stderr())
    }
}
