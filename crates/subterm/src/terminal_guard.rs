//! RAII guard for terminal ownership during raw mode operations

use anyhow::Result;
use crossterm::terminal;
use nix::sys::termios::{self, OutputFlags, SetArg};
use std::io::{self, IsTerminal};
use std::os::unix::io::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};

static RAW_MODE: AtomicBool = AtomicBool::new(false);

/// Whether some guard currently holds the terminal in raw mode
pub fn raw_mode_active() -> bool {
    RAW_MODE.load(Ordering::Acquire)
}

/// RAII guard that owns the controlling terminal while a session is bridged
/// onto it. Log output is muted for as long as raw mode is on and the
/// original terminal state is restored when dropped.
pub struct TerminalGuard {
    raw_mode_enabled: bool,
    // Marker to ensure this type is !Send and !Sync
    _marker: std::marker::PhantomData<*const ()>,
}

impl TerminalGuard {
    pub fn acquire() -> Result<Self> {
        Ok(Self {
            raw_mode_enabled: false,
            _marker: std::marker::PhantomData,
        })
    }

    /// Enable raw mode on the terminal.
    pub fn enable_raw_mode(&mut self) -> Result<()> {
        if !self.raw_mode_enabled {
            terminal::enable_raw_mode()?;
            self.raw_mode_enabled = true;
            RAW_MODE.store(true, Ordering::Release);
            keep_newline_translation()?;
        }
        Ok(())
    }

    /// Disable raw mode on the terminal.
    pub fn disable_raw_mode(&mut self) -> Result<()> {
        if self.raw_mode_enabled {
            RAW_MODE.store(false, Ordering::Release);
            terminal::disable_raw_mode()?;
            self.raw_mode_enabled = false;
        }
        Ok(())
    }

    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode_enabled
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.raw_mode_enabled {
            RAW_MODE.store(false, Ordering::Release);
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Sessions run on a raw pty that passes bare LFs through, so the host
/// terminal keeps LF to CRLF output translation while its input is raw.
fn keep_newline_translation() -> Result<()> {
    let stdout = io::stdout();
    if !stdout.is_terminal() {
        return Ok(());
    }

    let fd = stdout.as_fd();
    let mut attrs = termios::tcgetattr(fd)?;
    attrs.output_flags |= OutputFlags::OPOST | OutputFlags::ONLCR;
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}
