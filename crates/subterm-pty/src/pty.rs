//! Low-level PTY allocation and terminal configuration
//!
//! Opens the multiplexer device, prepares the slave side and puts the line
//! discipline into raw, 8-bit clean mode.

use crate::PtyError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster, Winsize};
use nix::sys::termios::{
    self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
    Termios,
};
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, RawFd};
use tracing::{debug, warn};

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
const UTF8_INPUT: InputFlags = InputFlags::IUTF8;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
const UTF8_INPUT: InputFlags = InputFlags::empty();

#[cfg(any(target_os = "linux", target_os = "android"))]
const OPEN_FLAGS: OFlag = OFlag::O_RDWR
    .union(OFlag::O_NOCTTY)
    .union(OFlag::O_CLOEXEC);

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const OPEN_FLAGS: OFlag = OFlag::O_RDWR.union(OFlag::O_NOCTTY);

/// Terminal dimensions in character cells, plus a pixel-size hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// A size with no pixel hint
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    /// 24 rows by 80 columns at 8x16 pixel cells
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 80,
            pixel_width: 640,
            pixel_height: 384,
        }
    }
}

impl From<WindowSize> for Winsize {
    fn from(size: WindowSize) -> Self {
        Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

impl From<Winsize> for WindowSize {
    fn from(ws: Winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

/// A configured pseudo-terminal whose slave side has not been opened yet.
///
/// The slave is only ever opened inside the forked child, so the parent
/// holds nothing but the master descriptor.
pub struct Pty {
    master: PtyMaster,
    slave_path: CString,
}

impl Pty {
    /// Allocate a raw-mode PTY with the default window size
    pub fn new() -> Result<Self, PtyError> {
        Self::with_size(WindowSize::default())
    }

    /// Allocate a raw-mode PTY with the given initial window size
    pub fn with_size(size: WindowSize) -> Result<Self, PtyError> {
        let master = posix_openpt(OPEN_FLAGS).map_err(allocation_failed("open multiplexer"))?;

        // Keeps the master out of every child image, including ours. Linux
        // already set it atomically above; elsewhere there is a short window.
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(allocation_failed("set close-on-exec"))?;

        grantpt(&master).map_err(allocation_failed("grant slave"))?;
        unlockpt(&master).map_err(allocation_failed("unlock slave"))?;
        let slave_path = slave_name(&master)?;

        let pty = Self { master, slave_path };
        pty.configure(size);

        debug!(
            master = pty.master_fd(),
            slave = %pty.slave_path.to_string_lossy(),
            "allocated pty"
        );

        Ok(pty)
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        set_window_size(self.master_fd(), size).map_err(PtyError::Terminal)
    }

    /// Current window size as seen by the line discipline
    pub fn window_size(&self) -> Result<WindowSize, PtyError> {
        window_size(self.master_fd()).map_err(PtyError::Terminal)
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn slave_path(&self) -> &CStr {
        &self.slave_path
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Give up the slave path and keep only the master descriptor.
    pub(crate) fn into_master(self) -> File {
        let fd = self.master.into_raw_fd();
        // SAFETY: `into_raw_fd` transferred sole ownership of an open descriptor.
        unsafe { File::from_raw_fd(fd) }
    }

    /// Raw mode and the initial window size. Failures here leave a usable
    /// but cooked terminal, so they are logged rather than returned.
    fn configure(&self, size: WindowSize) {
        if let Err(e) = apply_raw_mode(self.master.as_fd()) {
            warn!(error = %e, "failed to put pty into raw mode");
        }
        if let Err(e) = set_window_size(self.master_fd(), size) {
            warn!(error = %e, "failed to set initial pty window size");
        }
    }
}

impl AsRawFd for Pty {
    fn as_raw_fd(&self) -> RawFd {
        self.master_fd()
    }
}

fn allocation_failed(stage: &'static str) -> impl FnOnce(Errno) -> PtyError {
    move |source| PtyError::PtyAllocationFailed { stage, source }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn slave_name(master: &PtyMaster) -> Result<CString, PtyError> {
    let name = nix::pty::ptsname_r(master).map_err(allocation_failed("resolve slave path"))?;
    CString::new(name).map_err(|_| PtyError::PtyAllocationFailed {
        stage: "resolve slave path",
        source: Errno::EINVAL,
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn slave_name(master: &PtyMaster) -> Result<CString, PtyError> {
    // SAFETY: the returned name is copied before any other ptsname call.
    let name =
        unsafe { nix::pty::ptsname(master) }.map_err(allocation_failed("resolve slave path"))?;
    CString::new(name).map_err(|_| PtyError::PtyAllocationFailed {
        stage: "resolve slave path",
        source: Errno::EINVAL,
    })
}

/// Rewrite `termios` to raw mode: no input, output or line-discipline
/// processing, 8-bit characters, receiver on, modem lines ignored, reads
/// return after a single byte with no driver timeout, UTF-8 input flagged.
pub fn make_raw(termios: &mut Termios) {
    termios.input_flags = UTF8_INPUT;
    termios.output_flags = OutputFlags::empty();
    termios.local_flags = LocalFlags::empty();
    termios.control_flags = ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
}

/// Apply [`make_raw`] to the terminal behind `fd`, effective immediately.
pub fn apply_raw_mode(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut attrs = termios::tcgetattr(fd)?;
    make_raw(&mut attrs);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(())
}

/// Set the UTF-8 input flag if it is missing.
///
/// Returns whether attributes had to be re-applied.
pub fn enable_utf8(fd: BorrowedFd<'_>) -> io::Result<bool> {
    let mut attrs = termios::tcgetattr(fd)?;
    if attrs.input_flags.contains(UTF8_INPUT) {
        return Ok(false);
    }
    attrs.input_flags.insert(UTF8_INPUT);
    termios::tcsetattr(fd, SetArg::TCSANOW, &attrs)?;
    Ok(true)
}

pub fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let winsize = Winsize::from(size);

    unsafe {
        let ret = libc::ioctl(fd, libc::TIOCSWINSZ, &winsize as *const Winsize);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

pub fn window_size(fd: RawFd) -> io::Result<WindowSize> {
    let mut winsize = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    unsafe {
        let ret = libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize as *mut Winsize);
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(winsize.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_allocation() {
        let pty = Pty::new().unwrap();
        assert!(pty.master_fd() > 2);
        assert!(!pty.slave_path().to_bytes().is_empty());
    }

    #[test]
    fn test_master_is_close_on_exec() {
        let pty = Pty::new().unwrap();
        let flags = fcntl(pty.master_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_default_window_size() {
        let pty = Pty::new().unwrap();
        assert_eq!(pty.window_size().unwrap(), WindowSize::default());
    }

    #[test]
    fn test_pty_resize() {
        let pty = Pty::new().unwrap();
        pty.resize(WindowSize::new(30, 100)).unwrap();
        assert_eq!(pty.window_size().unwrap(), WindowSize::new(30, 100));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_raw_mode_applied() {
        let pty = Pty::new().unwrap();
        let attrs = termios::tcgetattr(pty.master.as_fd()).unwrap();

        assert_eq!(attrs.input_flags, InputFlags::IUTF8);
        assert!(attrs.output_flags.is_empty());
        assert!(!attrs.local_flags.contains(LocalFlags::ECHO));
        assert!(!attrs.local_flags.contains(LocalFlags::ICANON));
        assert!(attrs.control_flags.contains(ControlFlags::CS8));
        assert!(attrs.control_flags.contains(ControlFlags::CREAD));
        assert_eq!(attrs.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(attrs.control_chars[SpecialCharacterIndices::VTIME as usize], 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_enable_utf8_is_idempotent() {
        let pty = Pty::new().unwrap();
        let fd = pty.master.as_fd();

        let mut attrs = termios::tcgetattr(fd).unwrap();
        attrs.input_flags.remove(InputFlags::IUTF8);
        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).unwrap();

        assert!(enable_utf8(fd).unwrap());
        assert!(!enable_utf8(fd).unwrap());
        let attrs = termios::tcgetattr(fd).unwrap();
        assert!(attrs.input_flags.contains(InputFlags::IUTF8));
    }
}
