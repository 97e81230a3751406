//! Forking a child onto the slave side of a PTY
//!
//! All argument conversion happens before `fork` so the child only touches
//! memory it inherited. The child branch never returns: it either replaces
//! its image or exits with one of the distinguished codes below.

use crate::pty::{Pty, WindowSize};
use crate::session::Session;
use crate::PtyError;
use nix::errno::Errno;
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};
use nix::unistd::{chdir, fork, setsid, ForkResult};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exit status of a child whose `execvp` failed.
pub const EXEC_FAILED_EXIT_CODE: i32 = 127;

/// Exit status of a child that could not open its slave device.
pub const SLAVE_OPEN_FAILED_EXIT_CODE: i32 = 255;

/// Everything needed to launch a session.
///
/// The child's environment is exactly [`SpawnRequest::env`] entries; nothing
/// is inherited unless [`SpawnRequest::inherit_env`] copies it in first.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    command: PathBuf,
    cwd: PathBuf,
    args: Vec<OsString>,
    env: Vec<OsString>,
    window_size: WindowSize,
}

impl SpawnRequest {
    /// Run `command` (looked up on `PATH` if it has no slash) in `cwd`.
    pub fn new(command: impl Into<PathBuf>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            args: Vec::new(),
            env: Vec::new(),
            window_size: WindowSize::default(),
        }
    }

    /// Append to the argument vector. The first argument is the program
    /// name the child sees as `argv[0]`.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a `KEY=VALUE` environment entry
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let mut entry = key.as_ref().to_os_string();
        entry.push("=");
        entry.push(value.as_ref());
        self.env.push(entry);
        self
    }

    /// Add pre-formatted `KEY=VALUE` entries
    pub fn env_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.env.extend(entries.into_iter().map(Into::into));
        self
    }

    /// Copy the calling process's environment into the request
    pub fn inherit_env(self) -> Self {
        let vars: Vec<_> = std::env::vars_os().collect();
        vars.into_iter()
            .fold(self, |request, (key, value)| request.env(key, value))
    }

    pub fn window_size(mut self, size: WindowSize) -> Self {
        self.window_size = size;
        self
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_env(&self) -> &[OsString] {
        &self.env
    }

    pub fn get_window_size(&self) -> WindowSize {
        self.window_size
    }
}

/// Allocate a PTY sized per `request` and launch the child on it.
pub fn spawn(request: &SpawnRequest) -> Result<Session, PtyError> {
    let plan = ExecPlan::prepare(request)?;
    let pty = Pty::with_size(request.window_size)?;
    pty.fork_exec(&plan)
}

impl Pty {
    /// Launch `request`'s child on this PTY, consuming it. The request's
    /// window size is ignored; the PTY keeps its own.
    pub fn spawn(self, request: &SpawnRequest) -> Result<Session, PtyError> {
        let plan = ExecPlan::prepare(request)?;
        self.fork_exec(&plan)
    }

    fn fork_exec(self, plan: &ExecPlan) -> Result<Session, PtyError> {
        // SAFETY: the child only calls into pre-built C strings and then
        // execs or `_exit`s.
        match unsafe { fork() } {
            Err(errno) => {
                // Dropping `self` closes the master before surfacing the error.
                drop(self);
                Err(PtyError::ForkFailed(errno))
            }
            Ok(ForkResult::Child) => exec_child(&self, plan),
            Ok(ForkResult::Parent { child }) => {
                info!(
                    pid = %child,
                    command = %plan.command.to_string_lossy(),
                    "spawned pty session"
                );
                Ok(Session::new(self.into_master(), child))
            }
        }
    }
}

/// Descriptors swept when the system reports no open-file limit
const FALLBACK_OPEN_MAX: libc::c_int = 1024;

extern "C" {
    static mut environ: *const *const libc::c_char;
}

/// C-string form of a [`SpawnRequest`], including the NULL-terminated
/// pointer arrays the child hands to `execvp` and installs as `environ`.
///
/// The pointers borrow from `argv` and `envp`, whose heap buffers stay put
/// for as long as the plan lives.
#[derive(Debug)]
struct ExecPlan {
    command: CString,
    cwd: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl ExecPlan {
    fn prepare(request: &SpawnRequest) -> Result<Self, PtyError> {
        let command = to_cstring("command", request.command.as_os_str())?;
        let cwd = to_cstring("working directory", request.cwd.as_os_str())?;

        let mut argv = request
            .args
            .iter()
            .map(|arg| to_cstring("argument", arg))
            .collect::<Result<Vec<_>, _>>()?;
        if argv.is_empty() {
            argv.push(command.clone());
        }

        let envp = request
            .env
            .iter()
            .map(|entry| {
                if !entry.as_bytes().contains(&b'=') {
                    return Err(PtyError::InvalidArgument(format!(
                        "environment entry {entry:?} is not KEY=VALUE"
                    )));
                }
                to_cstring("environment entry", entry)
            })
            .collect::<Result<Vec<_>, _>>()?;

        debug!(argc = argv.len(), envc = envp.len(), "prepared exec plan");

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            command,
            cwd,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn to_cstring(what: &str, value: &OsStr) -> Result<CString, PtyError> {
    CString::new(value.to_os_string().into_vec())
        .map_err(|_| PtyError::InvalidArgument(format!("{what} {value:?} contains a NUL byte")))
}

/// The child side of `fork`. Only async-signal-safe calls from here on:
/// everything that allocates was done by [`ExecPlan::prepare`].
fn exec_child(pty: &Pty, plan: &ExecPlan) -> ! {
    // The host may run under a signal-masking supervisor; don't pass that on.
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&SigSet::all()), None);
    // The Rust runtime ignores SIGPIPE and that disposition survives exec.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    unsafe {
        libc::close(pty.master_fd());
    }
    let _ = setsid();

    unsafe {
        let slave = libc::open(pty.slave_path().as_ptr(), libc::O_RDWR);
        if slave < 0 {
            libc::_exit(SLAVE_OPEN_FAILED_EXIT_CODE);
        }

        // Opening the slave after setsid already claims it on Linux.
        libc::ioctl(slave, libc::TIOCSCTTY as _, 0);

        libc::dup2(slave, 0);
        libc::dup2(slave, 1);
        libc::dup2(slave, 2);
        if slave > 2 {
            libc::close(slave);
        }
    }

    close_inherited_descriptors();

    // execvp searches PATH in, and passes on, exactly this environment.
    unsafe {
        environ = plan.envp_ptrs.as_ptr();
    }

    if let Err(errno) = chdir(plan.cwd.as_c_str()) {
        report_failure("chdir", &plan.cwd, errno);
    }

    unsafe {
        libc::execvp(plan.command.as_ptr(), plan.argv_ptrs.as_ptr());
    }
    report_failure("exec", &plan.command, Errno::last());

    unsafe { libc::_exit(EXEC_FAILED_EXIT_CODE) }
}

/// Print `call("path"): description` on the child's stderr, which is the
/// slave by now. Writes straight to fd 2: the std stderr handle takes a lock
/// another thread may have held at fork time.
fn report_failure(call: &str, path: &CStr, errno: Errno) {
    let parts: [&[u8]; 6] = [
        call.as_bytes(),
        b"(\"",
        path.to_bytes(),
        b"\"): ",
        errno.desc().as_bytes(),
        b"\n",
    ];
    for part in parts {
        unsafe {
            libc::write(2, part.as_ptr().cast(), part.len());
        }
    }
}

/// Close every descriptor above stderr, including ones the host opened
/// without close-on-exec.
fn close_inherited_descriptors() {
    #[cfg(target_os = "linux")]
    unsafe {
        let first: libc::c_uint = 3;
        if libc::syscall(libc::SYS_close_range, first, libc::c_uint::MAX, 0 as libc::c_uint) == 0 {
            return;
        }
    }

    // Kernels without close_range(2), and everything else
    let limit = match unsafe { libc::sysconf(libc::_SC_OPEN_MAX) } {
        n if n > 0 => n.min(libc::c_int::MAX as libc::c_long) as libc::c_int,
        _ => FALLBACK_OPEN_MAX,
    };
    for fd in 3..limit {
        unsafe {
            libc::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = SpawnRequest::new("sh", "/tmp")
            .arg("sh")
            .args(["-c", "true"])
            .env("FOO", "bar")
            .env_entries(["BAZ=qux"])
            .window_size(WindowSize::new(40, 120));

        assert_eq!(request.command(), Path::new("sh"));
        assert_eq!(request.cwd(), Path::new("/tmp"));
        assert_eq!(request.get_args(), ["sh", "-c", "true"]);
        assert_eq!(request.get_env(), ["FOO=bar", "BAZ=qux"]);
        assert_eq!(request.get_window_size(), WindowSize::new(40, 120));
    }

    #[test]
    fn test_empty_argv_defaults_to_command() {
        let plan = ExecPlan::prepare(&SpawnRequest::new("/bin/true", "/")).unwrap();
        assert_eq!(plan.argv, vec![CString::new("/bin/true").unwrap()]);
        assert!(plan.envp.is_empty());
        assert_eq!(plan.envp_ptrs, vec![std::ptr::null()]);
    }

    #[test]
    fn test_pointer_arrays_match_strings() {
        let request = SpawnRequest::new("/bin/sh", "/")
            .args(["sh", "-c", "true"])
            .env("A", "1")
            .env("B", "2");
        let plan = ExecPlan::prepare(&request).unwrap();

        assert_eq!(plan.argv_ptrs.len(), plan.argv.len() + 1);
        assert_eq!(plan.envp_ptrs.len(), plan.envp.len() + 1);
        assert!(plan.argv_ptrs.last().unwrap().is_null());
        assert!(plan.envp_ptrs.last().unwrap().is_null());

        for (ptr, arg) in plan.argv_ptrs.iter().zip(&plan.argv) {
            assert_eq!(unsafe { CStr::from_ptr(*ptr) }, arg.as_c_str());
        }
        for (ptr, entry) in plan.envp_ptrs.iter().zip(&plan.envp) {
            assert_eq!(unsafe { CStr::from_ptr(*ptr) }, entry.as_c_str());
        }
    }

    #[test]
    fn test_nul_bytes_rejected() {
        let request = SpawnRequest::new("/bin/echo", "/").arg("a\0b");
        assert!(matches!(
            ExecPlan::prepare(&request),
            Err(PtyError::InvalidArgument(_))
        ));

        let request = SpawnRequest::new("/bin/echo", "/").env("KEY", "v\0");
        assert!(matches!(
            ExecPlan::prepare(&request),
            Err(PtyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_env_entry_without_separator_rejected() {
        let request = SpawnRequest::new("/bin/echo", "/").env_entries(["NOEQUALS"]);
        assert!(matches!(
            ExecPlan::prepare(&request),
            Err(PtyError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_inherit_env_copies_host() {
        let request = SpawnRequest::new("env", "/").inherit_env();
        assert_eq!(request.get_env().len(), std::env::vars_os().count());
    }
}
