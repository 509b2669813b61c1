//! Process launcher: fork, exec, wait.
//!
//! Everything the child needs is prepared in the parent before `fork()`.
//! After the fork the child only makes raw async-signal-safe calls
//! (`sigprocmask`, `signal`, `execv`, `write`, `_exit`) and never allocates,
//! so it is safe even though the server runs a signal-watcher thread.
//!
//! Resolution and execution form one fallible step: the child tries every
//! resolved candidate in search order, and if none can be exec'd it reports
//! the errno through a close-on-exec pipe. A closed pipe with no data means
//! the exec succeeded.

use crate::exec::tokenizer::ArgVector;
use libc::c_char;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, pipe, read, ForkResult, Pid};
use std::ffi::CString;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, trace};

/// Exit code of a child whose exec failed.
const EXEC_FAILED_CODE: libc::c_int = 127;

/// Errors while launching or reaping a child.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("argument contains a NUL byte")]
    NulByte,
    #[error("pipe failed: {0}")]
    Pipe(#[source] Errno),
    #[error("fork failed: {0}")]
    Fork(#[source] Errno),
    #[error("exec failed: {errno}")]
    ExecFailed { errno: Errno },
    #[error("waitpid failed: {0}")]
    Wait(#[source] Errno),
}

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(Signal),
}

impl ExitStatus {
    /// Terminal statuses only; stops and continues are not exits.
    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitStatus::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitStatus::Signaled(signal)),
            _ => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Exited(code) => write!(f, "exit code {code}"),
            ExitStatus::Signaled(signal) => write!(f, "signal {}", *signal as i32),
        }
    }
}

/// NUL-terminated copies of the executable candidates and argument vector.
///
/// Built once before the fork and moved into [`launch`]; the parent drops it
/// right after forking.
pub struct ExecArena {
    paths: Vec<CString>,
    // Owns the strings `argv_ptrs` points into
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
}

impl ExecArena {
    /// Prepare `candidates` (in search order) and `args` for `execv`.
    pub fn new(candidates: Vec<PathBuf>, args: &ArgVector) -> Result<Self, LaunchError> {
        let paths = candidates
            .iter()
            .map(|path| CString::new(path.as_os_str().as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| LaunchError::NulByte)?;

        let argv = args
            .as_slice()
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| LaunchError::NulByte)?;

        let argv_ptrs = argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            paths,
            _argv: argv,
            argv_ptrs,
        })
    }

    pub fn candidates(&self) -> usize {
        self.paths.len()
    }
}

/// A forked child that has not been reaped yet.
#[must_use = "every child must be waited on"]
#[derive(Debug)]
pub struct Child {
    pid: Pid,
}

impl Child {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Block until the child terminates. Consumes the child, so a pid is
    /// reaped exactly once.
    pub fn wait(self) -> Result<ExitStatus, LaunchError> {
        wait_pid(self.pid)
    }
}

fn wait_pid(pid: Pid) -> Result<ExitStatus, LaunchError> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(exit) = ExitStatus::from_wait(status) {
                    return Ok(exit);
                }
                trace!(?status, "child not terminated yet");
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(LaunchError::Wait(e)),
        }
    }
}

/// Create a pipe whose ends are both close-on-exec.
fn cloexec_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Read the errno a failed child reported, or `None` if the exec succeeded.
fn read_exec_errno(pipe: &OwnedFd) -> nix::Result<Option<Errno>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        match read(pipe.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }

    if filled == buf.len() {
        Ok(Some(Errno::from_raw(i32::from_ne_bytes(buf))))
    } else {
        Ok(None)
    }
}

/// Child side of the fork. Never returns.
///
/// # Safety
///
/// Must only be called in a freshly forked child. Touches nothing but the
/// prepared arena, the pipe descriptor, and async-signal-safe calls.
unsafe fn exec_child(arena: &ExecArena, report: libc::c_int, mask: &libc::sigset_t) -> ! {
    // The server blocks SIGINT for its watcher thread; commands get a clean mask
    libc::sigprocmask(libc::SIG_SETMASK, mask, std::ptr::null_mut());
    // The Rust runtime ignores SIGPIPE; a command writing to a closed
    // connection must die of it instead of spinning on EPIPE
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    let mut errno = libc::ENOENT;
    for path in &arena.paths {
        libc::execv(path.as_ptr(), arena.argv_ptrs.as_ptr());
        errno = Errno::last_raw();
    }

    let bytes = errno.to_ne_bytes();
    libc::write(report, bytes.as_ptr().cast(), bytes.len());
    libc::_exit(EXEC_FAILED_CODE)
}

/// Fork once and exec the prepared command in the child.
///
/// On success the returned [`Child`] is running the command. If no candidate
/// could be exec'd the child is reaped here and [`LaunchError::ExecFailed`]
/// is returned.
pub fn launch(arena: ExecArena) -> Result<Child, LaunchError> {
    let (read, write) = cloexec_pipe().map_err(LaunchError::Pipe)?;

    let empty_mask = SigSet::empty();

    // SAFETY: the child branch only runs exec_child, which is async-signal-safe.
    match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => unsafe {
            exec_child(&arena, write.as_raw_fd(), empty_mask.as_ref())
        },
        ForkResult::Parent { child: pid } => {
            drop(write);
            drop(arena);
            trace!(%pid, "forked child");

            match read_exec_errno(&read) {
                Ok(None) => Ok(Child { pid }),
                Ok(Some(errno)) => {
                    let status = wait_pid(pid)?;
                    debug!(%pid, %errno, %status, "child could not exec");
                    Err(LaunchError::ExecFailed { errno })
                }
                Err(e) => {
                    // Still reap it; the pipe error is what gets reported
                    let _ = wait_pid(pid);
                    Err(LaunchError::Pipe(e))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::resolver::SearchPath;
    use crate::exec::tokenizer::{tokenize, MAX_ARGS};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn run(arena: ExecArena) -> Result<ExitStatus, LaunchError> {
        launch(arena)?.wait()
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn arena_for(line: &str) -> ExecArena {
        let args = tokenize(line, MAX_ARGS);
        let candidates: Vec<PathBuf> = SearchPath::from_env().candidates(args.command()).collect();
        assert!(!candidates.is_empty(), "{} not found on PATH", args.command());
        ExecArena::new(candidates, &args).unwrap()
    }

    #[test]
    fn test_run_success() {
        assert_eq!(run(arena_for("true")).unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn test_run_reports_exit_code() {
        assert_eq!(run(arena_for("false")).unwrap(), ExitStatus::Exited(1));

        let dir = TempDir::new().unwrap();
        let path = script(dir.path(), "exit3", "#!/bin/sh\nexit 3\n");
        let arena = ExecArena::new(vec![path], &tokenize("exit3", MAX_ARGS)).unwrap();
        let status = run(arena).unwrap();
        assert_eq!(status, ExitStatus::Exited(3));
        assert!(!status.success());
    }

    #[test]
    fn test_run_reports_signal() {
        let dir = TempDir::new().unwrap();
        let path = script(dir.path(), "killself", "#!/bin/sh\nkill -9 $$\n");
        let arena = ExecArena::new(vec![path], &tokenize("killself", MAX_ARGS)).unwrap();
        assert_eq!(run(arena).unwrap(), ExitStatus::Signaled(Signal::SIGKILL));
    }

    #[test]
    fn test_child_gets_default_sigpipe() {
        // The test harness ignores SIGPIPE, just like the server
        let dir = TempDir::new().unwrap();
        let path = script(dir.path(), "pipekill", "#!/bin/sh\nkill -PIPE $$\nexit 0\n");
        let arena = ExecArena::new(vec![path], &tokenize("pipekill", MAX_ARGS)).unwrap();
        assert_eq!(run(arena).unwrap(), ExitStatus::Signaled(Signal::SIGPIPE));
    }

    #[test]
    fn test_exec_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = script(dir.path(), "notabinary", "plain text, no interpreter line\n");
        let arena = ExecArena::new(vec![path], &tokenize("notabinary", MAX_ARGS)).unwrap();
        match launch(arena) {
            Err(LaunchError::ExecFailed { errno }) => assert_eq!(errno, Errno::ENOEXEC),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_exec_falls_through_to_next_candidate() {
        let dir = TempDir::new().unwrap();
        let bad = script(dir.path(), "true", "plain text, no interpreter line\n");
        let good = SearchPath::from_env().resolve("true").unwrap();
        let arena = ExecArena::new(vec![bad, good], &tokenize("true", MAX_ARGS)).unwrap();
        assert_eq!(arena.candidates(), 2);
        assert_eq!(run(arena).unwrap(), ExitStatus::Exited(0));
    }

    #[test]
    fn test_no_candidates_fails_without_running() {
        let arena = ExecArena::new(Vec::new(), &tokenize("anything", MAX_ARGS)).unwrap();
        assert!(matches!(
            launch(arena),
            Err(LaunchError::ExecFailed { errno }) if errno == Errno::ENOENT
        ));
    }

    #[test]
    fn test_nul_byte_rejected() {
        let args = tokenize("echo a\0b", MAX_ARGS);
        assert!(matches!(
            ExecArena::new(Vec::new(), &args),
            Err(LaunchError::NulByte)
        ));
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Exited(2).to_string(), "exit code 2");
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).to_string(), "signal 9");
    }
}
