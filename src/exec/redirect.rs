//! Standard output redirection onto a connection.
//!
//! A [`Redirect`] swaps one descriptor (standard output in the server) for
//! the connection's socket and keeps a close-on-exec duplicate of the
//! original in a save slot. The original is put back when the guard is
//! restored or dropped, so every exit path from the redirected segment
//! restores it. Standard input and standard error are never touched.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use thiserror::Error;
use tracing::{trace, warn};

/// Errors while swapping descriptors.
#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("dup of descriptor {fd} failed: {source}")]
    Save { fd: RawFd, source: Errno },
    #[error("dup2 onto descriptor {fd} failed: {source}")]
    Redirect { fd: RawFd, source: Errno },
    #[error("restoring descriptor {fd} failed: {source}")]
    Restore { fd: RawFd, source: Errno },
}

/// Guard for one redirected segment.
#[must_use = "dropping the guard ends the redirected segment"]
#[derive(Debug)]
pub struct Redirect {
    target: RawFd,
    saved: Option<OwnedFd>,
}

impl Redirect {
    /// Point standard output at `conn` until the guard goes away.
    pub fn stdout_to(conn: &impl AsRawFd) -> Result<Self, RedirectError> {
        Self::onto(conn.as_raw_fd(), libc::STDOUT_FILENO)
    }

    /// Duplicate `source` onto `target`, saving the original `target`.
    pub fn onto(source: RawFd, target: RawFd) -> Result<Self, RedirectError> {
        flush_if_stdout(target);

        let saved = fcntl(target, FcntlArg::F_DUPFD_CLOEXEC(0))
            .map_err(|source| RedirectError::Save { fd: target, source })?;

        // From here on, dropping the guard puts the original back
        let guard = Redirect {
            target,
            // SAFETY: `saved` was just returned by fcntl and is owned by nobody else.
            saved: Some(unsafe { OwnedFd::from_raw_fd(saved) }),
        };

        dup2(source, target).map_err(|source| RedirectError::Redirect { fd: target, source })?;
        trace!(from = source, fd = target, "descriptor redirected");

        Ok(guard)
    }

    /// End the redirected segment, reporting a failed restore.
    pub fn restore(mut self) -> Result<(), RedirectError> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<(), RedirectError> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };

        flush_if_stdout(self.target);
        let result = dup2(saved.as_raw_fd(), self.target).map_err(|source| {
            RedirectError::Restore {
                fd: self.target,
                source,
            }
        });
        // The save slot is closed whether or not the restore worked
        drop(saved);

        if result.is_ok() {
            trace!(fd = self.target, "descriptor restored");
        }
        result
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        if let Err(e) = self.restore_inner() {
            warn!(fd = self.target, error = %e, "Failed to restore descriptor");
        }
    }
}

fn flush_if_stdout(fd: RawFd) {
    if fd == libc::STDOUT_FILENO {
        let _ = io::stdout().flush();
    }
}

fn dup2(source: RawFd, target: RawFd) -> nix::Result<()> {
    loop {
        match unistd::dup2(source, target) {
            Err(Errno::EINTR) => continue,
            result => return result.map(drop),
        }
    }
}
