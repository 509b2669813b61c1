//! Shutdown signalling.
//!
//! The accept loop watches a [`ShutdownToken`] instead of a process-wide
//! flag. On the server, SIGINT is taken off every thread and handled by a
//! dedicated watcher thread that cancels the token, so a command cycle in
//! flight is never interrupted.

use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// Cloneable cancellation token.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken {
    cancelled: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Block SIGINT on the calling thread and cancel `token` when it arrives.
///
/// Call before any other thread is spawned: new threads inherit the mask,
/// so only the watcher ever receives the signal. Forked children reset
/// their mask before exec.
pub fn watch_sigint(token: ShutdownToken) -> io::Result<thread::JoinHandle<()>> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.thread_block()?;

    thread::Builder::new()
        .name("sigint-watcher".to_string())
        .spawn(move || loop {
            match mask.wait() {
                Ok(Signal::SIGINT) => {
                    info!("Received SIGINT, shutting down after the current connection");
                    token.cancel();
                    return;
                }
                Ok(signal) => debug!(?signal, "sigwait returned without SIGINT"),
                Err(e) => debug!(error = %e, "sigwait failed"),
            }
        })
}
