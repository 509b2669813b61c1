//! Connection handler: drives one command cycle to completion.
//!
//! ```text
//! Idle -> Reading -> Redirecting -> Executing -> Restoring -> Acknowledging -> Closed
//! ```
//!
//! Any state may jump straight to `Closed` on error. Once `Redirecting` has
//! begun, standard output is restored before the handler returns, whatever
//! the path out.

use crate::config::Config;
use crate::exec::launcher::{self, ExecArena, ExitStatus, LaunchError};
use crate::exec::redirect::{Redirect, RedirectError};
use crate::exec::resolver::SearchPath;
use crate::exec::tokenizer::{tokenize_bytes, ArgVector};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Current state of a command cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Accepted, nothing read yet.
    Idle,
    /// Blocked on the single command read.
    Reading,
    /// Swapping standard output for the connection.
    Redirecting,
    /// Resolving, forking and waiting for the child.
    Executing,
    /// Putting the original standard output back.
    Restoring,
    /// Writing the completion marker.
    Acknowledging,
    /// Done; the caller closes the connection.
    Closed,
}

/// Per-cycle settings taken from the server config.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Capacity of the single command read.
    pub buffer_size: usize,
    /// Maximum arguments, command name included.
    pub max_args: usize,
    /// Append a status line after the command output.
    pub status_frame: bool,
}

impl From<&Config> for CycleOptions {
    fn from(config: &Config) -> Self {
        Self {
            buffer_size: config.buffer_size,
            max_args: config.max_args,
            status_frame: config.status_frame,
        }
    }
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            max_args: crate::exec::tokenizer::MAX_ARGS,
            status_frame: false,
        }
    }
}

/// How a cycle that did not hit an internal error ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The client closed (or the read failed) before sending a command.
    Disconnected,
    /// The command ran and was reaped.
    Completed {
        command: String,
        status: ExitStatus,
    },
    /// No executable could be found or exec'd for the command.
    InvalidCommand { command: String },
}

/// Errors that abort a cycle. The server logs them and keeps accepting.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("redirect failed: {0}")]
    Redirect(#[from] RedirectError),
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("acknowledgment failed: {0}")]
    Acknowledge(#[source] io::Error),
}

/// Result of the executing state.
enum Execution {
    Ran(ExitStatus),
    NotFound,
    Failed(LaunchError),
}

/// Build the status trailer for an execution.
fn status_frame(execution: &Execution) -> Vec<u8> {
    match execution {
        Execution::Ran(ExitStatus::Exited(code)) => format!("OK {code}\n").into_bytes(),
        Execution::Ran(ExitStatus::Signaled(signal)) => {
            format!("SIGNAL {}\n", *signal as i32).into_bytes()
        }
        Execution::NotFound => b"ERR invalid command\n".to_vec(),
        Execution::Failed(e) => format!("ERR {e}\n").into_bytes(),
    }
}

/// Print a local notice on the server's own standard output.
fn console(message: std::fmt::Arguments<'_>) {
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{message}");
    let _ = stdout.flush();
}

/// One command cycle over one connection.
#[derive(Debug)]
pub struct CommandCycle<'a> {
    state: CycleState,
    options: &'a CycleOptions,
}

impl<'a> CommandCycle<'a> {
    pub fn new(options: &'a CycleOptions) -> Self {
        Self {
            state: CycleState::Idle,
            options,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    fn advance(&mut self, next: CycleState) {
        trace!(from = ?self.state, to = ?next, "cycle state");
        self.state = next;
    }

    /// Drive the cycle over `conn` until it reaches `Closed`.
    pub fn run<S>(&mut self, conn: &mut S) -> Result<CycleOutcome, CycleError>
    where
        S: Read + Write + AsRawFd,
    {
        let result = self.run_inner(conn);
        self.advance(CycleState::Closed);
        result
    }

    fn run_inner<S>(&mut self, conn: &mut S) -> Result<CycleOutcome, CycleError>
    where
        S: Read + Write + AsRawFd,
    {
        self.advance(CycleState::Reading);
        let mut buffer = vec![0u8; self.options.buffer_size];
        let n = match read_once(conn, &mut buffer) {
            Ok(0) => {
                debug!("Client disconnected without sending a command");
                return Ok(CycleOutcome::Disconnected);
            }
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Command read failed");
                return Ok(CycleOutcome::Disconnected);
            }
        };

        let args = tokenize_bytes(&buffer[..n], self.options.max_args);
        if args.is_placeholder() {
            debug!(bytes = n, "Empty command line");
        }
        let command = args.as_slice().join(" ");
        console(format_args!("Command from client: {command}"));

        self.advance(CycleState::Redirecting);
        let redirect = Redirect::stdout_to(&*conn)?;

        self.advance(CycleState::Executing);
        let execution = execute(&args);

        self.advance(CycleState::Restoring);
        redirect.restore()?;

        self.advance(CycleState::Acknowledging);
        let marker = if self.options.status_frame {
            status_frame(&execution)
        } else {
            Vec::new()
        };
        conn.write_all(&marker)
            .and_then(|_| conn.flush())
            .map_err(CycleError::Acknowledge)?;

        let outcome = outcome_of(command, execution)?;
        console(format_args!("Successful Output from Client."));
        Ok(outcome)
    }
}

/// Map an execution to the cycle's outcome. Launch failures other than a
/// failed exec abort the cycle.
fn outcome_of(command: String, execution: Execution) -> Result<CycleOutcome, CycleError> {
    match execution {
        Execution::Ran(status) => {
            if status.success() {
                info!(%command, "Command completed");
            } else {
                info!(%command, %status, "Command completed unsuccessfully");
            }
            Ok(CycleOutcome::Completed { command, status })
        }
        Execution::NotFound => Ok(CycleOutcome::InvalidCommand { command }),
        Execution::Failed(LaunchError::ExecFailed { errno }) => {
            warn!(%command, error = %errno, "Invalid command");
            Ok(CycleOutcome::InvalidCommand { command })
        }
        Execution::Failed(e) => Err(CycleError::Launch(e)),
    }
}

/// Resolve and run the command. Runs inside the redirected segment, so
/// nothing here may write to standard output.
fn execute(args: &ArgVector) -> Execution {
    // PATH is read per command so changes between connections take effect
    let search = SearchPath::from_env();
    let candidates: Vec<PathBuf> = search.candidates(args.command()).collect();
    if candidates.is_empty() {
        warn!(
            command = args.command(),
            searched = search.dirs().len(),
            "Invalid command"
        );
        return Execution::NotFound;
    }

    let arena = match ExecArena::new(candidates, args) {
        Ok(arena) => arena,
        Err(e) => return Execution::Failed(e),
    };
    trace!(
        command = args.command(),
        arguments = ?args.arguments(),
        argc = args.len(),
        candidates = arena.candidates(),
        "Launching"
    );

    let child = match launcher::launch(arena) {
        Ok(child) => child,
        Err(e) => return Execution::Failed(e),
    };

    let pid = child.pid();
    match child.wait() {
        Ok(status) => {
            debug!(%pid, %status, "Child reaped");
            Execution::Ran(status)
        }
        Err(e) => Execution::Failed(e),
    }
}

/// One read, retried only when interrupted.
fn read_once<R: Read>(conn: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match conn.read(buffer) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Run one full command cycle on an accepted connection.
///
/// The caller owns the connection and closes it after this returns.
pub fn handle_connection<S>(conn: &mut S, options: &CycleOptions) -> Result<CycleOutcome, CycleError>
where
    S: Read + Write + AsRawFd,
{
    let mut cycle = CommandCycle::new(options);
    let result = cycle.run(conn);
    debug_assert_eq!(cycle.state(), CycleState::Closed);
    result
}
