//! Remote command execution core.
//!
//! One accepted connection carries one command:
//! - `tokenizer`: raw line to argument vector
//! - `resolver`: command name to executable path via `PATH`
//! - `launcher`: fork, exec and reap the child
//! - `redirect`: standard output onto the connection and back
//! - `handler`: the per-connection state machine tying these together
//!
//! ## Wire Format
//!
//! ```text
//! Client:  echo hello\n
//! Server:  hello\n          (the command's standard output)
//!          [OK 0\n]         (only with the status frame enabled)
//!          <close>
//! ```

pub mod handler;
pub mod launcher;
pub mod redirect;
pub mod resolver;
pub mod tokenizer;

pub use handler::{handle_connection, CycleOptions, CycleOutcome};
