//! remote-exec: run a client's command and send its output back
//!
//! Two modes share one binary:
//! - `serve`: accept one connection at a time, read a command line, execute
//!   it with its standard output redirected onto the connection, then close
//! - `chat`: a two-way text chat with a single peer
//!
//! Features:
//! - `PATH` lookup with POSIX first-match semantics
//! - Optional status frame after each command's output
//! - Graceful shutdown on SIGINT between connections
//! - Configuration via CLI arguments or TOML file

mod chat;
mod config;
mod exec;
mod listener;
mod server;
mod shutdown;

use config::{Config, Mode};
use shutdown::ShutdownToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging. Standard output may be pointed at a client, so
    // logs always go to standard error.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        mode = ?config.mode,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        max_args = config.max_args,
        status_frame = config.status_frame,
        "Starting remote-exec"
    );

    match config.mode {
        Mode::Serve => run_server(config),
        Mode::Chat(role) => run_chat(config, role),
    }
}

/// Run the command server until SIGINT
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = ShutdownToken::new();
    // Must happen before any other thread exists
    shutdown::watch_sigint(shutdown.clone())?;
    server::run(config, shutdown)?;
    Ok(())
}

/// Run a chat session with one peer
fn run_chat(config: Config, role: config::ChatRole) -> Result<(), Box<dyn std::error::Error>> {
    info!(?role, "Using chat mode");
    chat::run(config, role)?;
    Ok(())
}
