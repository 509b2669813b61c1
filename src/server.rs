//! TCP server for remote command execution.
//!
//! Accepts one connection at a time and drives its command cycle to
//! completion before accepting the next. Further clients wait in the
//! listen backlog.

use crate::config::Config;
use crate::exec::{handle_connection, CycleOptions, CycleOutcome};
use crate::listener;
use crate::shutdown::ShutdownToken;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsFd;
use tracing::{debug, error, info, warn};

/// How long the accept loop waits before rechecking the shutdown token.
const POLL_INTERVAL_MS: u16 = 250;

/// Server instance
pub struct Server {
    listener: TcpListener,
    options: CycleOptions,
    shutdown: ShutdownToken,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub fn bind(config: &Config, shutdown: ShutdownToken) -> io::Result<Self> {
        let listener = listener::bind(config.listen, config.backlog)?;
        Ok(Server {
            listener,
            options: CycleOptions::from(config),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until the shutdown token is cancelled.
    pub fn run(&self) -> io::Result<()> {
        info!(address = %self.local_addr()?, "Server listening");

        while !self.shutdown.is_cancelled() {
            if !wait_readable(&self.listener, POLL_INTERVAL_MS)? {
                continue;
            }

            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    info!(peer = %peer, "Accepted connection");

                    match handle_connection(&mut stream, &self.options) {
                        Ok(CycleOutcome::Disconnected) => {
                            debug!(peer = %peer, "Peer sent no command")
                        }
                        Ok(outcome) => debug!(peer = %peer, ?outcome, "Command cycle finished"),
                        Err(e) => warn!(peer = %peer, error = %e, "Command cycle failed"),
                    }

                    // Closing the connection ends the client's output stream
                    drop(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Wait up to `timeout_ms` for the listener to have a pending connection.
fn wait_readable(listener: &TcpListener, timeout_ms: u16) -> io::Result<bool> {
    let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];

    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(fds[0]
            .revents()
            .is_some_and(|revents| revents.contains(PollFlags::POLLIN))),
        Err(e) => Err(e.into()),
    }
}

/// Bind and run the server with the given shutdown token.
pub fn run(config: Config, shutdown: ShutdownToken) -> io::Result<()> {
    let server = Server::bind(&config, shutdown)?;
    server.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use std::net::TcpStream;
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            mode: Mode::Serve,
            listen: "127.0.0.1:0".parse().unwrap(),
            backlog: 4,
            buffer_size: 1024,
            max_args: 100,
            status_frame: false,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_server_stops_on_cancel() {
        let shutdown = ShutdownToken::new();
        let server = Server::bind(&test_config(), shutdown.clone()).unwrap();

        let start = Instant::now();
        let handle = thread::spawn(move || server.run());
        shutdown.cancel();
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_server_survives_silent_client() {
        let shutdown = ShutdownToken::new();
        let server = Server::bind(&test_config(), shutdown.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.run());

        // Connect and close without sending anything, twice
        for _ in 0..2 {
            drop(TcpStream::connect(addr).unwrap());
        }
        // A later client is still accepted
        let client = TcpStream::connect(addr).unwrap();
        drop(client);

        shutdown.cancel();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_readable_times_out() {
        let listener = listener::bind("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        assert!(!wait_readable(&listener, 10).unwrap());

        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert!(wait_readable(&listener, 1000).unwrap());
    }
}
