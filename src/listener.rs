//! Listening socket construction.

use std::io;
use std::net::{SocketAddr, TcpListener};

/// Create a blocking TCP listener bound to `addr`.
///
/// The address family follows `addr`. `SO_REUSEADDR` is set so a restarted
/// server can rebind while old connections sit in TIME_WAIT. The socket is
/// close-on-exec, so commands never inherit it.
pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let _client = TcpStream::connect(addr).unwrap();
        let (_conn, peer) = listener.accept().unwrap();
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_listener_is_close_on_exec() {
        let listener = bind("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let flags = fcntl(listener.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_bind_in_use_fails() {
        let first = bind("127.0.0.1:0".parse().unwrap(), 1).unwrap();
        let addr = first.local_addr().unwrap();
        assert!(bind(addr, 1).is_err());
    }
}
