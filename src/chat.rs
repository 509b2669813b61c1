//! Two-way chat over a single TCP connection.
//!
//! One side waits for a peer (`chat -a`), the other connects (`chat -c`).
//! Once connected, two directions run side by side:
//! - outgoing: every line typed on stdin is sent to the peer verbatim
//! - incoming: every chunk received is printed as `Received: <text>`
//!
//! The session ends when stdin reaches EOF, the peer hangs up, or Ctrl-C
//! is pressed. There is no process management here.

use crate::config::{ChatRole, Config};
use crate::listener;
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Receive buffer size
const BUFFER_SIZE: usize = 1024;

/// Why a chat session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local input reached EOF.
    InputClosed,
    /// The peer closed the connection.
    PeerClosed,
    /// Interrupted locally (Ctrl-C).
    Interrupted,
}

/// Send every line from `input` to `writer` until `input` hits EOF.
///
/// Returns the number of bytes sent.
pub async fn pump_outgoing<R, W>(mut input: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::with_capacity(BUFFER_SIZE);
    let mut sent = 0u64;

    loop {
        line.clear();
        let n = input.read_line(&mut line).await?;
        if n == 0 {
            return Ok(sent);
        }

        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        sent += n as u64;
    }
}

/// Print everything received on `reader` to `output` until the peer closes.
pub async fn pump_incoming<R, W>(mut reader: R, mut output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buffer.clear();
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            output.write_all(b"Connection closed by peer.\n").await?;
            output.flush().await?;
            return Ok(());
        }

        let text = String::from_utf8_lossy(&buffer);
        let text = text.trim_end_matches(['\r', '\n']);
        output
            .write_all(format!("Received: {text}\n").as_bytes())
            .await?;
        output.flush().await?;
    }
}

/// Run both directions over `stream` until one of them ends or `interrupt`
/// resolves.
pub async fn duplex<S, I, O, F>(stream: S, input: I, mut output: O, interrupt: F) -> io::Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
    F: Future,
{
    let (reader, writer) = tokio::io::split(stream);

    let end = tokio::select! {
        sent = pump_outgoing(input, writer) => {
            let sent = sent?;
            debug!(bytes = sent, "Input closed");
            output.write_all(b"Exiting...\n").await?;
            output.flush().await?;
            SessionEnd::InputClosed
        }
        received = pump_incoming(reader, &mut output) => {
            received?;
            SessionEnd::PeerClosed
        }
        _ = interrupt => SessionEnd::Interrupted,
    };

    Ok(end)
}

/// Establish the chat connection for `role`.
async fn establish(role: ChatRole, config: &Config) -> io::Result<TcpStream> {
    match role {
        ChatRole::Accept => {
            let std_listener = listener::bind(config.listen, config.backlog)?;
            std_listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(std_listener)?;
            info!(address = %config.listen, "Chat listening");

            let (stream, peer) = listener.accept().await?;
            // Only one peer; stop listening right away
            drop(listener);
            info!(peer = %peer, "Peer connected");
            Ok(stream)
        }
        ChatRole::Connect => {
            let stream = TcpStream::connect(config.listen).await?;
            info!(address = %config.listen, "Connected to peer");
            Ok(stream)
        }
    }
}

/// Run a chat session on a fresh tokio runtime.
pub fn run(config: Config, role: ChatRole) -> io::Result<SessionEnd> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let stream = establish(role, &config).await?;
        let input = BufReader::new(tokio::io::stdin());
        let output = tokio::io::stdout();
        duplex(stream, input, output, tokio::signal::ctrl_c()).await
    });

    // A blocking stdin read would otherwise hold up shutdown
    runtime.shutdown_timeout(Duration::from_millis(100));

    let end = result?;
    info!(?end, "Chat session ended");
    Ok(end)
}
