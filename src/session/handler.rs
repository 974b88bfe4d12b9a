use log::{error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use crate::auth::Authenticator;
use crate::config::{SharedRuntimeConfig, StartupConfig};
use crate::protocol::responses::{READY, SERVICE_UNAVAILABLE, SYNTAX_ERROR, UNKNOWN_COMMAND};
use crate::protocol::{CommandStatus, HandlerContext, build_command, handle_command, split_command};
use crate::session::registry::{SessionGuard, SessionRegistry};
use crate::session::reply::ReplyWriter;
use crate::session::state::Session;
use crate::storage::FileSystem;

/// Services shared by every session of a server.
pub struct SessionServices {
    pub config: Arc<StartupConfig>,
    pub runtime: SharedRuntimeConfig,
    pub storage: Arc<dyn FileSystem>,
    pub auth: Arc<dyn Authenticator>,
    pub registry: Arc<SessionRegistry>,
}

/// Handles one FTP control connection from greeting to disconnect.
///
/// - Reads command lines with the configured idle timeout.
/// - Expands `SITE` and per-domain aliases before dispatching.
/// - Always closes the session and gives the registry slot back, whatever
///   ended the loop.
pub async fn handle_session<S>(
    stream: S,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    services: Arc<SessionServices>,
    guard: SessionGuard,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut replies = ReplyWriter::new(write_half, peer_addr);
    let mut session = Session::new(
        guard.id(),
        peer_addr,
        local_addr,
        services.config.buffer_size,
    );

    match replies.reply(READY, &services.config.banner).await {
        Ok(()) => command_loop(&mut reader, &mut replies, &mut session, &services).await,
        Err(e) => error!("Failed to greet client {}: {}", peer_addr, e),
    }

    session.close().await;
    guard.release();
    if let Err(e) = replies.shutdown().await {
        warn!("Failed to shut down control connection of {}: {}", peer_addr, e);
    }
    info!("Client {} disconnected", peer_addr);
}

async fn command_loop<R>(
    reader: &mut BufReader<R>,
    replies: &mut ReplyWriter,
    session: &mut Session,
    services: &SessionServices,
) where
    R: AsyncRead + Unpin,
{
    let config = services.config.as_ref();
    let peer_addr = session.peer_addr();
    let mut line = Vec::with_capacity(config.max_command_length);

    loop {
        let read = read_command_line(
            reader,
            &mut line,
            config.max_command_length,
            config.control_timeout(),
        )
        .await;
        match read {
            LineRead::TimedOut => {
                info!("Client {} timed out", peer_addr);
                let _ = replies.reply(SERVICE_UNAVAILABLE, "Timeout").await;
                break;
            }
            LineRead::Failed(e) => {
                error!("Failed to read from {}: {}", peer_addr, e);
                break;
            }
            LineRead::Closed => {
                info!("Connection closed by client {}", peer_addr);
                break;
            }
            LineRead::TooLong => {
                warn!(
                    "Client {} sent a command longer than {} bytes",
                    peer_addr, config.max_command_length
                );
                if replies.reply(UNKNOWN_COMMAND, "Command too long").await.is_err() {
                    break;
                }
                continue;
            }
            LineRead::Line => {}
        }

        let text = String::from_utf8_lossy(&line);
        let (mut verb, mut arg) = split_command(&text);
        if verb.is_empty() {
            continue;
        }

        if verb == "SITE" {
            (verb, arg) = split_command(&arg);
            if verb.is_empty() {
                if replies.reply(SYNTAX_ERROR, "SITE parse error").await.is_err() {
                    break;
                }
                continue;
            }
        }

        if let Some(target) = session.alias(&verb) {
            let (alias_verb, alias_arg) = split_command(target);
            arg = match (alias_arg.is_empty(), arg.is_empty()) {
                (true, _) => arg,
                (false, true) => alias_arg,
                (false, false) => format!("{alias_arg} {arg}"),
            };
            verb = alias_verb;
        }

        if verb == "PASS" {
            info!("Received from {}: PASS ****", peer_addr);
        } else {
            info!("Received from {}: {} {}", peer_addr, verb, arg);
        }

        let command = build_command(&verb, arg);
        session.set_last_command(&command.to_string());

        let mut ctx = HandlerContext {
            session: &mut *session,
            replies: &mut *replies,
            config,
            runtime: &services.runtime,
            storage: services.storage.as_ref(),
            auth: services.auth.as_ref(),
            stats: services.registry.stats(),
        };
        let result = handle_command(&mut ctx, command).await;

        if let Some(msg) = &result.message {
            if let Err(e) = replies.send(msg).await {
                error!("Failed to send reply to {}: {}", peer_addr, e);
                break;
            }
        }
        match result.status {
            CommandStatus::CloseConnection => {
                info!("Client {} requested to quit", peer_addr);
                break;
            }
            CommandStatus::Failure(reason) => info!("Command failed for {}: {}", peer_addr, reason),
            CommandStatus::Success => {}
        }
    }
}

/// Outcome of reading one control line.
#[derive(Debug)]
enum LineRead {
    /// A line (terminator included) is in the buffer.
    Line,
    /// The line exceeded the limit and was discarded up to its newline.
    TooLong,
    Closed,
    TimedOut,
    Failed(io::Error),
}

/// Reads one command line into `line`, dropping keep-alive NULs that
/// precede it.
///
/// `idle` bounds each read rather than the whole line, so any byte from
/// the client restarts the clock. At most `max_len` bytes are buffered.
async fn read_command_line<R>(
    reader: &mut BufReader<R>,
    line: &mut Vec<u8>,
    max_len: usize,
    idle: Duration,
) -> LineRead
where
    R: AsyncRead + Unpin,
{
    line.clear();
    let mut too_long = false;

    loop {
        let (used, complete) = {
            let available = match tokio::time::timeout(idle, reader.fill_buf()).await {
                Err(_) => return LineRead::TimedOut,
                Ok(Err(e)) => return LineRead::Failed(e),
                Ok(Ok(available)) => available,
            };
            if available.is_empty() {
                return if line.is_empty() || too_long {
                    LineRead::Closed
                } else {
                    LineRead::Line
                };
            }

            let (chunk, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            if !too_long {
                let start = if line.is_empty() {
                    chunk.iter().position(|&b| b != 0).unwrap_or(chunk.len())
                } else {
                    0
                };
                if line.len() + chunk.len() - start > max_len {
                    too_long = true;
                    line.clear();
                } else {
                    line.extend_from_slice(&chunk[start..]);
                }
            }
            (chunk.len(), complete)
        };
        reader.consume(used);

        if complete {
            return if too_long { LineRead::TooLong } else { LineRead::Line };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const IDLE: Duration = Duration::from_millis(200);

    /// Compiles only while a whole session can be handed to `tokio::spawn`.
    #[allow(dead_code)]
    fn session_future_is_send(
        stream: tokio::io::DuplexStream,
        peer: SocketAddr,
        services: Arc<SessionServices>,
        guard: SessionGuard,
    ) {
        fn assert_send<T: Send>(_: T) {}
        assert_send(handle_session(stream, peer, peer, services, guard));
    }

    #[tokio::test]
    async fn keep_alive_bytes_restart_the_idle_clock() {
        let (mut client, server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                client.write_all(&[0]).await.unwrap();
            }
            client.write_all(b"NOOP\r\n").await.unwrap();
            client
        });

        let mut reader = BufReader::new(server);
        let mut line = Vec::new();
        let read = read_command_line(&mut reader, &mut line, 64, IDLE).await;
        assert!(matches!(read, LineRead::Line));
        assert_eq!(line, b"NOOP\r\n");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(server);
        let mut line = Vec::new();
        let read = read_command_line(&mut reader, &mut line, 64, Duration::from_millis(30)).await;
        assert!(matches!(read, LineRead::TimedOut));
    }

    #[tokio::test]
    async fn long_lines_are_discarded_without_buffering() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        client.write_all(&vec![b'X'; 40_000]).await.unwrap();
        client.write_all(b"\r\nPWD\r\n").await.unwrap();
        drop(client);

        let mut reader = BufReader::with_capacity(512, server);
        let mut line = Vec::new();
        let read = read_command_line(&mut reader, &mut line, 32, IDLE).await;
        assert!(matches!(read, LineRead::TooLong));
        assert!(line.capacity() <= 512);

        let read = read_command_line(&mut reader, &mut line, 32, IDLE).await;
        assert!(matches!(read, LineRead::Line));
        assert_eq!(line, b"PWD\r\n");

        let read = read_command_line(&mut reader, &mut line, 32, IDLE).await;
        assert!(matches!(read, LineRead::Closed));
    }

    #[tokio::test]
    async fn unterminated_last_line_is_still_delivered() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"\0\0QUIT").await.unwrap();
        drop(client);

        let mut reader = BufReader::new(server);
        let mut line = Vec::new();
        assert!(matches!(read_command_line(&mut reader, &mut line, 32, IDLE).await, LineRead::Line));
        assert_eq!(line, b"QUIT");
        assert!(matches!(read_command_line(&mut reader, &mut line, 32, IDLE).await, LineRead::Closed));
    }
}
