//! Control connection writer
//!
//! Server side of the reply stream. Handlers write intermediate replies
//! (`150`) through it while a transfer is in progress; the session loop
//! writes the final one.

use std::io;
use std::net::SocketAddr;

use log::debug;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::protocol::responses::format_reply;

pub struct ReplyWriter {
    inner: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
    peer: SocketAddr,
}

impl ReplyWriter {
    pub fn new<W: AsyncWrite + Send + Unpin + 'static>(writer: W, peer: SocketAddr) -> Self {
        Self {
            inner: BufWriter::new(Box::new(writer)),
            peer,
        }
    }

    /// Writes an already formatted reply and flushes it.
    pub async fn send(&mut self, reply: &str) -> io::Result<()> {
        debug!("Sending response to client {}: {}", self.peer, reply.trim_end());
        self.inner.write_all(reply.as_bytes()).await?;
        self.inner.flush().await
    }

    pub async fn reply(&mut self, code: u16, text: &str) -> io::Result<()> {
        self.send(&format_reply(code, text)).await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
