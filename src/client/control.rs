//! Control connection
//!
//! Command/reply engine of the client. Commands are never pipelined: a
//! `1xx` reply leaves the connection "pending" and the final reply is
//! drained before anything else is written.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use super::reply::{ClassifyContext, Reply, ReplyClass, classify, read_reply};
use crate::error::FtpError;
use crate::keepalive::KeepAliveTarget;
use crate::transfer::framing::DataStream;

type ControlReader = BufReader<ReadHalf<Box<dyn DataStream>>>;
type ControlWriter = Arc<Mutex<WriteHalf<Box<dyn DataStream>>>>;

/// Hides the password of a `PASS` command.
fn redact(cmd: &str) -> &str {
    if cmd.starts_with("PASS ") {
        "PASS ********"
    } else {
        cmd
    }
}

pub struct ControlConnection {
    reader: ControlReader,
    writer: ControlWriter,
    open: Arc<AtomicBool>,
    timeout: Duration,
    retry_codes: Vec<u16>,
    max_retries: u32,
    logged_in: bool,
    pending: bool,
    last_command: String,
    last_reply: Option<Reply>,
    responses: Vec<String>,
}

impl ControlConnection {
    /// Wraps a connected stream and reads the greeting.
    pub async fn open<S>(
        stream: S,
        timeout: Duration,
        retry_codes: Vec<u16>,
        max_retries: u32,
    ) -> Result<Self, FtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let stream: Box<dyn DataStream> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let mut connection = Self {
            reader: BufReader::new(read_half),
            writer: Arc::new(Mutex::new(write_half)),
            open: Arc::new(AtomicBool::new(true)),
            timeout,
            retry_codes,
            max_retries,
            logged_in: false,
            pending: false,
            last_command: String::new(),
            last_reply: None,
            responses: Vec::new(),
        };

        if connection.read_reply().await? == ReplyClass::Error {
            let code = connection.last_code().unwrap_or(0);
            let message = connection.response_string_no_reset();
            connection.mark_closed();
            return Err(FtpError::Protocol(if message.is_empty() {
                format!("Connection refused (FTP code: {code})")
            } else {
                message
            }));
        }
        Ok(connection)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    pub fn set_logged_in(&mut self, logged_in: bool) {
        self.logged_in = logged_in;
    }

    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    pub fn last_code(&self) -> Option<u16> {
        self.last_reply.as_ref().map(|reply| reply.code)
    }

    pub fn last_reply(&self) -> Option<&Reply> {
        self.last_reply.as_ref()
    }

    /// Handle the keep-alive service writes through.
    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            writer: Arc::clone(&self.writer),
            open: Arc::clone(&self.open),
        }
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    async fn send_line(&mut self, cmd: &str) -> Result<(), FtpError> {
        debug!("> {}", redact(cmd));
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(cmd.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            drop(writer);
            self.mark_closed();
            warn!("Writing {} failed: {}", redact(cmd), e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Reads and classifies the next reply. A transport failure marks the
    /// connection closed.
    async fn read_reply(&mut self) -> Result<ReplyClass, FtpError> {
        let reply = match tokio::time::timeout(self.timeout, read_reply(&mut self.reader)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                self.mark_closed();
                warn!("Reading server response failed: {}", e);
                return Err(e.into());
            }
            Err(_) => {
                self.mark_closed();
                warn!("Timed out reading server response");
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Timed out reading server response",
                )
                .into());
            }
        };

        debug!("Server response: {}", reply.code);
        self.responses.extend(reply.lines.iter().cloned());
        if reply.is_preliminary() {
            self.pending = true;
        }
        let ctx = ClassifyContext {
            logged_in: self.logged_in,
            last_command: &self.last_command,
            retry_codes: &self.retry_codes,
        };
        let class = classify(&reply, &ctx);
        self.last_reply = Some(reply);
        class
    }

    /// Sends `cmd` and returns the classification of its reply.
    ///
    /// An outstanding reply is drained first; failures while draining are
    /// logged and dropped. Replies classified as "try again" make the same
    /// command go out again, up to the configured limit.
    pub async fn issue_command(&mut self, cmd: &str) -> Result<ReplyClass, FtpError> {
        if !self.is_open() {
            return Err(FtpError::Login(format!(
                "Not connected to host for '{}'",
                redact(cmd)
            )));
        }

        if self.pending {
            debug!("Reply pending");
            match self.read_reply().await {
                Ok(ReplyClass::Error) => debug!("Error reading pending reply"),
                Ok(_) => debug!("Reply code: {:?}", self.last_code()),
                Err(e) if !self.is_open() => return Err(e),
                Err(e) => debug!("Pending reply failed: {}", e),
            }
        }
        self.pending = false;
        self.last_command = cmd.to_string();
        self.responses.clear();

        let mut retries = 0;
        loop {
            self.send_line(cmd).await?;
            match self.read_reply().await? {
                ReplyClass::TryAgain if retries < self.max_retries => {
                    retries += 1;
                    debug!("Server asked to try {} again ({})", redact(cmd), retries);
                }
                ReplyClass::TryAgain => return Ok(ReplyClass::Error),
                class => return Ok(class),
            }
        }
    }

    /// Issues `cmd` and fails unless the reply is a success, or, with
    /// `is_error`, unless it is not an error.
    pub async fn issue_command_check(&mut self, cmd: &str, is_error: bool) -> Result<(), FtpError> {
        let class = self.issue_command(cmd).await?;
        let failed = if is_error {
            class == ReplyClass::Error
        } else {
            class != ReplyClass::Success
        };
        if failed {
            return Err(FtpError::Protocol(format!(
                "{} failed ({})",
                redact(cmd),
                self.last_code().unwrap_or(0)
            )));
        }
        Ok(())
    }

    /// Issues a vendor extension command and returns the reply text.
    pub async fn diss_command_check(&mut self, cmd: &str) -> Result<String, FtpError> {
        if self.issue_command(cmd).await? == ReplyClass::Error {
            return Err(FtpError::Protocol(format!("Not a DissFTP server? ({cmd})")));
        }
        Ok(self.response_string())
    }

    /// Reads the final reply of a transfer, if one is outstanding.
    pub async fn check_pending_reply(&mut self) -> Result<Option<u16>, FtpError> {
        if !self.pending {
            return Ok(None);
        }
        debug!("Reply pending");
        let result = self.read_reply().await;
        self.pending = false;
        match result? {
            ReplyClass::Error => {
                let message = self.response_string_no_reset();
                Err(FtpError::Protocol(if message.is_empty() {
                    format!("No reply from server (FTP code: {})", self.last_code().unwrap_or(0))
                } else {
                    message
                }))
            }
            _ => Ok(self.last_code()),
        }
    }

    /// Replies collected since the last call. If one of them is a failure
    /// (code 400 or above) only that line is returned.
    pub fn response_string(&mut self) -> String {
        let mut out = String::new();
        for line in self.responses.drain(..) {
            let line = line.replace(['\r', '\n'], " ").trim().to_string();
            let failed = line.len() > 3
                && line
                    .get(..3)
                    .and_then(|code| code.parse::<u16>().ok())
                    .is_some_and(|code| code >= 400);
            if failed {
                out = line;
                break;
            }
            out.push_str(&line);
        }
        self.responses.clear();
        out
    }

    /// Replies collected since the last reset, space separated.
    pub fn response_string_no_reset(&self) -> String {
        self.responses.join(" ").trim().to_string()
    }

    /// Stops the engine. The write half is shut down; later commands fail.
    pub async fn shutdown(&mut self) {
        self.mark_closed();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Control shutdown: {}", e);
        }
    }
}

/// Shared view of a control connection's writer for the keep-alive loop.
#[derive(Clone)]
pub struct ControlHandle {
    writer: ControlWriter,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl KeepAliveTarget for ControlHandle {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_keepalive(&self) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(b"\0").await?;
        writer.flush().await
    }
}
