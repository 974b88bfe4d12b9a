//! FTP client
//!
//! [`FtpClient`] drives one control connection through
//! [`control::ControlConnection`] and opens data channels with
//! [`negotiator::DataChannelNegotiator`]. With data-alive the data socket
//! stays open between transfers and every transfer is framed.

pub mod control;
pub mod negotiator;
pub mod reply;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::error::{FramingError, FtpError};
use crate::keepalive::KeepAliveService;
use crate::transfer::framing::{ChannelReader, ChannelWriter, DataSocket, PACKET_MODE};
use crate::transfer::socket_opts;

use self::control::ControlConnection;
use self::negotiator::DataChannelNegotiator;
use self::reply::ReplyClass;

pub use self::negotiator::NegotiationOutcome;
pub use self::reply::Reply;

const COPY_BUFFER: usize = 64 * 1024;

pub struct FtpClient {
    control: ControlConnection,
    config: ClientConfig,
    data_socket: Option<DataSocket>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    host: Option<(String, u16)>,
    user: Option<String>,
    password: Option<String>,
    output_filters: bool,
    closed: AtomicBool,
    keepalive_id: Option<u64>,
}

impl FtpClient {
    /// Connects to `host:port` and reads the greeting.
    pub async fn connect(host: &str, port: u16, config: ClientConfig) -> Result<Self, FtpError> {
        let stream = Self::dial(host, port, &config).await?;
        let mut client = Self::from_tcp(stream, config).await?;
        client.host = Some((host.to_string(), port));
        Ok(client)
    }

    async fn dial(host: &str, port: u16, config: &ClientConfig) -> Result<TcpStream, FtpError> {
        let target = format!("{host}:{port}");
        let stream = match tokio::time::timeout(config.comm_timeout(), TcpStream::connect(&target)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {target} timed out"),
                )
                .into());
            }
        };
        socket_opts::apply_to_stream(&stream, &config.socket);
        Ok(stream)
    }

    async fn from_tcp(stream: TcpStream, config: ClientConfig) -> Result<Self, FtpError> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        Self::from_stream(stream, local_addr, peer_addr, config).await
    }

    /// Runs the client over an already connected control stream.
    /// `local_addr` and `peer_addr` are the addresses data sockets bind to
    /// and connect to.
    pub async fn from_stream<S>(
        stream: S,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: ClientConfig,
    ) -> Result<Self, FtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let control = ControlConnection::open(
            stream,
            config.comm_timeout(),
            config.retry_codes.clone(),
            config.max_retries,
        )
        .await?;
        info!("Connected to {}", peer_addr);

        Ok(Self {
            control,
            config,
            data_socket: None,
            local_addr,
            peer_addr,
            host: None,
            user: None,
            password: None,
            output_filters: false,
            closed: AtomicBool::new(false),
            keepalive_id: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_logged_in(&self) -> bool {
        self.control.is_logged_in()
    }

    pub fn is_connected(&self) -> bool {
        self.control.is_open() && !self.closed.load(Ordering::Acquire)
    }

    /// Code of the most recent reply.
    pub fn last_code(&self) -> Option<u16> {
        self.control.last_code()
    }

    /// Logs in, then switches on the configured extensions.
    pub async fn login(&mut self, user: &str, password: Option<&str>) -> Result<(), FtpError> {
        if self.control.issue_command(&format!("USER {user}")).await? == ReplyClass::Error {
            return Err(FtpError::Login("Invalid user name".into()));
        }
        if self.control.last_code() != Some(230) {
            let password = password.unwrap_or_default();
            if self.control.issue_command(&format!("PASS {password}")).await? == ReplyClass::Error {
                return Err(FtpError::Login("Login failed".into()));
            }
        }

        self.user = Some(user.to_string());
        self.password = password.map(str::to_string);

        if self.config.data_alive {
            self.control.diss_command_check("OPTS DATAALIVE").await?;
        }
        if self.config.mkdirs {
            self.control.diss_command_check("OPTS MKDIRS").await?;
        }
        self.control.set_logged_in(true);
        info!("Logged in as {}", user);
        Ok(())
    }

    /// Reconnects and logs in again with the last successful credentials.
    pub async fn retry_login(&mut self) -> Result<(), FtpError> {
        let Some(user) = self.user.clone() else {
            return Err(FtpError::Login("Did not login successfully before".into()));
        };
        let Some((host, port)) = self.host.clone() else {
            return Err(FtpError::Login(format!("Not connected to host for 'USER {user}'")));
        };
        let password = self.password.clone();

        self.close(false).await;
        let stream = Self::dial(&host, port, &self.config).await?;
        self.local_addr = stream.local_addr()?;
        self.peer_addr = stream.peer_addr()?;
        self.control = ControlConnection::open(
            stream,
            self.config.comm_timeout(),
            self.config.retry_codes.clone(),
            self.config.max_retries,
        )
        .await?;
        self.closed.store(false, Ordering::Release);
        self.login(&user, password.as_deref()).await
    }

    async fn close_data_socket(&mut self) {
        if let Some(mut socket) = self.data_socket.take() {
            socket.close().await;
        }
    }

    /// Drops the data socket after a failed transfer; the next transfer
    /// negotiates a fresh channel.
    async fn abandon_transfer(&mut self, error: &FtpError) {
        if self.data_socket.is_some() {
            warn!("Closing data socket after failed transfer: {}", error);
        }
        self.close_data_socket().await;
    }

    /// Makes sure a data socket exists and `cmd` has been sent over the
    /// control connection.
    async fn data_socket_for(&mut self, cmd: &str) -> Result<(), FtpError> {
        let reusable = self.config.data_alive
            && self.data_socket.as_ref().is_some_and(DataSocket::is_open);
        if reusable {
            debug!("Reusing data-alive socket for {}", cmd);
            self.control.issue_command_check(cmd, true).await?;
        } else {
            self.close_data_socket().await;
            let socket = DataChannelNegotiator::new(
                &mut self.control,
                &self.config,
                self.local_addr,
                self.peer_addr.ip(),
            )
            .open(cmd, self.config.streams)
            .await?;
            self.data_socket = Some(socket);
        }
        Ok(())
    }

    async fn send_transfer_command(&mut self, offset: u64, cmd: &str) -> Result<(), FtpError> {
        if offset > 0 {
            self.control.issue_command_check(&format!("REST {offset}"), true).await?;
        }
        self.data_socket_for(cmd).await
    }

    /// Sends the optional `REST` and `cmd`. Any failure drops the data
    /// socket.
    async fn begin_transfer(&mut self, offset: u64, cmd: &str) -> Result<(), FtpError> {
        let result = self.send_transfer_command(offset, cmd).await;
        if let Err(e) = &result {
            self.abandon_transfer(e).await;
        }
        result
    }

    fn current_data_socket(&mut self) -> Result<&mut DataSocket, FtpError> {
        self.data_socket
            .as_mut()
            .ok_or(FtpError::Framing(FramingError::Closed("DataSocket")))
    }

    /// Starts a download of `path` from `offset`. Call
    /// [`complete_transfer`](Self::complete_transfer) once the reader is
    /// done.
    ///
    /// A data-alive socket whose frame header cannot be read is closed and
    /// is not reused.
    pub async fn get(&mut self, path: &str, offset: u64) -> Result<ChannelReader<'_>, FtpError> {
        self.begin_transfer(offset, &format!("RETR {path}")).await?;
        Ok(self.current_data_socket()?.reader().await?)
    }

    /// Starts an upload of `path`. `size` is announced when the channel is
    /// framed; it is replaced by packet mode when packet framing is forced
    /// or output filters are active.
    pub async fn put(
        &mut self,
        path: &str,
        offset: u64,
        size: i64,
        append: bool,
    ) -> Result<ChannelWriter<'_>, FtpError> {
        let size = if self.config.packet || self.output_filters {
            PACKET_MODE
        } else {
            size
        };
        let verb = if append { "APPE" } else { "STOR" };
        self.begin_transfer(offset, &format!("{verb} {path}")).await?;
        Ok(self.current_data_socket()?.writer(size).await?)
    }

    /// Finishes a transfer: drops a one-shot data socket and reads the
    /// final reply. A failure reply drops a data-alive socket too.
    pub async fn complete_transfer(&mut self) -> Result<Option<u16>, FtpError> {
        if !self.config.data_alive {
            self.close_data_socket().await;
        }
        let result = self.control.check_pending_reply().await;
        if let Err(e) = &result {
            self.abandon_transfer(e).await;
        }
        result
    }

    /// Downloads `path` into `sink`, returning the byte count.
    pub async fn retrieve<W>(&mut self, path: &str, offset: u64, sink: &mut W) -> Result<u64, FtpError>
    where
        W: AsyncWrite + Unpin,
    {
        let copied = match self.download(path, offset, sink).await {
            Ok(copied) => copied,
            Err(e) => {
                self.abandon_transfer(&e).await;
                return Err(e);
            }
        };
        self.complete_transfer().await?;
        debug!("Retrieved {} bytes of {}", copied, path);
        Ok(copied)
    }

    async fn download<W>(&mut self, path: &str, offset: u64, sink: &mut W) -> Result<u64, FtpError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reader = self.get(path, offset).await?;
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n]).await?;
            copied += n as u64;
        }
        reader.close().await?;
        sink.flush().await?;
        Ok(copied)
    }

    /// Uploads everything `source` yields to `path`.
    pub async fn store<R>(
        &mut self,
        path: &str,
        source: &mut R,
        size: Option<u64>,
        append: bool,
    ) -> Result<u64, FtpError>
    where
        R: AsyncRead + Unpin,
    {
        let announced = size
            .and_then(|size| i64::try_from(size).ok())
            .unwrap_or(PACKET_MODE);
        let copied = match self.upload(path, source, announced, append).await {
            Ok(copied) => copied,
            Err(e) => {
                self.abandon_transfer(&e).await;
                return Err(e);
            }
        };
        self.complete_transfer().await?;
        debug!("Stored {} bytes to {}", copied, path);
        Ok(copied)
    }

    async fn upload<R>(
        &mut self,
        path: &str,
        source: &mut R,
        announced: i64,
        append: bool,
    ) -> Result<u64, FtpError>
    where
        R: AsyncRead + Unpin,
    {
        let mut writer = self.put(path, 0, announced, append).await?;
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut copied = 0u64;
        loop {
            let n = source.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            copied += n as u64;
        }
        writer.close().await?;
        Ok(copied)
    }

    /// `LIST`: long listing lines.
    pub async fn list(&mut self, path: Option<&str>) -> Result<Vec<String>, FtpError> {
        self.listing("LIST", path).await
    }

    /// `NLST`: names only.
    pub async fn nlist(&mut self, path: Option<&str>) -> Result<Vec<String>, FtpError> {
        self.listing("NLST", path).await
    }

    async fn listing(&mut self, verb: &str, path: Option<&str>) -> Result<Vec<String>, FtpError> {
        let cmd = match path {
            Some(path) => format!("{verb} {path}"),
            None => verb.to_string(),
        };
        let raw = match self.read_listing(&cmd).await {
            Ok(raw) => raw,
            Err(e) => {
                self.abandon_transfer(&e).await;
                return Err(e);
            }
        };
        self.complete_transfer().await?;

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn read_listing(&mut self, cmd: &str) -> Result<Vec<u8>, FtpError> {
        self.begin_transfer(0, cmd).await?;
        let mut raw = Vec::new();
        let mut reader = self.current_data_socket()?.reader().await?;
        reader.read_to_end(&mut raw).await?;
        reader.close().await?;
        Ok(raw)
    }

    async fn simple(&mut self, cmd: &str) -> Result<(), FtpError> {
        self.control.issue_command_check(cmd, false).await
    }

    /// Message of the last reply without its code.
    fn reply_message(&self) -> String {
        self.control
            .last_reply()
            .map(Reply::message)
            .unwrap_or_default()
    }

    pub async fn cd(&mut self, path: &str) -> Result<(), FtpError> {
        self.simple(&format!("CWD {path}")).await
    }

    pub async fn cdup(&mut self) -> Result<(), FtpError> {
        self.simple("CDUP").await
    }

    /// Current directory, taken from the quoted part of the 257 reply.
    pub async fn pwd(&mut self) -> Result<String, FtpError> {
        self.simple("PWD").await?;
        let message = self.reply_message();
        let mut parts = message.splitn(3, '"');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(path), Some(_)) => Ok(path.to_string()),
            _ => Err(FtpError::Protocol(format!("Malformed PWD reply: {message}"))),
        }
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<(), FtpError> {
        self.simple(&format!("MKD {path}")).await
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<(), FtpError> {
        self.simple(&format!("RMD {path}")).await
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), FtpError> {
        self.simple(&format!("DELE {path}")).await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), FtpError> {
        self.simple(&format!("RNFR {from}")).await?;
        self.simple(&format!("RNTO {to}")).await
    }

    pub async fn size(&mut self, path: &str) -> Result<u64, FtpError> {
        self.simple(&format!("SIZE {path}")).await?;
        let message = self.reply_message();
        message
            .trim()
            .parse()
            .map_err(|_| FtpError::Protocol(format!("Malformed SIZE reply: {message}")))
    }

    /// Modification time as `YYYYMMDDHHMMSS`.
    pub async fn mdtm(&mut self, path: &str) -> Result<String, FtpError> {
        self.simple(&format!("MDTM {path}")).await?;
        Ok(self.reply_message())
    }

    pub async fn binary(&mut self) -> Result<(), FtpError> {
        self.simple("TYPE I").await
    }

    pub async fn ascii(&mut self) -> Result<(), FtpError> {
        self.simple("TYPE A").await
    }

    pub async fn site(&mut self, args: &str) -> Result<String, FtpError> {
        self.simple(&format!("SITE {args}")).await?;
        Ok(self.control.response_string())
    }

    pub async fn syst(&mut self) -> Result<String, FtpError> {
        self.simple("SYST").await?;
        Ok(self.reply_message())
    }

    /// Sends the configured no-op verb.
    pub async fn noop(&mut self) -> Result<(), FtpError> {
        let cmd = self.config.noop_command.clone();
        self.simple(&cmd).await
    }

    pub async fn is_alive(&mut self) -> bool {
        match self.noop().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Connection is not alive: {}", e);
                false
            }
        }
    }

    /// Drops the data channel and sends `ABOR`.
    pub async fn abort(&mut self) -> Result<(), FtpError> {
        self.close_data_socket().await;
        if self.control.issue_command("ABOR").await? == ReplyClass::Error {
            warn!("ABOR refused ({:?})", self.control.last_code());
        }
        Ok(())
    }

    /// Creates or truncates `path` on the server.
    pub async fn empty(&mut self, path: &str) -> Result<(), FtpError> {
        self.control.diss_command_check(&format!("OPTS EMPTY {path}")).await?;
        Ok(())
    }

    /// Filters the server applies to what it receives. Uploads are sent in
    /// packet mode while any are active.
    pub async fn set_input_filters(&mut self, filters: &str) -> Result<(), FtpError> {
        self.control.diss_command_check(&format!("OPTS RCOMP {filters}")).await?;
        self.output_filters = !is_no_filter(filters);
        Ok(())
    }

    /// Filters the server applies to what it sends.
    pub async fn set_output_filters(&mut self, filters: &str) -> Result<(), FtpError> {
        self.control.diss_command_check(&format!("OPTS SCOMP {filters}")).await?;
        Ok(())
    }

    /// Lets the server digest the following transfers.
    pub async fn delegate_checksum(&mut self) -> Result<(), FtpError> {
        self.control.diss_command_check("OPTS MD5SUM").await?;
        Ok(())
    }

    /// Records the checksum of `file` on the server and returns it. With
    /// `checksum` the server is told the value first.
    pub async fn dump_checksum(&mut self, checksum: Option<&str>, file: &str) -> Result<String, FtpError> {
        if let Some(checksum) = checksum {
            self.control.diss_command_check(&format!("OPTS MD5SET {checksum}")).await?;
        }
        self.control.diss_command_check(&format!("OPTS MD5DUMP {file}")).await?;
        let message = self.reply_message();
        message
            .split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| FtpError::Protocol(format!("Malformed MD5DUMP reply for {file}")))
    }

    pub async fn check_pending_reply(&mut self) -> Result<Option<u16>, FtpError> {
        self.control.check_pending_reply().await
    }

    pub fn response_string(&mut self) -> String {
        self.control.response_string()
    }

    /// Adds the control connection to, or removes it from, the keep-alive
    /// rounds of `service`.
    pub fn keep_control_connection_alive(&mut self, service: &KeepAliveService, keep: bool) {
        match (keep, self.keepalive_id) {
            (true, None) => {
                self.keepalive_id = Some(service.register(Arc::new(self.control.handle())));
            }
            (false, Some(id)) => {
                service.unregister(id);
                self.keepalive_id = None;
            }
            _ => {}
        }
    }

    /// Closes the session. `gracefully` sends `QUIT` first when logged in.
    /// Closing twice does nothing.
    pub async fn close(&mut self, gracefully: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_data_socket().await;
        if gracefully && self.control.is_logged_in() && self.control.is_open() {
            if let Err(e) = self.control.issue_command("QUIT").await {
                debug!("QUIT failed: {}", e);
            }
        }
        self.control.set_logged_in(false);
        self.control.shutdown().await;
        info!("Disconnected from {}", self.peer_addr);
    }
}

fn is_no_filter(filters: &str) -> bool {
    let filters = filters.trim();
    filters.is_empty() || filters.eq_ignore_ascii_case("none")
}
