//! Data channel negotiation
//!
//! Passive first (EPSV/PASV, optionally preceded by `OPTS PTCP`/`OPTS
//! PSHARED`), falling back to active (EPRT/PORT) when the server rejects
//! passive mode. Rejection is an outcome, not an error; transport failures
//! stop the negotiation.

use std::io;
use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::control::ControlConnection;
use super::reply::ReplyClass;
use crate::config::ClientConfig;
use crate::error::FtpError;
use crate::protocol::address::{ExtendedAddress, HostPort, parse_epsv_reply, parse_pasv_reply};
use crate::transfer::framing::DataSocket;
use crate::transfer::socket_opts;

/// Result of asking the server for a passive data channel.
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// Connected; the transfer command has not been sent yet.
    Negotiated(TcpStream),
    /// The server does not offer passive mode; try active mode.
    Rejected(String),
    /// The control or data connection failed.
    TransportFailure(FtpError),
}

pub struct DataChannelNegotiator<'a> {
    control: &'a mut ControlConnection,
    config: &'a ClientConfig,
    /// Local address of the control socket; data sockets use the same one.
    local_addr: SocketAddr,
    /// Server address of the control socket, the EPSV target.
    server_ip: IpAddr,
}

impl<'a> DataChannelNegotiator<'a> {
    pub fn new(
        control: &'a mut ControlConnection,
        config: &'a ClientConfig,
        local_addr: SocketAddr,
        server_ip: IpAddr,
    ) -> Self {
        let local_addr = match config.listen_address.as_deref().map(str::parse::<IpAddr>) {
            Some(Ok(ip)) => SocketAddr::new(ip, 0),
            Some(Err(_)) => {
                warn!("Ignoring invalid listen address {:?}", config.listen_address);
                SocketAddr::new(local_addr.ip(), 0)
            }
            None => SocketAddr::new(local_addr.ip(), 0),
        };
        Self {
            control,
            config,
            local_addr,
            server_ip,
        }
    }

    /// Opens a data channel and sends `cmd` (`RETR`, `STOR`, `LIST`...)
    /// over the control connection.
    pub async fn open(mut self, cmd: &str, streams: u32) -> Result<DataSocket, FtpError> {
        let stream = match self.passive(streams).await {
            NegotiationOutcome::Negotiated(stream) => {
                self.control.issue_command_check(cmd, true).await?;
                stream
            }
            NegotiationOutcome::Rejected(reason) => {
                info!("Passive mode rejected ({}), using active mode", reason);
                self.active(cmd).await?
            }
            NegotiationOutcome::TransportFailure(e) => return Err(e),
        };

        socket_opts::apply_to_stream(&stream, &self.config.socket);
        let peer = stream.peer_addr()?;
        Ok(DataSocket::new(stream, self.config.data_alive)
            .with_timeout(Some(self.config.data_timeout()))
            .with_peer(peer))
    }

    /// Requests a passive channel and connects to it.
    pub async fn passive(&mut self, streams: u32) -> NegotiationOutcome {
        if !self.config.passive {
            return NegotiationOutcome::Rejected("passive mode disabled".into());
        }
        if streams > 1 {
            if let Err(e) = self.control.diss_command_check(&format!("OPTS PTCP {streams}")).await {
                return outcome_of(e);
            }
        }
        // Combined with PTCP this is left to the server, which may refuse.
        if self.config.shared_passive {
            if let Err(e) = self.control.diss_command_check("OPTS PSHARED").await {
                return outcome_of(e);
            }
        }

        let passive_cmd = if self.config.extended { "EPSV" } else { "PASV" };
        match self.control.issue_command(passive_cmd).await {
            Ok(ReplyClass::Error) => {
                return NegotiationOutcome::Rejected(format!("{passive_cmd} refused"));
            }
            Ok(_) => {}
            Err(e) => return outcome_of(e),
        }

        let Some(reply) = self.control.last_reply() else {
            return NegotiationOutcome::Rejected(passive_cmd.to_string());
        };
        let text = reply.text();
        let target = if self.config.extended {
            parse_epsv_reply(&text).map(|port| SocketAddr::new(self.server_ip, port))
        } else {
            parse_pasv_reply(&text).map(|address| address.socket_addr())
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                warn!("Invalid {} reply {:?}: {}", passive_cmd, text, e);
                return NegotiationOutcome::Rejected(format!("{passive_cmd}: {e}"));
            }
        };

        match self.connect(target).await {
            Ok(stream) => {
                debug!("Use normal data socket (passive) to {}", target);
                NegotiationOutcome::Negotiated(stream)
            }
            Err(e) => NegotiationOutcome::TransportFailure(e.into()),
        }
    }

    async fn connect(&self, target: SocketAddr) -> io::Result<TcpStream> {
        let socket = new_socket(target)?;
        socket_opts::apply_to_socket(&socket, &self.config.socket);
        if self.local_addr.is_ipv4() == target.is_ipv4() {
            socket.bind(self.local_addr)?;
        }
        match tokio::time::timeout(self.config.data_timeout(), socket.connect(target)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {target} timed out"),
            )),
        }
    }

    /// Listens locally, announces the address with PORT/EPRT, sends `cmd`
    /// and waits for the server to connect.
    pub async fn active(&mut self, cmd: &str) -> Result<TcpStream, FtpError> {
        let listener = self.listen()?;
        let local = listener.local_addr()?;
        let port_cmd = port_command(local, self.config.extended)?;

        self.control.issue_command_check(&port_cmd, true).await?;
        self.control.issue_command_check(cmd, true).await?;

        match tokio::time::timeout(self.config.port_timeout(), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("Use ServerSocket data socket (port), peer {}", peer);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no data connection on {local}"),
            )
            .into()),
        }
    }

    /// Backlog of one; privileged ports 1023 down to 512 first when
    /// `low_port` is set.
    fn listen(&self) -> io::Result<TcpListener> {
        if self.config.low_port {
            for port in (512..=1023).rev() {
                let addr = SocketAddr::new(self.local_addr.ip(), port);
                match self.listen_on(addr) {
                    Ok(listener) => return Ok(listener),
                    Err(e) => debug!("Cannot listen on {}: {}", addr, e),
                }
            }
            warn!("No privileged port available, using an ephemeral one");
        }
        self.listen_on(self.local_addr)
    }

    fn listen_on(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = new_socket(addr)?;
        socket_opts::apply_to_socket(&socket, &self.config.socket);
        socket.bind(addr)?;
        socket.listen(1)
    }
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

fn outcome_of(error: FtpError) -> NegotiationOutcome {
    match error {
        FtpError::Protocol(reason) => NegotiationOutcome::Rejected(reason),
        other => NegotiationOutcome::TransportFailure(other),
    }
}

/// `EPRT |1|ip|port|` / `|2|...`, or `PORT h1,h2,h3,h4,p1,p2` which only
/// exists for IPv4.
pub fn port_command(local: SocketAddr, extended: bool) -> Result<String, FtpError> {
    if extended {
        return Ok(format!("EPRT {}", ExtendedAddress(local)));
    }
    match local {
        SocketAddr::V4(v4) => Ok(format!("PORT {}", HostPort::new(*v4.ip(), v4.port()))),
        SocketAddr::V6(_) => Err(FtpError::Protocol(
            "PORT command not supported with IPv6".into(),
        )),
    }
}
