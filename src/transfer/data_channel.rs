//! Module `data_channel`
//!
//! Server-side data channel descriptor. A `PASV`/`EPSV` leaves a bound
//! listener that is only accepted when the first transfer starts; a
//! `PORT`/`EPRT` leaves the peer address the server connects out to.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::{info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::{SocketOptions, StartupConfig};
use crate::error::TransferError;
use crate::transfer::modes::TransferMode;
use crate::transfer::socket_opts;

/// Pending data connection of a session.
#[derive(Debug)]
pub enum DataChannel {
    Passive {
        listener: TcpListener,
        mode: TransferMode,
    },
    Active {
        target: SocketAddr,
        mode: TransferMode,
    },
}

/// What the descriptor needs to know about its session to connect.
pub struct ConnectContext<'a> {
    /// Peer IP allowed to connect to a passive listener.
    pub owner: IpAddr,
    /// Local address of the control connection.
    pub control_addr: SocketAddr,
    pub config: &'a StartupConfig,
}

impl DataChannel {
    pub fn mode(&self) -> TransferMode {
        match self {
            DataChannel::Passive { mode, .. } | DataChannel::Active { mode, .. } => *mode,
        }
    }

    /// Turns the descriptor into a connected stream.
    pub async fn connect(self, ctx: &ConnectContext<'_>) -> Result<(TcpStream, SocketAddr), TransferError> {
        match self {
            DataChannel::Passive { listener, .. } => {
                accept_passive(&listener, ctx.owner, ctx.config.port_timeout()).await
            }
            DataChannel::Active { target, .. } => {
                let stream = connect_active(target, ctx.control_addr, ctx.config).await?;
                Ok((stream, target))
            }
        }
    }
}

/// Binds a passive listener with a backlog of one, trying the configured
/// port range in order or an ephemeral port.
pub fn bind_passive(ip: IpAddr, config: &StartupConfig) -> Result<TcpListener, TransferError> {
    match config.data_port_range() {
        None => listen_once(SocketAddr::new(ip, 0), &config.socket),
        Some(range) => {
            for port in range {
                let addr = SocketAddr::new(ip, port);
                match listen_once(addr, &config.socket) {
                    Ok(listener) => return Ok(listener),
                    Err(TransferError::PortBindingFailed(_, e))
                        if e.kind() == io::ErrorKind::AddrInUse => {}
                    Err(other) => return Err(other),
                }
            }
            Err(TransferError::NoAvailablePort)
        }
    }
}

fn listen_once(addr: SocketAddr, options: &SocketOptions) -> Result<TcpListener, TransferError> {
    let socket = new_socket(addr).map_err(|e| TransferError::PortBindingFailed(addr, e))?;
    socket_opts::apply_to_socket(&socket, options);
    socket
        .bind(addr)
        .map_err(|e| TransferError::PortBindingFailed(addr, e))?;
    socket
        .listen(1)
        .map_err(|e| TransferError::PortBindingFailed(addr, e))
}

fn new_socket(addr: SocketAddr) -> io::Result<TcpSocket> {
    if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
}

async fn accept_passive(
    listener: &TcpListener,
    owner: IpAddr,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), TransferError> {
    let local = listener.local_addr()?;
    match tokio::time::timeout(timeout, listener.accept()).await {
        Err(_) => Err(TransferError::ConnectionTimeout(format!(
            "passive data connection on {}",
            local
        ))),
        Ok(Err(e)) => Err(TransferError::TransferFailed(e)),
        Ok(Ok((stream, peer))) => {
            if peer.ip() != owner {
                warn!(
                    "Rejected data connection from {} on {} (expected {})",
                    peer, local, owner
                );
                return Err(TransferError::ForeignPeer(peer));
            }
            info!("Passive data connection accepted from {} on {}", peer, local);
            Ok((stream, peer))
        }
    }
}

/// Connects to `target`, binding the local end to the control port minus
/// one when configured. Bind conflicts are retried with a one second pause
/// before falling back to an ephemeral port.
pub async fn connect_active(
    target: SocketAddr,
    control_addr: SocketAddr,
    config: &StartupConfig,
) -> Result<TcpStream, TransferError> {
    let timeout = config.port_timeout();
    let same_family = control_addr.is_ipv4() == target.is_ipv4();

    if config.active_port_binding && same_family && control_addr.port() > 1 {
        let local = SocketAddr::new(control_addr.ip(), control_addr.port() - 1);
        for attempt in 1..=config.active_bind_retries {
            match try_connect(Some(local), target, &config.socket, timeout).await {
                Ok(stream) => {
                    info!("Active data connection {} -> {}", local, target);
                    return Ok(stream);
                }
                Err(e) if is_bind_conflict(&e) => {
                    warn!(
                        "Cannot bind {} for active connection (attempt {}/{}): {}",
                        local, attempt, config.active_bind_retries, e
                    );
                    if attempt < config.active_bind_retries {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(e) => return Err(connect_error(target, e)),
            }
        }
        warn!("Falling back to an ephemeral port for {}", target);
    }

    let stream = try_connect(None, target, &config.socket, timeout)
        .await
        .map_err(|e| connect_error(target, e))?;
    info!("Active data connection to {}", target);
    Ok(stream)
}

fn is_bind_conflict(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable | io::ErrorKind::PermissionDenied
    )
}

fn connect_error(target: SocketAddr, e: io::Error) -> TransferError {
    if e.kind() == io::ErrorKind::TimedOut {
        TransferError::ConnectionTimeout(format!("active data connection to {}", target))
    } else {
        TransferError::TransferFailed(e)
    }
}

async fn try_connect(
    local: Option<SocketAddr>,
    target: SocketAddr,
    options: &SocketOptions,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = new_socket(target)?;
    socket.set_reuseaddr(true)?;
    socket_opts::apply_to_socket(&socket, options);
    if let Some(local) = local {
        socket.bind(local)?;
    }
    match tokio::time::timeout(timeout, socket.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out", target),
        )),
    }
}
