//! Transfer operations
//!
//! Handles data channel setup for passive and active modes and hands out
//! the connected [`DataSocket`] when a transfer starts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, info};

use crate::config::StartupConfig;
use crate::error::TransferError;
use crate::protocol::address::{HostPort, format_epsv_reply, format_pasv_reply};
use crate::session::Session;
use crate::transfer::data_channel::{ConnectContext, DataChannel, bind_passive};
use crate::transfer::framing::DataSocket;
use crate::transfer::modes::TransferMode;
use crate::transfer::socket_opts;

/// Sets up passive mode and returns the text of the `227`/`229` reply.
///
/// Any previous data channel of the session is closed first; clients are
/// free to issue PASV repeatedly.
pub async fn setup_passive_mode(
    session: &mut Session,
    config: &StartupConfig,
    extended: bool,
) -> Result<String, TransferError> {
    if session.data_channel().is_some() || session.has_open_data_socket() {
        info!(
            "Replacing existing data channel for client {} with new passive listener",
            session.peer_addr()
        );
        session.release_data_channel(true).await;
    }

    let local_ip = session.local_addr().ip();
    let listener = bind_passive(local_ip, config)?;
    let port = listener.local_addr()?.port();

    let reply = if extended {
        format_epsv_reply(port)
    } else {
        let advertised = advertised_ipv4(local_ip, config)?;
        format_pasv_reply(HostPort::new(advertised, port))
    };

    let mode = if extended {
        TransferMode::ExtendedPassive
    } else {
        TransferMode::Passive
    };
    session.set_data_channel(Some(DataChannel::Passive { listener, mode }));

    info!(
        "Client {} bound to passive data port {}",
        session.peer_addr(),
        port
    );
    Ok(reply)
}

fn advertised_ipv4(local_ip: IpAddr, config: &StartupConfig) -> Result<Ipv4Addr, TransferError> {
    if let Some(public) = &config.public_bound_address {
        return public
            .parse()
            .map_err(|_| TransferError::InvalidPortCommand(format!("bad public address {public}")));
    }
    match local_ip {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => ip.to_ipv4_mapped().ok_or_else(|| {
            TransferError::InvalidPortCommand("PASV needs an IPv4 control connection, use EPSV".into())
        }),
    }
}

/// Records the peer address of a `PORT`/`EPRT` command.
///
/// The address must belong to the client itself and use a port at or
/// above `min_client_port`.
pub async fn setup_active_mode(
    session: &mut Session,
    config: &StartupConfig,
    target: SocketAddr,
    extended: bool,
) -> Result<(), TransferError> {
    if session.data_channel().is_some() || session.has_open_data_socket() {
        info!(
            "Replacing existing data channel for client {} with new active target",
            session.peer_addr()
        );
        session.release_data_channel(true).await;
    }

    let client_ip = canonical(session.peer_addr().ip());
    if canonical(target.ip()) != client_ip {
        return Err(TransferError::IpMismatch {
            expected: client_ip,
            provided: target.ip(),
        });
    }
    if target.port() < config.min_client_port {
        return Err(TransferError::InvalidPortRange(target.port()));
    }

    let mode = if extended {
        TransferMode::ExtendedActive
    } else {
        TransferMode::Active
    };
    session.set_data_channel(Some(DataChannel::Active { target, mode }));
    info!("Client {} requested active data connection to {}", session.peer_addr(), target);
    Ok(())
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Returns the data socket for the next transfer, connecting the pending
/// descriptor if needed. A data-alive socket from an earlier transfer is
/// reused as is.
pub async fn open_data_socket<'a>(
    session: &'a mut Session,
    config: &StartupConfig,
) -> Result<&'a mut DataSocket, TransferError> {
    if session.is_data_alive() && session.has_open_data_socket() {
        debug!("Client {} reuses its data socket", session.peer_addr());
    } else {
        let channel = session
            .take_data_channel()
            .ok_or(TransferError::DataChannelNotInitialized)?;
        let ctx = ConnectContext {
            owner: session.peer_addr().ip(),
            control_addr: session.local_addr(),
            config,
        };
        let (stream, peer) = channel.connect(&ctx).await?;
        socket_opts::apply_to_stream(&stream, &config.socket);

        let socket = DataSocket::new(stream, session.is_data_alive())
            .with_timeout(Some(config.data_timeout()))
            .with_peer(peer);
        session.set_data_socket(Some(socket));
    }

    session
        .data_socket_mut()
        .ok_or(TransferError::DataChannelNotInitialized)
}
