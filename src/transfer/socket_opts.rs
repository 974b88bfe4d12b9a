//! Module `socket_opts`
//!
//! Applies the configured TCP tuning knobs to control and data sockets.
//! Every option is best effort: a failure is logged and the socket is used
//! as it is.

use std::time::Duration;

use log::{debug, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};

use crate::config::SocketOptions;

/// Buffer sizes have to be set before connect/listen to affect the window.
pub fn apply_to_socket(socket: &TcpSocket, options: &SocketOptions) {
    if let Some(size) = options.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("Cannot set send buffer size to {}: {}", size, e);
        }
    }
    if let Some(size) = options.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("Cannot set receive buffer size to {}: {}", size, e);
        }
    }
}

/// Applies every configured option to a connected stream.
pub fn apply_to_stream(stream: &TcpStream, options: &SocketOptions) {
    let sock = SockRef::from(stream);

    if let Some(size) = options.send_buffer_size {
        best_effort("SO_SNDBUF", sock.set_send_buffer_size(size as usize));
    }
    if let Some(size) = options.recv_buffer_size {
        best_effort("SO_RCVBUF", sock.set_recv_buffer_size(size as usize));
    }
    if let Some(on) = options.tcp_no_delay {
        best_effort("TCP_NODELAY", sock.set_nodelay(on));
    }
    if let Some(on) = options.keep_alive {
        best_effort("SO_KEEPALIVE", sock.set_keepalive(on));
        if on {
            if let Some(keepalive) = keepalive_params(options) {
                best_effort("TCP_KEEPALIVE", sock.set_tcp_keepalive(&keepalive));
            }
        }
    }
    if let Some(secs) = options.linger_secs {
        best_effort("SO_LINGER", sock.set_linger(Some(Duration::from_secs(secs))));
    }

    #[cfg(target_os = "linux")]
    linux::apply(stream, options);
}

fn keepalive_params(options: &SocketOptions) -> Option<TcpKeepalive> {
    if options.keep_alive_time_secs.is_none()
        && options.keep_alive_interval_secs.is_none()
        && options.keep_alive_probes.is_none()
    {
        return None;
    }

    let mut keepalive = TcpKeepalive::new();
    if let Some(secs) = options.keep_alive_time_secs {
        keepalive = keepalive.with_time(Duration::from_secs(secs));
    }
    #[cfg(target_os = "linux")]
    {
        if let Some(secs) = options.keep_alive_interval_secs {
            keepalive = keepalive.with_interval(Duration::from_secs(secs));
        }
        if let Some(probes) = options.keep_alive_probes {
            keepalive = keepalive.with_retries(probes);
        }
    }
    Some(keepalive)
}

fn best_effort(option: &str, result: std::io::Result<()>) {
    match result {
        Ok(()) => debug!("Applied {}", option),
        Err(e) => warn!("Cannot apply {}: {}", option, e),
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::os::fd::AsRawFd;

    use tokio::net::TcpStream;

    use super::best_effort;
    use crate::config::SocketOptions;

    fn set_int(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: u32) -> std::io::Result<()> {
        let value = value as libc::c_int;
        // SAFETY: fd is a live socket owned by the caller and the option
        // value points to a properly sized c_int for the duration of the call.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    fn set_bytes(fd: libc::c_int, level: libc::c_int, name: libc::c_int, value: &[u8]) -> std::io::Result<()> {
        // SAFETY: the buffer outlives the call and its length is passed along.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                level,
                name,
                value.as_ptr() as *const libc::c_void,
                value.len() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    pub(super) fn apply(stream: &TcpStream, options: &SocketOptions) {
        let fd = stream.as_raw_fd();

        if let Some(name) = &options.congestion {
            best_effort(
                "TCP_CONGESTION",
                set_bytes(fd, libc::IPPROTO_TCP, libc::TCP_CONGESTION, name.as_bytes()),
            );
        }
        if let Some(rate) = options.max_pacing_rate {
            best_effort(
                "SO_MAX_PACING_RATE",
                set_int(fd, libc::SOL_SOCKET, libc::SO_MAX_PACING_RATE, rate),
            );
        }
        if let Some(clamp) = options.window_clamp {
            best_effort(
                "TCP_WINDOW_CLAMP",
                set_int(fd, libc::IPPROTO_TCP, libc::TCP_WINDOW_CLAMP, clamp),
            );
        }
        if let Some(segment) = options.max_segment {
            best_effort(
                "TCP_MAXSEG",
                set_int(fd, libc::IPPROTO_TCP, libc::TCP_MAXSEG, segment),
            );
        }
        if let Some(on) = options.quick_ack {
            best_effort(
                "TCP_QUICKACK",
                set_int(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, on as u32),
            );
        }
        if let Some(ms) = options.user_timeout_ms {
            best_effort(
                "TCP_USER_TIMEOUT",
                set_int(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, ms),
            );
        }
    }
}
