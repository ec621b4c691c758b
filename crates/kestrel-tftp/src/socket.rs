//! UDP socket construction
//!
//! Sockets are built through `socket2` so buffer sizes and address reuse can
//! be set before binding, then handed to tokio.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::SocketConfig;

/// Bind a UDP socket on `addr` with the given tuning.
///
/// An IPv6 wildcard address also accepts IPv4 peers.
pub fn bind_udp(addr: SocketAddr, config: &SocketConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if config.recv_buffer_kb > 0 {
        socket.set_recv_buffer_size(config.recv_buffer_kb * 1024)?;
    }
    if config.send_buffer_kb > 0 {
        socket.set_send_buffer_size(config.send_buffer_kb * 1024)?;
    }
    if config.reuse_address && addr.port() != 0 {
        socket.set_reuse_address(true)?;
    }
    if let SocketAddr::V6(v6) = addr
        && v6.ip().is_unspecified()
    {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket)?;
    debug!("Bound UDP socket {}", socket.local_addr()?);
    Ok(socket)
}

/// Fresh socket on an OS-chosen port; its port is this end's TID
pub fn bind_ephemeral(ip: IpAddr, config: &SocketConfig) -> io::Result<UdpSocket> {
    bind_udp(SocketAddr::new(ip, 0), config)
}

/// Wildcard address of the same family as `peer`
pub fn unspecified_for(peer: &SocketAddr) -> IpAddr {
    match peer {
        SocketAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}
