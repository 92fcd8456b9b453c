//! Blocking UDP socket shared by the host's receive threads.
//!
//! The socket is configured through `socket2` before it is bound, then used
//! as a plain [`std::net::UdpSocket`] with a short read timeout so receive
//! threads notice shutdown.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::core::{HostConfig, RECEIVE_POLL_INTERVAL};

/// UDP socket of a host.
#[derive(Debug)]
pub struct HostSocket {
    socket: UdpSocket,
    dual_stack: bool,
}

impl HostSocket {
    /// Create and bind a socket according to `config`.
    pub fn bind(config: &HostConfig) -> io::Result<Self> {
        Self::bind_with_timeout(config, RECEIVE_POLL_INTERVAL)
    }

    /// Like [`HostSocket::bind`] with a custom read timeout.
    pub fn bind_with_timeout(config: &HostConfig, read_timeout: Duration) -> io::Result<Self> {
        let ip = config.bind_address.unwrap_or(if config.dual_mode {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let addr = SocketAddr::new(ip, config.port);
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        let dual_stack = addr.is_ipv6() && config.dual_mode;
        if addr.is_ipv6() {
            socket.set_only_v6(!config.dual_mode)?;
            socket.set_unicast_hops_v6(config.ttl)?;
        } else {
            socket.set_ttl(config.ttl)?;
        }
        if config.broadcast && addr.is_ipv4() {
            socket.set_broadcast(true)?;
        }
        socket.set_send_buffer_size(config.send_buffer_size)?;
        socket.set_recv_buffer_size(config.receive_buffer_size)?;
        socket.set_read_timeout(Some(read_timeout))?;
        socket.bind(&SockAddr::from(addr))?;

        let socket: UdpSocket = socket.into();
        tracing::debug!(local = ?socket.local_addr().ok(), dual_stack, "socket bound");
        Ok(Self { socket, dual_stack })
    }

    /// Local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one datagram.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, self.outbound(addr))
    }

    /// Receive one datagram into `buf`.
    ///
    /// Returns `Ok(None)` when the read timeout expires without data.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((len, addr)) => Ok(Some((len, normalize(addr)))),
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Map an IPv4 destination onto a dual-stack socket.
    fn outbound(&self, addr: SocketAddr) -> SocketAddr {
        match addr {
            SocketAddr::V4(v4) if self.dual_stack => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            other => other,
        }
    }
}

/// Collapse IPv4-mapped IPv6 addresses so one remote has one key.
pub fn normalize(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}
