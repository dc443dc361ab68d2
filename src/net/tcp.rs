//! Socket primitives.
//!
//! Each function performs one step on a raw `socket2::Socket` and maps the
//! OS error into a [`NetworkError`] naming the address involved. None of
//! them retry, and none of them block once the socket is non-blocking.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{signature, AddressFamily, ConnectProgress, SessionSocket};
use crate::error::{AcceptError, BindingError, NetworkError, NetworkResult};

/// Allocate a TCP socket for the given family.
pub fn create(family: AddressFamily) -> NetworkResult<Socket> {
    let domain = match family {
        AddressFamily::Ipv4 => Domain::IPV4,
        AddressFamily::Ipv6 => Domain::IPV6,
    };

    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|source| NetworkError::Create { family, source })
}

/// Bind to a local address.
pub fn bind(socket: &Socket, local: SocketAddr) -> NetworkResult<()> {
    socket
        .bind(&SockAddr::from(local))
        .map_err(|e| BindingError::from_io(local, e).into())
}

/// Allow rebinding a listening address still in TIME_WAIT.
pub fn set_reuse_address(socket: &Socket, addr: SocketAddr) -> NetworkResult<()> {
    socket
        .set_reuse_address(true)
        .map_err(option_error("SO_REUSEADDR", addr))
}

/// Restrict an IPv6 socket to IPv6 traffic so an IPv4 listener can share the port.
pub fn set_only_v6(socket: &Socket, addr: SocketAddr) -> NetworkResult<()> {
    socket
        .set_only_v6(true)
        .map_err(option_error("IPV6_V6ONLY", addr))
}

/// Switch to non-blocking mode.
pub fn set_nonblocking(socket: &Socket, addr: SocketAddr) -> NetworkResult<()> {
    socket
        .set_nonblocking(true)
        .map_err(option_error("O_NONBLOCK", addr))
}

/// Enable TCP keepalive probes.
pub fn set_keepalive(socket: &Socket, addr: SocketAddr) -> NetworkResult<()> {
    socket
        .set_keepalive(true)
        .map_err(option_error("SO_KEEPALIVE", addr))
}

/// Enable or disable Nagle's algorithm.
pub fn set_nagle(socket: &Socket, addr: SocketAddr, enabled: bool) -> NetworkResult<()> {
    socket
        .set_nodelay(!enabled)
        .map_err(option_error("TCP_NODELAY", addr))
}

/// Set the TTL (IPv4) or unicast hop limit (IPv6) of outbound packets.
pub fn set_ttl(socket: &Socket, addr: SocketAddr, ttl: u8) -> NetworkResult<()> {
    match addr {
        SocketAddr::V4(_) => socket
            .set_ttl(u32::from(ttl))
            .map_err(option_error("IP_TTL", addr)),
        SocketAddr::V6(_) => socket
            .set_unicast_hops_v6(u32::from(ttl))
            .map_err(option_error("IPV6_UNICAST_HOPS", addr)),
    }
}

/// Drop inbound segments whose TTL (hop limit) is below `ttl` (GTSM, RFC 5082).
pub fn set_min_ttl(socket: &Socket, addr: SocketAddr, ttl: u8) -> NetworkResult<()> {
    min_ttl::set(socket, addr, ttl)
}

/// Install the TCP MD5 signature key for `peer`.
pub fn set_signature_key(socket: &Socket, peer: SocketAddr, key: &[u8]) -> NetworkResult<()> {
    signature::set_signature_key(socket, peer, key)
}

/// Issue a non-blocking connect.
///
/// Returns as soon as the SYN is on its way; completion is observed later
/// through [`poll_connect`].
pub fn connect(socket: &Socket, peer: SocketAddr) -> NetworkResult<()> {
    match socket.connect(&SockAddr::from(peer)) {
        Ok(()) => Ok(()),
        Err(e) if is_in_progress(&e) => Ok(()),
        Err(source) => Err(NetworkError::Connect { addr: peer, source }),
    }
}

/// Check whether a non-blocking connect has completed.
///
/// A pending socket has no error queued and no peer yet. Reading the queued
/// error clears it, so a failure is reported exactly once.
pub fn poll_connect(socket: &Socket, peer: SocketAddr) -> NetworkResult<ConnectProgress> {
    match socket.take_error() {
        Ok(None) => {}
        Ok(Some(source)) | Err(source) => {
            return Err(NetworkError::Connect { addr: peer, source });
        }
    }

    match socket.peer_addr() {
        Ok(_) => Ok(ConnectProgress::Connected),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(ConnectProgress::Pending),
        Err(source) => Err(NetworkError::Connect { addr: peer, source }),
    }
}

/// Start listening for inbound connections.
pub fn listen(socket: &Socket, local: SocketAddr, backlog: i32) -> NetworkResult<()> {
    socket
        .listen(backlog)
        .map_err(|e| BindingError::from_io(local, e).into())
}

/// Accept one pending connection.
///
/// Returns `Ok(None)` when nothing is waiting.
pub fn accept(socket: &Socket, local: SocketAddr) -> Result<Option<(Socket, SocketAddr)>, AcceptError> {
    loop {
        match socket.accept() {
            Ok((accepted, addr)) => {
                let peer = addr.as_socket().ok_or_else(|| AcceptError {
                    addr: local,
                    source: io::Error::new(io::ErrorKind::InvalidData, "peer is not an IP address"),
                })?;
                return Ok(Some((accepted, peer)));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(AcceptError { addr: local, source }),
        }
    }
}

/// Local address the kernel assigned to the socket.
pub fn local_addr(socket: &Socket, fallback: SocketAddr) -> SocketAddr {
    socket
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_socket())
        .unwrap_or(fallback)
}

fn is_in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

fn option_error(option: &'static str, addr: SocketAddr) -> impl FnOnce(io::Error) -> NetworkError {
    move |source| NetworkError::SocketOption {
        option,
        addr,
        source,
    }
}

#[cfg(target_os = "linux")]
mod min_ttl {
    use std::io;
    use std::mem;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;

    use socket2::Socket;

    use crate::error::{NetworkError, NetworkResult};

    /// `IP_MINTTL` from `linux/in.h`.
    const IP_MINTTL: libc::c_int = 21;
    /// `IPV6_MINHOPCOUNT` from `linux/in6.h`.
    const IPV6_MINHOPCOUNT: libc::c_int = 73;

    pub(super) fn set(socket: &Socket, addr: SocketAddr, ttl: u8) -> NetworkResult<()> {
        let (level, name, option) = match addr {
            SocketAddr::V4(_) => (libc::IPPROTO_IP, IP_MINTTL, "IP_MINTTL"),
            SocketAddr::V6(_) => (libc::IPPROTO_IPV6, IPV6_MINHOPCOUNT, "IPV6_MINHOPCOUNT"),
        };
        let value = libc::c_int::from(ttl);

        // SAFETY: `value` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                &value as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if rc == 0 {
            Ok(())
        } else {
            Err(NetworkError::SocketOption {
                option,
                addr,
                source: io::Error::last_os_error(),
            })
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod min_ttl {
    use std::net::SocketAddr;

    use socket2::Socket;

    use crate::error::{NetworkError, NetworkResult};

    pub(super) fn set(_socket: &Socket, _addr: SocketAddr, _ttl: u8) -> NetworkResult<()> {
        Err(NetworkError::Unsupported("minimum TTL"))
    }
}

impl SessionSocket for Socket {
    fn set_signature_key(&self, peer: SocketAddr, key: &[u8]) -> NetworkResult<()> {
        set_signature_key(self, peer, key)
    }

    fn set_min_ttl(&self, peer: SocketAddr, ttl: u8) -> NetworkResult<()> {
        set_min_ttl(self, peer, ttl)
    }

    fn bind(&self, local: SocketAddr) -> NetworkResult<()> {
        bind(self, local)
    }

    fn set_nonblocking(&self, peer: SocketAddr) -> NetworkResult<()> {
        set_nonblocking(self, peer)
    }

    fn set_keepalive(&self, peer: SocketAddr) -> NetworkResult<()> {
        set_keepalive(self, peer)
    }

    fn set_nagle(&self, peer: SocketAddr, enabled: bool) -> NetworkResult<()> {
        set_nagle(self, peer, enabled)
    }

    fn set_ttl(&self, peer: SocketAddr, ttl: u8) -> NetworkResult<()> {
        set_ttl(self, peer, ttl)
    }

    fn connect(&self, peer: SocketAddr) -> NetworkResult<()> {
        connect(self, peer)
    }

    fn poll_connect(&self, peer: SocketAddr) -> NetworkResult<ConnectProgress> {
        poll_connect(self, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;
    use std::time::Duration;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)
    }

    /// Poll until the connect leaves the pending state.
    fn wait_connect(socket: &Socket, peer: SocketAddr) -> NetworkResult<ConnectProgress> {
        for _ in 0..200 {
            match poll_connect(socket, peer)? {
                ConnectProgress::Pending => thread::sleep(Duration::from_millis(5)),
                ConnectProgress::Connected => return Ok(ConnectProgress::Connected),
            }
        }
        Ok(ConnectProgress::Pending)
    }

    #[test]
    fn test_bind_address_in_use() {
        let taken = TcpListener::bind(loopback(0)).unwrap();
        let addr = taken.local_addr().unwrap();

        let socket = create(AddressFamily::Ipv4).unwrap();
        let err = bind(&socket, addr).unwrap_err();

        assert!(matches!(
            err,
            NetworkError::Binding(BindingError::AddressInUse { .. })
        ));
    }

    #[test]
    fn test_bind_address_not_available() {
        let socket = create(AddressFamily::Ipv4).unwrap();
        let addr = SocketAddr::new(Ipv4Addr::new(192, 0, 2, 1).into(), 0);

        let err = bind(&socket, addr).unwrap_err();

        assert!(matches!(
            err,
            NetworkError::Binding(BindingError::AddressNotAvailable { .. })
        ));
        assert!(err.to_string().contains("invalid address"));
    }

    #[test]
    fn test_connect_and_poll_success() {
        let server = TcpListener::bind(loopback(0)).unwrap();
        let peer = server.local_addr().unwrap();

        let socket = create(AddressFamily::Ipv4).unwrap();
        bind(&socket, loopback(0)).unwrap();
        set_nonblocking(&socket, peer).unwrap();
        connect(&socket, peer).unwrap();

        assert_eq!(wait_connect(&socket, peer).unwrap(), ConnectProgress::Connected);
    }

    #[test]
    fn test_connect_refused_reported_by_poll() {
        // Grab a free port, then close it so nothing listens there.
        let port = TcpListener::bind(loopback(0)).unwrap().local_addr().unwrap().port();
        let peer = loopback(port);

        let socket = create(AddressFamily::Ipv4).unwrap();
        set_nonblocking(&socket, peer).unwrap();

        let result = connect(&socket, peer).and_then(|_| wait_connect(&socket, peer));

        assert!(matches!(result, Err(NetworkError::Connect { .. })));
    }

    #[test]
    fn test_accept_would_block_is_none() {
        let socket = create(AddressFamily::Ipv4).unwrap();
        let addr = loopback(0);
        set_reuse_address(&socket, addr).unwrap();
        bind(&socket, addr).unwrap();
        set_nonblocking(&socket, addr).unwrap();
        listen(&socket, addr, 8).unwrap();

        let local = local_addr(&socket, addr);
        assert_ne!(local.port(), 0);
        assert!(accept(&socket, local).unwrap().is_none());
    }

    #[test]
    fn test_socket_options() {
        let socket = create(AddressFamily::Ipv4).unwrap();
        let peer = loopback(179);

        set_keepalive(&socket, peer).unwrap();
        assert!(socket.keepalive().unwrap());

        set_nagle(&socket, peer, false).unwrap();
        assert!(socket.nodelay().unwrap());

        set_ttl(&socket, peer, 255).unwrap();
        assert_eq!(socket.ttl().unwrap(), 255);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_min_ttl() {
        let socket = create(AddressFamily::Ipv4).unwrap();
        set_min_ttl(&socket, loopback(179), 254).unwrap();
    }
}
