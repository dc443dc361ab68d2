//! Transport establishment for BGP sessions.
//!
//! This module opens and accepts the TCP sessions a BGP speaker peers over.
//! Everything here is non-blocking: operations that would block return a
//! pending result and the caller polls again on its next turn.

pub mod connection;
pub mod listener;
pub mod mock;
pub mod outgoing;
pub mod signature;
pub mod tcp;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::NetworkResult;

pub use connection::{Connection, Direction, Incoming};
pub use listener::{BoundSocket, Listener, ListenerConfig};
pub use outgoing::{ConnectState, Outgoing, OutgoingConfig};

/// Well-known BGP port.
pub const BGP_PORT: u16 = 179;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// Family of an IP address.
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl From<SocketAddr> for AddressFamily {
    fn from(addr: SocketAddr) -> Self {
        AddressFamily::of(addr.ip())
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

/// Progress of a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    /// The handshake has not completed yet.
    Pending,
    /// The handshake completed.
    Connected,
}

/// Socket operations an outgoing session is driven through.
///
/// Implemented for `socket2::Socket` by the primitives in [`tcp`], and by
/// [`mock::MockSocket`] so the session state machine can be tested without
/// a network. Every operation is a single step and never retries.
pub trait SessionSocket {
    /// Install a TCP MD5 signature key for `peer`.
    fn set_signature_key(&self, peer: SocketAddr, key: &[u8]) -> NetworkResult<()>;

    /// Drop inbound segments whose TTL (hop limit) is below `ttl`.
    fn set_min_ttl(&self, peer: SocketAddr, ttl: u8) -> NetworkResult<()>;

    /// Bind to a local address.
    fn bind(&self, local: SocketAddr) -> NetworkResult<()>;

    /// Switch to non-blocking mode.
    fn set_nonblocking(&self, peer: SocketAddr) -> NetworkResult<()>;

    /// Enable TCP keepalive probes.
    fn set_keepalive(&self, peer: SocketAddr) -> NetworkResult<()>;

    /// Enable or disable Nagle's algorithm.
    fn set_nagle(&self, peer: SocketAddr, enabled: bool) -> NetworkResult<()>;

    /// Set the TTL (hop limit) of outbound packets.
    fn set_ttl(&self, peer: SocketAddr, ttl: u8) -> NetworkResult<()>;

    /// Issue a non-blocking connect. An in-progress handshake is success.
    fn connect(&self, peer: SocketAddr) -> NetworkResult<()>;

    /// Check whether the handshake has completed, without blocking.
    fn poll_connect(&self, peer: SocketAddr) -> NetworkResult<ConnectProgress>;
}
