//! A TCP session bound to its addressing metadata.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::Socket;
use tracing::debug;

use super::AddressFamily;

/// Unique connection ID generator.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which side initiated the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

/// A session accepted by the [`Listener`](super::Listener).
pub type Incoming = Connection<Socket>;

/// One socket plus the (family, peer, local) triple it talks over.
///
/// The socket is closed exactly once: by [`close`](Connection::close), by
/// handing it off with [`take_socket`](Connection::take_socket), or on drop.
pub struct Connection<S = Socket> {
    id: u64,
    direction: Direction,
    family: AddressFamily,
    peer: SocketAddr,
    local: SocketAddr,
    socket: Option<S>,
}

impl<S> Connection<S> {
    pub(crate) fn new(direction: Direction, peer: SocketAddr, local: SocketAddr, socket: S) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            family: AddressFamily::from(peer),
            peer,
            local,
            socket: Some(socket),
        }
    }

    /// A connection whose socket could not be created.
    pub(crate) fn closed(direction: Direction, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            family: AddressFamily::from(peer),
            peer,
            local,
            socket: None,
        }
    }

    /// Name used in log lines, e.g. `outgoing-3 192.0.2.1`.
    pub fn name(&self) -> String {
        self.to_string()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// The socket, unless the connection has been closed.
    pub fn socket(&self) -> Option<&S> {
        self.socket.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Take ownership of the socket. The connection is closed afterwards.
    pub fn take_socket(&mut self) -> Option<S> {
        self.socket.take()
    }

    /// Close the socket. Closing an already closed connection does nothing.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(target: "wire", connection = %self, "Closing connection {}", self);
            drop(socket);
        }
    }
}

impl Connection<Socket> {
    /// Hand the socket over as a std stream.
    pub fn into_std(mut self) -> io::Result<std::net::TcpStream> {
        self.take_socket()
            .map(std::net::TcpStream::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection is closed"))
    }

    /// Hand the socket over as a tokio stream. Must be called within a runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpStream> {
        let stream = self.into_std()?;
        stream.set_nonblocking(true)?;
        tokio::net::TcpStream::from_std(stream)
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S> fmt::Display for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{} {}", self.direction, self.id, self.peer.ip())
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("family", &self.family)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("closed", &self.is_closed())
            .finish()
    }
}
