//! Outbound BGP sessions.
//!
//! An [`Outgoing`] is built eagerly: the socket is created, secured, bound
//! and the non-blocking connect issued in the constructor. A failure at any
//! of those steps is recorded as state rather than returned, so one peer's
//! broken configuration never aborts a batch of connection attempts. The
//! caller then polls [`Outgoing::establish`] until it leaves
//! [`ConnectState::Pending`].

use std::net::{IpAddr, SocketAddr};

use socket2::Socket;
use tracing::{debug, error};

use super::connection::{Connection, Direction};
use super::{tcp, AddressFamily, ConnectProgress, SessionSocket, BGP_PORT};
use crate::error::{NetworkError, NetworkResult};

/// State of an outbound connect.
///
/// `Ready` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    /// The handshake is still in flight; poll again later.
    Pending,
    /// The session is established.
    Ready,
    /// The attempt is over and will never succeed.
    Failed,
}

impl ConnectState {
    pub fn is_connected(self) -> bool {
        self == ConnectState::Ready
    }

    pub fn is_terminal(self) -> bool {
        self != ConnectState::Pending
    }
}

/// Parameters of one outbound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingConfig {
    /// Peer to connect to.
    pub peer: IpAddr,
    /// Local address to bind to. The port is chosen by the kernel.
    pub local: IpAddr,
    /// Destination port.
    pub port: u16,
    /// TCP MD5 signature key. Empty disables signing.
    pub signature_key: Vec<u8>,
    /// TTL of outbound packets (GTSM). `None` leaves the system default.
    pub ttl: Option<u8>,
    /// Minimum TTL of inbound packets (GTSM). `None` accepts any.
    pub min_ttl: Option<u8>,
    /// Enable TCP keepalive probes.
    pub keepalive: bool,
}

impl OutgoingConfig {
    /// Connect from `local` to `peer` on the BGP port.
    pub fn new(peer: IpAddr, local: IpAddr) -> Self {
        Self {
            peer,
            local,
            port: BGP_PORT,
            signature_key: Vec::new(),
            ttl: None,
            min_ttl: None,
            keepalive: false,
        }
    }

    /// Set the destination port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the TCP MD5 signature key.
    pub fn with_signature_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.signature_key = key.into();
        self
    }

    /// Set the outbound TTL.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set the minimum inbound TTL.
    pub fn with_min_ttl(mut self, ttl: u8) -> Self {
        self.min_ttl = Some(ttl);
        self
    }

    /// Enable or disable TCP keepalive.
    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(self.peer)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.peer, self.port)
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local, 0)
    }
}

/// One attempted outbound session.
#[derive(Debug)]
pub struct Outgoing<S = Socket> {
    config: OutgoingConfig,
    connection: Connection<S>,
    initialized: bool,
    state: ConnectState,
}

impl Outgoing<Socket> {
    /// Create the socket and start connecting.
    pub fn new(config: OutgoingConfig) -> Self {
        debug!(target: "wire", peer = %config.peer, "Attempting connection to {}", config.peer);

        let socket = match tcp::create(config.family()) {
            Ok(socket) => socket,
            Err(e) => {
                debug!(target: "wire", peer = %config.peer, error = %e, "Connection failed, {}", e);
                let connection =
                    Connection::closed(Direction::Outgoing, config.peer_addr(), config.local_addr());
                return Self::failed(config, connection);
            }
        };

        Self::with_socket(config, socket)
    }
}

impl<S: SessionSocket> Outgoing<S> {
    /// Start connecting over an already created socket.
    pub fn with_socket(config: OutgoingConfig, socket: S) -> Self {
        let result = Self::prepare(&config, &socket);
        let mut connection = Connection::new(
            Direction::Outgoing,
            config.peer_addr(),
            config.local_addr(),
            socket,
        );

        match result {
            Ok(()) => Self {
                config,
                connection,
                initialized: true,
                state: ConnectState::Pending,
            },
            Err(e) => {
                connection.close();
                debug!(target: "wire", connection = %connection, error = %e, "Connection failed, {}", e);
                Self::failed(config, connection)
            }
        }
    }

    /// Secure, bind and start the handshake.
    ///
    /// The signature key and minimum TTL are kernel policy for the
    /// handshake itself and must be in place before the SYN leaves.
    fn prepare(config: &OutgoingConfig, socket: &S) -> NetworkResult<()> {
        let peer = config.peer_addr();
        let local = config.local_addr();

        if AddressFamily::of(config.local) != config.family() {
            return Err(NetworkError::FamilyMismatch { local, peer });
        }

        if !config.signature_key.is_empty() {
            socket.set_signature_key(peer, &config.signature_key)?;
        }
        if let Some(ttl) = config.min_ttl {
            socket.set_min_ttl(peer, ttl)?;
        }
        socket.bind(local)?;
        socket.set_nonblocking(peer)?;
        if config.keepalive {
            socket.set_keepalive(peer)?;
        }
        socket.connect(peer)
    }

    /// Poll the connect once.
    ///
    /// Returns [`ConnectState::Pending`] while the handshake is in flight;
    /// the caller polls again on its next turn. Once `Ready` or `Failed` is
    /// returned, every later call returns the same state without touching
    /// the socket. The socket is never closed here on failure; the caller
    /// closes it or drops the session.
    pub fn establish(&mut self) -> ConnectState {
        if self.state.is_terminal() {
            return self.state;
        }

        let Some(socket) = self.connection.socket() else {
            self.state = ConnectState::Failed;
            return self.state;
        };
        let peer = self.config.peer_addr();

        self.state = match socket.poll_connect(peer) {
            Ok(ConnectProgress::Pending) => ConnectState::Pending,
            Ok(ConnectProgress::Connected) => match Self::finish(&self.config, socket) {
                Ok(()) => {
                    debug!(target: "wire", connection = %self.connection, "Connection established");
                    ConnectState::Ready
                }
                Err(e) => {
                    error!(connection = %self.connection, error = %e, "Could not configure connection: {}", e);
                    ConnectState::Failed
                }
            },
            Err(e) => {
                debug!(target: "wire", connection = %self.connection, error = %e, "Connection failed, {}", e);
                ConnectState::Failed
            }
        };

        self.state
    }

    /// Options only meaningful once the session exists.
    fn finish(config: &OutgoingConfig, socket: &S) -> NetworkResult<()> {
        let peer = config.peer_addr();

        socket.set_nagle(peer, false)?;
        if let Some(ttl) = config.ttl {
            socket.set_ttl(peer, ttl)?;
        }
        Ok(())
    }
}

impl<S> Outgoing<S> {
    fn failed(config: OutgoingConfig, connection: Connection<S>) -> Self {
        Self {
            config,
            connection,
            initialized: false,
            state: ConnectState::Failed,
        }
    }

    /// Whether construction succeeded. A session that failed to initialize
    /// never touches its socket again.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn config(&self) -> &OutgoingConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection<S> {
        &self.connection
    }

    /// Take the established connection for hand-off to the BGP FSM.
    /// Returns the session unchanged unless it is `Ready`.
    pub fn into_connection(self) -> Result<Connection<S>, Self> {
        if self.state == ConnectState::Ready {
            Ok(self.connection)
        } else {
            Err(self)
        }
    }

    /// Abandon the attempt. Safe to call at any point, and more than once.
    pub fn close(&mut self) {
        self.connection.close();
    }
}
