//! Passive side: listening sockets and multiplexed accept.
//!
//! The [`Listener`] owns one bound socket per configured local address and
//! is the only thing that ever mutates that set. [`Listener::connected`]
//! makes one non-blocking pass over the sockets and produces at most one
//! inbound session per call.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use socket2::Socket;
use tracing::{error, info, warn};

use super::connection::{Connection, Direction, Incoming};
use super::signature::MAX_KEY_LEN;
use super::{tcp, AddressFamily, SessionSocket, BGP_PORT};
use crate::error::{NetworkError, NetworkResult};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 200;

/// Parameters of the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Local addresses to listen on.
    pub hosts: Vec<IpAddr>,
    /// Port shared by every host.
    pub port: u16,
    /// Listen backlog of each socket.
    pub backlog: i32,
    /// Enable TCP keepalive probes on listening sockets.
    pub keepalive: bool,
}

impl ListenerConfig {
    /// Listen on `hosts` on the BGP port.
    pub fn new(hosts: Vec<IpAddr>) -> Self {
        Self {
            hosts,
            port: BGP_PORT,
            backlog: DEFAULT_BACKLOG,
            keepalive: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_keepalive(mut self, keepalive: bool) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// One listening endpoint.
#[derive(Debug)]
pub struct BoundSocket {
    /// Address the socket was asked to bind.
    addr: SocketAddr,
    /// Address the kernel bound, with the real port when `addr` used port 0.
    local: SocketAddr,
    backlog: i32,
    socket: Socket,
}

impl BoundSocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }
}

/// Owns the listening sockets and accepts inbound sessions from them.
///
/// Sockets are visited in address order. Each pass starts at the socket
/// after the one that produced the previous session, so a busy address
/// cannot starve the others.
#[derive(Debug)]
pub struct Listener {
    config: ListenerConfig,
    serving: bool,
    sockets: BTreeMap<(IpAddr, u16), BoundSocket>,
    next: usize,
    signature_keys: BTreeMap<IpAddr, Vec<u8>>,
    min_ttl: Option<u8>,
}

impl Listener {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            serving: false,
            sockets: BTreeMap::new(),
            next: 0,
            signature_keys: BTreeMap::new(),
            min_ttl: None,
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn is_serving(&self) -> bool {
        self.serving
    }

    /// The bound sockets, in visiting order.
    pub fn sockets(&self) -> impl Iterator<Item = &BoundSocket> {
        self.sockets.values()
    }

    /// Addresses actually bound.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.values().map(BoundSocket::local_addr).collect()
    }

    /// Bind every configured host that is not bound yet and start serving.
    ///
    /// On failure the sockets bound so far stay bound, so calling `start`
    /// again only retries the hosts that are missing.
    pub fn start(&mut self) -> NetworkResult<()> {
        let port = self.config.port;

        for host in self.config.hosts.clone() {
            if self.sockets.contains_key(&(host, port)) {
                continue;
            }

            match self.bind(host, port) {
                Ok(bound) => {
                    self.sockets.insert((host, port), bound);
                }
                Err(e) => {
                    error!(host = %host, port, error = %e, "{}", e);
                    return Err(e);
                }
            }
        }

        self.serving = true;
        Ok(())
    }

    fn bind(&self, host: IpAddr, port: u16) -> NetworkResult<BoundSocket> {
        let addr = SocketAddr::new(host, port);
        let family = AddressFamily::of(host);
        let socket = tcp::create(family)?;

        tcp::set_reuse_address(&socket, addr)?;
        if family == AddressFamily::Ipv6 {
            tcp::set_only_v6(&socket, addr)?;
        }
        tcp::bind(&socket, addr)?;
        tcp::set_nonblocking(&socket, addr)?;
        if self.config.keepalive {
            tcp::set_keepalive(&socket, addr)?;
        }
        for (peer, key) in &self.signature_keys {
            if AddressFamily::of(*peer) == family {
                tcp::set_signature_key(&socket, SocketAddr::new(*peer, 0), key)?;
            }
        }
        if let Some(ttl) = self.min_ttl {
            tcp::set_min_ttl(&socket, addr, ttl)?;
        }
        tcp::listen(&socket, addr, self.config.backlog)?;

        let local = tcp::local_addr(&socket, addr);
        info!(address = %local, "Listening for BGP connections on {}", local);

        Ok(BoundSocket {
            addr,
            local,
            backlog: self.config.backlog,
            socket,
        })
    }

    /// One accept pass over the bound sockets.
    ///
    /// Returns `Ok(None)` when not serving or when no socket has a pending
    /// connection. An accept failure other than "would block" is fatal and
    /// returned to the caller. An accepted session that cannot be set up is
    /// closed and logged.
    pub fn connected(&mut self) -> NetworkResult<Option<Incoming>> {
        if !self.serving || self.sockets.is_empty() {
            return Ok(None);
        }

        let count = self.sockets.len();
        let start = self.next % count;
        let bound: Vec<&BoundSocket> = self.sockets.values().collect();

        for offset in 0..count {
            let index = (start + offset) % count;
            let listening = bound[index];

            let accepted = match tcp::accept(&listening.socket, listening.local) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => continue,
                Err(e) => {
                    error!(address = %listening.local, error = %e, "{}", e);
                    return Err(NetworkError::Accept(e));
                }
            };

            self.next = index + 1;
            let (socket, peer) = accepted;
            let local = tcp::local_addr(&socket, listening.local);

            // Only the listening socket failing is fatal; a session that
            // cannot be set up is dropped and the pass goes on.
            match incoming(socket, peer, local) {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Dropping connection from {}: {}", peer, e);
                }
            }
        }

        Ok(None)
    }

    /// Require TCP MD5 signatures from `peer` on sessions it opens to us.
    ///
    /// Applied to every bound socket of the peer's family, and remembered
    /// for sockets bound later. An empty key removes the peer's key. If any
    /// socket rejects the key, the sockets already updated get their
    /// previous key back.
    pub fn set_signature_key(&mut self, peer: IpAddr, key: impl Into<Vec<u8>>) -> NetworkResult<()> {
        let key = key.into();
        let addr = SocketAddr::new(peer, 0);
        if key.len() > MAX_KEY_LEN {
            return Err(NetworkError::Signature {
                addr,
                reason: format!(
                    "key is {} bytes long, at most {} are supported",
                    key.len(),
                    MAX_KEY_LEN
                ),
            });
        }

        let previous = self.signature_keys.get(&peer).cloned();
        if key.is_empty() && previous.is_none() {
            return Ok(());
        }

        let family = AddressFamily::of(peer);
        let sockets: Vec<&BoundSocket> = self
            .sockets
            .values()
            .filter(|bound| AddressFamily::from(bound.addr) == family)
            .collect();

        for (done, bound) in sockets.iter().enumerate() {
            if let Err(e) = tcp::set_signature_key(&bound.socket, addr, &key) {
                let restore = previous.as_deref().unwrap_or_default();
                for keyed in &sockets[..done] {
                    let _ = tcp::set_signature_key(&keyed.socket, addr, restore);
                }
                return Err(e);
            }
        }

        if key.is_empty() {
            self.signature_keys.remove(&peer);
        } else {
            self.signature_keys.insert(peer, key);
        }
        Ok(())
    }

    /// Drop inbound segments with a TTL below `ttl` on every bound socket.
    /// Accepted sessions inherit the setting.
    pub fn set_min_ttl(&mut self, ttl: u8) -> NetworkResult<()> {
        for bound in self.sockets.values() {
            tcp::set_min_ttl(&bound.socket, bound.addr, ttl)?;
        }

        self.min_ttl = Some(ttl);
        Ok(())
    }

    /// Close every listening socket. Does nothing when not serving.
    pub fn stop(&mut self) {
        if !self.serving {
            return;
        }

        for bound in std::mem::take(&mut self.sockets).into_values() {
            info!(address = %bound.local, "Stopped listening on {}", bound.local);
        }

        self.next = 0;
        self.serving = false;
    }
}

/// Wrap an accepted socket into an inbound session.
fn incoming<S: SessionSocket>(socket: S, peer: SocketAddr, local: SocketAddr) -> NetworkResult<Connection<S>> {
    socket.set_nonblocking(peer)?;
    let connection = Connection::new(Direction::Incoming, peer, local, socket);

    info!(connection = %connection, local = %local, "Accepted connection from {}", peer);
    Ok(connection)
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
