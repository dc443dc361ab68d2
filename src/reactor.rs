//! Polling loop driving outgoing sessions and the listener.
//!
//! One task owns every socket. On each tick it polls each pending
//! outgoing session once and makes one accept pass over the listener, then
//! hands established sessions to the BGP layer over a channel. Nothing in
//! here blocks: a peer that is slow to answer only costs one poll per tick.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::NetworkResult;
use crate::net::{Connection, ConnectState, Direction, Listener, Outgoing, OutgoingConfig};

/// Events emitted to the BGP layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A session is ready for the OPEN exchange.
    Established {
        direction: Direction,
        peer: SocketAddr,
        local: SocketAddr,
        stream: TcpStream,
    },
    /// An outgoing attempt failed; it will be retried.
    ConnectFailed { peer: SocketAddr, retry_in: Duration },
}

/// Connection attempts towards one configured peer.
#[derive(Debug)]
struct PeerDriver {
    config: OutgoingConfig,
    outgoing: Option<Outgoing>,
    retry_at: Option<Instant>,
    established: bool,
}

impl PeerDriver {
    fn new(config: OutgoingConfig) -> Self {
        Self {
            config,
            outgoing: None,
            retry_at: None,
            established: false,
        }
    }

    /// Advance the attempt by one step.
    ///
    /// Returns the connection once it is established, after which the driver
    /// goes idle: the session belongs to the BGP layer from then on.
    fn poll(&mut self, now: Instant, retry: Duration) -> PeerPoll {
        if self.established {
            return PeerPoll::Idle;
        }

        if self.outgoing.is_none() {
            if self.retry_at.is_some_and(|at| now < at) {
                return PeerPoll::Idle;
            }
            let outgoing = Outgoing::new(self.config.clone());
            if !outgoing.is_initialized() {
                self.retry_at = Some(now + retry);
                return PeerPoll::Failed;
            }
            self.outgoing = Some(outgoing);
        }

        let Some(outgoing) = self.outgoing.as_mut() else {
            return PeerPoll::Idle;
        };

        match outgoing.establish() {
            ConnectState::Pending => PeerPoll::Idle,
            ConnectState::Failed => {
                if let Some(mut outgoing) = self.outgoing.take() {
                    outgoing.close();
                }
                self.retry_at = Some(now + retry);
                PeerPoll::Failed
            }
            ConnectState::Ready => match self.outgoing.take().map(Outgoing::into_connection) {
                Some(Ok(connection)) => {
                    self.established = true;
                    PeerPoll::Ready(connection)
                }
                _ => PeerPoll::Idle,
            },
        }
    }

    fn close(&mut self) {
        if let Some(mut outgoing) = self.outgoing.take() {
            outgoing.close();
        }
    }
}

enum PeerPoll {
    Idle,
    Ready(Connection),
    Failed,
}

/// Owns the listener and every outgoing attempt.
pub struct Reactor {
    listener: Option<Listener>,
    peers: Vec<PeerDriver>,
    known_peers: HashSet<IpAddr>,
    connect_retry: Duration,
    poll_interval: Duration,
    events_tx: mpsc::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Reactor {
    /// Build the reactor from the configuration. No socket is opened yet.
    pub fn new(
        config: &Config,
        events_tx: mpsc::Sender<TransportEvent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> NetworkResult<Self> {
        let mut listener = config.listener_config().map(Listener::new);

        if let Some(listener) = listener.as_mut() {
            for peer in &config.peers {
                if let Some(key) = &peer.md5 {
                    listener.set_signature_key(peer.address, key.as_bytes())?;
                }
            }
            if let Some(ttl) = config.listener.min_ttl {
                listener.set_min_ttl(ttl)?;
            }
        }

        let peers = config
            .peers
            .iter()
            .filter(|peer| !peer.passive)
            .map(|peer| PeerDriver::new(peer.outgoing_config(&config.tcp)))
            .collect();

        Ok(Self {
            listener,
            peers,
            known_peers: config.peers.iter().map(|peer| peer.address).collect(),
            connect_retry: config.tcp.connect_retry(),
            poll_interval: config.tcp.poll_interval(),
            events_tx,
            shutdown_rx,
        })
    }

    /// Addresses the listener is bound to.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listener
            .as_ref()
            .map(Listener::local_addrs)
            .unwrap_or_default()
    }

    /// Bind the listening sockets.
    pub fn start(&mut self) -> NetworkResult<()> {
        if let Some(listener) = self.listener.as_mut() {
            listener.start()?;
        }
        Ok(())
    }

    /// Run until shutdown is signalled or the listener fails.
    pub async fn run(mut self) -> NetworkResult<()> {
        self.start()?;
        info!(
            peers = self.peers.len(),
            listening = ?self.listen_addrs(),
            "Transport reactor started"
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if *self.shutdown_rx.borrow() {
                break Ok(());
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        break Err(e);
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        self.shutdown();
        result
    }

    /// One scheduler turn: poll every outgoing attempt once, accept at most
    /// one inbound session.
    pub async fn poll_once(&mut self) -> NetworkResult<()> {
        let now = Instant::now();
        let retry = self.connect_retry;

        let mut ready = Vec::new();
        let mut failed = Vec::new();
        for driver in &mut self.peers {
            match driver.poll(now, retry) {
                PeerPoll::Idle => {}
                PeerPoll::Ready(connection) => ready.push(connection),
                PeerPoll::Failed => failed.push(driver.config.peer_addr()),
            }
        }

        for peer in failed {
            debug!(peer = %peer, "Retrying connection to {} in {:?}", peer, retry);
            self.emit(TransportEvent::ConnectFailed {
                peer,
                retry_in: retry,
            })
            .await;
        }
        for connection in ready {
            self.hand_off(connection).await;
        }

        let incoming = match self.listener.as_mut() {
            Some(listener) => match listener.connected() {
                Ok(incoming) => incoming,
                Err(e) => {
                    listener.stop();
                    return Err(e);
                }
            },
            None => None,
        };

        if let Some(mut connection) = incoming {
            if self.known_peers.contains(&connection.peer().ip()) {
                self.hand_off(connection).await;
            } else {
                warn!(
                    peer = %connection.peer(),
                    "Dropping connection from unknown peer: {}",
                    connection.peer()
                );
                connection.close();
            }
        }

        Ok(())
    }

    async fn hand_off(&self, connection: Connection) {
        let name = connection.name();
        let direction = connection.direction();
        let peer = connection.peer();
        let local = connection.local();

        let stream = match connection.into_tokio() {
            Ok(stream) => stream,
            Err(e) => {
                error!(connection = %name, error = %e, "Failed to hand off connection: {}", e);
                return;
            }
        };

        info!(connection = %name, local = %local, "Connection established with {}", peer);
        self.emit(TransportEvent::Established {
            direction,
            peer,
            local,
            stream,
        })
        .await;
    }

    async fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events_tx.send(event).await {
            warn!(error = %e, "Transport event dropped: {}", e);
        }
    }

    /// Abandon pending attempts and stop listening.
    fn shutdown(&mut self) {
        for driver in &mut self.peers {
            driver.close();
        }
        if let Some(listener) = self.listener.as_mut() {
            listener.stop();
        }
        info!("Transport reactor stopped");
    }
}
