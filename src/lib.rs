pub mod config;
pub mod error;
pub mod net;
pub mod reactor;

pub use config::{Config, PeerConfig, DEFAULT_CONFIG_PATH};
pub use error::{AcceptError, BindingError, ConfigError, NetworkError, NetworkResult, TransportError};
pub use net::{ConnectState, Connection, Incoming, Listener, ListenerConfig, Outgoing, OutgoingConfig};
pub use reactor::{Reactor, TransportEvent};
