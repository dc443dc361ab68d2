//! Error types for the BGP transport layer.
//!
//! This module provides unified error types using thiserror for consistent
//! error handling throughout the codebase. "Would block" is never an error
//! here: the non-blocking operations report it as a pending result instead.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::net::AddressFamily;

/// Top-level error type for the transport daemon.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket-level network error.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while binding a socket to a local address.
#[derive(Error, Debug)]
pub enum BindingError {
    /// Another socket already owns the address/port pair.
    #[error("could not listen on {addr}, the port already in use by another application")]
    AddressInUse { addr: SocketAddr },

    /// The address is not configured on any local interface.
    #[error("could not listen on {addr}, this is an invalid address")]
    AddressNotAvailable { addr: SocketAddr },

    /// Any other bind or listen failure.
    #[error("could not listen on {addr} ({source})")]
    Other {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl BindingError {
    /// Classify an OS error from `bind(2)` or `listen(2)`.
    pub fn from_io(addr: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse => BindingError::AddressInUse { addr },
            io::ErrorKind::AddrNotAvailable => BindingError::AddressNotAvailable { addr },
            _ => BindingError::Other { addr, source },
        }
    }

    /// The address the bind was attempted on.
    pub fn addr(&self) -> SocketAddr {
        match self {
            BindingError::AddressInUse { addr }
            | BindingError::AddressNotAvailable { addr }
            | BindingError::Other { addr, .. } => *addr,
        }
    }
}

/// A listening socket failed to accept for a reason other than "would block".
#[derive(Error, Debug)]
#[error("could not accept a new connection on {addr} ({source})")]
pub struct AcceptError {
    pub addr: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// Errors raised by the socket primitives, outgoing sessions and listener.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The socket could not be allocated.
    #[error("could not create socket for {family} ({source})")]
    Create {
        family: AddressFamily,
        #[source]
        source: io::Error,
    },

    /// Bind or listen failure.
    #[error(transparent)]
    Binding(#[from] BindingError),

    /// Accept failure on a listening socket.
    #[error(transparent)]
    Accept(#[from] AcceptError),

    /// A socket option was rejected by the kernel.
    #[error("could not set {option} for {addr} ({source})")]
    SocketOption {
        option: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The TCP signature key could not be installed.
    #[error("could not set TCP MD5 signature for {addr}: {reason}")]
    Signature { addr: SocketAddr, reason: String },

    /// The non-blocking connect could not be issued, or completed with an error.
    #[error("could not connect to {addr} ({source})")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The local and peer addresses are not of the same family.
    #[error("address family mismatch: {local} cannot reach {peer}")]
    FamilyMismatch { local: SocketAddr, peer: SocketAddr },

    /// The platform does not provide the requested feature.
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Result type for socket operations.
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors that can occur while loading the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The TOML document is malformed.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A peer entry failed validation.
    #[error("invalid peer {peer}: {reason}")]
    InvalidPeer { peer: String, reason: String },

    /// A listener entry failed validation.
    #[error("invalid listener: {0}")]
    InvalidListener(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), 179)
    }

    #[test]
    fn test_binding_error_classification() {
        let err = BindingError::from_io(addr(), io::Error::from(io::ErrorKind::AddrInUse));
        assert!(matches!(err, BindingError::AddressInUse { .. }));
        assert_eq!(
            err.to_string(),
            "could not listen on 192.0.2.1:179, the port already in use by another application"
        );

        let err = BindingError::from_io(addr(), io::Error::from(io::ErrorKind::AddrNotAvailable));
        assert!(matches!(err, BindingError::AddressNotAvailable { .. }));
        assert_eq!(
            err.to_string(),
            "could not listen on 192.0.2.1:179, this is an invalid address"
        );

        let err = BindingError::from_io(addr(), io::Error::other("boom"));
        assert!(matches!(err, BindingError::Other { .. }));
        assert_eq!(err.to_string(), "could not listen on 192.0.2.1:179 (boom)");
        assert_eq!(err.addr(), addr());
    }

    #[test]
    fn test_network_error_display_includes_os_text() {
        let err = NetworkError::Connect {
            addr: addr(),
            source: io::Error::other("connection refused"),
        };
        assert_eq!(
            err.to_string(),
            "could not connect to 192.0.2.1:179 (connection refused)"
        );

        let err: NetworkError = AcceptError {
            addr: addr(),
            source: io::Error::other("bad descriptor"),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "could not accept a new connection on 192.0.2.1:179 (bad descriptor)"
        );
    }

    #[test]
    fn test_transport_error_wraps_network_error() {
        let err: TransportError = NetworkError::Unsupported("TCP MD5 signature").into();
        assert_eq!(
            err.to_string(),
            "network error: TCP MD5 signature is not supported on this platform"
        );
    }
}
