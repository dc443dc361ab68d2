//! Mock socket for unit testing the outgoing session state machine.
//!
//! Used by the unit tests of `outgoing` and `listener`, and by anything
//! driving an [`Outgoing`](super::Outgoing) without a network.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use super::{ConnectProgress, SessionSocket};
use crate::error::{BindingError, NetworkError, NetworkResult};

/// A socket operation recorded by [`MockSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOp {
    SignatureKey,
    MinTtl,
    Bind,
    NonBlocking,
    Keepalive,
    Nagle,
    Ttl,
    Connect,
    PollConnect,
}

/// Scripted outcome of one `poll_connect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockProgress {
    Pending,
    Connected,
    Refused,
}

/// Operations performed on a mock socket, shared so they stay observable
/// after the socket has been closed.
#[derive(Debug, Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<SocketOp>>>);

impl OpLog {
    fn push(&self, op: SocketOp) {
        if let Ok(mut ops) = self.0.lock() {
            ops.push(op);
        }
    }

    /// All operations, in call order.
    pub fn ops(&self) -> Vec<SocketOp> {
        self.0.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    /// Number of operations performed.
    pub fn len(&self) -> usize {
        self.0.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times `op` was performed.
    pub fn count(&self, op: SocketOp) -> usize {
        self.ops().iter().filter(|o| **o == op).count()
    }

    /// Position of the first `op`, if it was performed.
    pub fn position(&self, op: SocketOp) -> Option<usize> {
        self.ops().iter().position(|o| *o == op)
    }
}

/// A mock socket for testing session logic.
///
/// This socket allows tests to:
/// - Record every operation in call order
/// - Fail any operation with a given error kind
/// - Script the results of successive connect polls
#[derive(Debug, Default)]
pub struct MockSocket {
    log: OpLog,
    failures: HashMap<SocketOp, io::ErrorKind>,
    progress: RefCell<VecDeque<MockProgress>>,
}

impl MockSocket {
    /// Create a mock socket whose connect stays pending forever.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle on the operation log.
    pub fn log(&self) -> OpLog {
        self.log.clone()
    }

    /// Make `op` fail with `kind`.
    pub fn fail_on(mut self, op: SocketOp, kind: io::ErrorKind) -> Self {
        self.failures.insert(op, kind);
        self
    }

    /// Script the results of successive `poll_connect` calls.
    /// Once the script runs out the connect stays pending.
    pub fn with_progress<I>(self, progress: I) -> Self
    where
        I: IntoIterator<Item = MockProgress>,
    {
        self.progress.borrow_mut().extend(progress);
        self
    }

    fn record(&self, op: SocketOp, addr: SocketAddr) -> NetworkResult<()> {
        self.log.push(op);

        let Some(kind) = self.failures.get(&op).copied() else {
            return Ok(());
        };
        let source = io::Error::from(kind);

        Err(match op {
            SocketOp::Bind => BindingError::from_io(addr, source).into(),
            SocketOp::SignatureKey => NetworkError::Signature {
                addr,
                reason: source.to_string(),
            },
            SocketOp::Connect | SocketOp::PollConnect => NetworkError::Connect { addr, source },
            _ => NetworkError::SocketOption {
                option: "mock",
                addr,
                source,
            },
        })
    }
}

impl SessionSocket for MockSocket {
    fn set_signature_key(&self, peer: SocketAddr, _key: &[u8]) -> NetworkResult<()> {
        self.record(SocketOp::SignatureKey, peer)
    }

    fn set_min_ttl(&self, peer: SocketAddr, _ttl: u8) -> NetworkResult<()> {
        self.record(SocketOp::MinTtl, peer)
    }

    fn bind(&self, local: SocketAddr) -> NetworkResult<()> {
        self.record(SocketOp::Bind, local)
    }

    fn set_nonblocking(&self, peer: SocketAddr) -> NetworkResult<()> {
        self.record(SocketOp::NonBlocking, peer)
    }

    fn set_keepalive(&self, peer: SocketAddr) -> NetworkResult<()> {
        self.record(SocketOp::Keepalive, peer)
    }

    fn set_nagle(&self, peer: SocketAddr, _enabled: bool) -> NetworkResult<()> {
        self.record(SocketOp::Nagle, peer)
    }

    fn set_ttl(&self, peer: SocketAddr, _ttl: u8) -> NetworkResult<()> {
        self.record(SocketOp::Ttl, peer)
    }

    fn connect(&self, peer: SocketAddr) -> NetworkResult<()> {
        self.record(SocketOp::Connect, peer)
    }

    fn poll_connect(&self, peer: SocketAddr) -> NetworkResult<ConnectProgress> {
        self.record(SocketOp::PollConnect, peer)?;

        match self.progress.borrow_mut().pop_front() {
            None | Some(MockProgress::Pending) => Ok(ConnectProgress::Pending),
            Some(MockProgress::Connected) => Ok(ConnectProgress::Connected),
            Some(MockProgress::Refused) => Err(NetworkError::Connect {
                addr: peer,
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.1:179".parse().unwrap()
    }

    #[test]
    fn test_mock_records_operations() {
        let socket = MockSocket::new();
        let log = socket.log();

        socket.bind(peer()).unwrap();
        socket.connect(peer()).unwrap();
        drop(socket);

        assert_eq!(log.ops(), vec![SocketOp::Bind, SocketOp::Connect]);
        assert_eq!(log.count(SocketOp::Bind), 1);
        assert_eq!(log.position(SocketOp::Connect), Some(1));
    }

    #[test]
    fn test_mock_failure_injection() {
        let socket = MockSocket::new().fail_on(SocketOp::Bind, io::ErrorKind::AddrInUse);

        let err = socket.bind(peer()).unwrap_err();

        assert!(matches!(
            err,
            NetworkError::Binding(BindingError::AddressInUse { .. })
        ));
    }

    #[test]
    fn test_mock_progress_script() {
        let socket = MockSocket::new().with_progress([
            MockProgress::Pending,
            MockProgress::Connected,
        ]);

        assert_eq!(socket.poll_connect(peer()).unwrap(), ConnectProgress::Pending);
        assert_eq!(socket.poll_connect(peer()).unwrap(), ConnectProgress::Connected);
        // Script exhausted
        assert_eq!(socket.poll_connect(peer()).unwrap(), ConnectProgress::Pending);
    }

    #[test]
    fn test_mock_refused() {
        let socket = MockSocket::new().with_progress([MockProgress::Refused]);

        let err = socket.poll_connect(peer()).unwrap_err();

        assert!(matches!(err, NetworkError::Connect { .. }));
    }
}
