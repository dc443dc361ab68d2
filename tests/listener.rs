//! Listener behaviour over loopback sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use bgp_transport::net::{AddressFamily, Direction};
use bgp_transport::{BindingError, Listener, ListenerConfig, NetworkError};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[test]
fn test_accept_on_configured_port() {
    let mut listener = Listener::new(ListenerConfig::new(vec![LOCALHOST]).with_port(1790));
    listener.start().expect("Failed to listen on 127.0.0.1:1790");

    let client = TcpStream::connect((Ipv4Addr::LOCALHOST, 1790)).unwrap();
    let client_addr = client.local_addr().unwrap();

    let incoming = listener
        .connected()
        .unwrap()
        .expect("Expected one incoming session");

    assert_eq!(incoming.direction(), Direction::Incoming);
    assert_eq!(incoming.family(), AddressFamily::Ipv4);
    assert_eq!(incoming.peer().ip(), LOCALHOST);
    assert_eq!(incoming.peer().port(), client_addr.port());
    assert_eq!(incoming.local(), SocketAddr::new(LOCALHOST, 1790));

    // No new client: nothing to produce.
    assert!(listener.connected().unwrap().is_none());

    listener.stop();
}

#[test]
fn test_stop_then_connected_is_empty() {
    let mut listener = Listener::new(ListenerConfig::new(vec![LOCALHOST]).with_port(0));
    listener.start().unwrap();
    let addr = listener.local_addrs()[0];

    let _client = TcpStream::connect(addr).unwrap();
    listener.stop();

    assert!(listener.connected().unwrap().is_none());
    listener.stop();
    assert!(!listener.is_serving());

    // The port is released.
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_restart_after_stop_binds_again() {
    let mut listener = Listener::new(ListenerConfig::new(vec![LOCALHOST]).with_port(0));

    listener.start().unwrap();
    listener.stop();
    listener.start().unwrap();

    assert!(listener.is_serving());
    assert_eq!(listener.sockets().count(), 1);
}

#[test]
fn test_port_in_use_reported() {
    let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = taken.local_addr().unwrap().port();

    let mut listener = Listener::new(ListenerConfig::new(vec![LOCALHOST]).with_port(port));
    let err = listener.start().unwrap_err();

    assert!(matches!(
        err,
        NetworkError::Binding(BindingError::AddressInUse { .. })
    ));
    assert_eq!(
        err.to_string(),
        format!(
            "could not listen on 127.0.0.1:{}, the port already in use by another application",
            port
        )
    );
    assert!(!listener.is_serving());
}

#[test]
fn test_retry_after_partial_failure() {
    let taken = TcpListener::bind((Ipv4Addr::new(127, 0, 0, 2), 0)).unwrap();
    let port = taken.local_addr().unwrap().port();
    let hosts = vec![LOCALHOST, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))];
    let mut listener = Listener::new(ListenerConfig::new(hosts).with_port(port));

    assert!(listener.start().is_err());
    assert_eq!(listener.sockets().count(), 1);

    drop(taken);
    listener.start().unwrap();

    assert!(listener.is_serving());
    assert_eq!(listener.sockets().count(), 2);
}

#[test]
fn test_one_session_per_pass_across_sockets() {
    let hosts = vec![
        LOCALHOST,
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)),
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 3)),
    ];
    let mut listener = Listener::new(ListenerConfig::new(hosts).with_port(0));
    listener.start().unwrap();
    let target = listener.local_addrs()[1];

    let client = TcpStream::connect(target).unwrap();

    let incoming = listener.connected().unwrap().unwrap();
    assert_eq!(incoming.local(), target);
    assert_eq!(incoming.peer(), client.local_addr().unwrap());

    assert!(listener.connected().unwrap().is_none());
}
