use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::net::signature::MAX_KEY_LEN;
use crate::net::{AddressFamily, ListenerConfig, OutgoingConfig, BGP_PORT};

/// Default config file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bgp-transport/config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tcp: TcpSettings,
    #[serde(default)]
    pub listener: ListenerSettings,
    #[serde(default, rename = "peer")]
    pub peers: Vec<PeerConfig>,
}

/// Process-wide TCP settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpSettings {
    /// Enable TCP keepalive on every session
    #[serde(default)]
    pub keepalive: bool,
    /// Default destination and listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds to wait before retrying a failed outgoing connection
    #[serde(default = "default_connect_retry_secs")]
    pub connect_retry_secs: u64,
    /// Milliseconds between two polling passes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            keepalive: false,
            port: default_port(),
            connect_retry_secs: default_connect_retry_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl TcpSettings {
    pub fn connect_retry(&self) -> Duration {
        Duration::from_secs(self.connect_retry_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerSettings {
    /// Local addresses to accept connections on (empty disables listening)
    #[serde(default)]
    pub hosts: Vec<IpAddr>,
    /// Listen port - defaults to the tcp port
    pub port: Option<u16>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Minimum inbound TTL on listening sockets for GTSM
    pub min_ttl: Option<u8>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: None,
            backlog: default_backlog(),
            min_ttl: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Peer address
    pub address: IpAddr,
    /// Local address to connect from
    pub local_address: IpAddr,
    /// Destination port - defaults to the tcp port
    pub port: Option<u16>,
    /// TCP MD5 signature key
    pub md5: Option<String>,
    /// Outbound TTL for GTSM
    pub ttl: Option<u8>,
    /// Minimum inbound TTL for GTSM
    pub min_ttl: Option<u8>,
    /// Only accept connections from this peer, never connect to it
    #[serde(default)]
    pub passive: bool,
}

fn default_port() -> u16 {
    BGP_PORT
}

fn default_connect_retry_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_backlog() -> i32 {
    crate::net::listener::DEFAULT_BACKLOG
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidListener(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.listener.backlog <= 0 {
            return Err(ConfigError::InvalidListener(format!(
                "backlog must be positive, got {}",
                self.listener.backlog
            )));
        }

        for peer in &self.peers {
            peer.validate()?;
        }
        Ok(())
    }

    /// Listener parameters, if any host is configured.
    pub fn listener_config(&self) -> Option<ListenerConfig> {
        if self.listener.hosts.is_empty() {
            return None;
        }

        Some(
            ListenerConfig::new(self.listener.hosts.clone())
                .with_port(self.listener.port.unwrap_or(self.tcp.port))
                .with_backlog(self.listener.backlog)
                .with_keepalive(self.tcp.keepalive),
        )
    }
}

impl PeerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidPeer {
            peer: self.address.to_string(),
            reason,
        };

        if AddressFamily::of(self.address) != AddressFamily::of(self.local_address) {
            return Err(invalid(format!(
                "local address {} is not of the same family",
                self.local_address
            )));
        }
        if let Some(key) = &self.md5 {
            if key.len() > MAX_KEY_LEN {
                return Err(invalid(format!(
                    "md5 key is {} bytes long, at most {} are supported",
                    key.len(),
                    MAX_KEY_LEN
                )));
            }
        }
        if self.ttl == Some(0) {
            return Err(invalid("ttl must be between 1 and 255".to_string()));
        }
        Ok(())
    }

    /// Outgoing session parameters for this peer.
    pub fn outgoing_config(&self, tcp: &TcpSettings) -> OutgoingConfig {
        let mut config = OutgoingConfig::new(self.address, self.local_address)
            .with_port(self.port.unwrap_or(tcp.port))
            .with_keepalive(tcp.keepalive);
        if let Some(key) = &self.md5 {
            config = config.with_signature_key(key.as_bytes());
        }
        if let Some(ttl) = self.ttl {
            config = config.with_ttl(ttl);
        }
        if let Some(ttl) = self.min_ttl {
            config = config.with_min_ttl(ttl);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const FULL: &str = r#"
        [tcp]
        keepalive = true
        connect_retry_secs = 10

        [listener]
        hosts = ["127.0.0.1", "::1"]
        port = 1790

        [[peer]]
        address = "192.0.2.1"
        local_address = "192.0.2.2"
        md5 = "secret"
        ttl = 255
        min_ttl = 254

        [[peer]]
        address = "192.0.2.3"
        local_address = "192.0.2.2"
        port = 1179
        passive = true
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(FULL).unwrap();

        assert!(config.tcp.keepalive);
        assert_eq!(config.tcp.port, 179);
        assert_eq!(config.tcp.connect_retry(), Duration::from_secs(10));
        assert_eq!(config.tcp.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.listener.hosts.len(), 2);
        assert_eq!(config.peers.len(), 2);
        assert!(config.peers[1].passive);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();

        assert!(!config.tcp.keepalive);
        assert_eq!(config.tcp.port, 179);
        assert_eq!(config.listener.backlog, 200);
        assert!(config.peers.is_empty());
        assert!(config.listener_config().is_none());
    }

    #[test]
    fn test_listener_config() {
        let config = Config::from_toml(FULL).unwrap();
        let listener = config.listener_config().unwrap();

        assert_eq!(listener.port, 1790);
        assert_eq!(listener.backlog, 200);
        assert!(listener.keepalive);
    }

    #[test]
    fn test_outgoing_config() {
        let config = Config::from_toml(FULL).unwrap();

        let outgoing = config.peers[0].outgoing_config(&config.tcp);
        assert_eq!(outgoing.peer, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(outgoing.port, 179);
        assert_eq!(outgoing.signature_key, b"secret".to_vec());
        assert_eq!(outgoing.ttl, Some(255));
        assert_eq!(outgoing.min_ttl, Some(254));
        assert!(outgoing.keepalive);

        let outgoing = config.peers[1].outgoing_config(&config.tcp);
        assert_eq!(outgoing.port, 1179);
        assert!(outgoing.signature_key.is_empty());
    }

    #[test]
    fn test_rejects_family_mismatch() {
        let err = Config::from_toml(
            r#"
            [[peer]]
            address = "2001:db8::1"
            local_address = "192.0.2.2"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::InvalidPeer { .. }));
    }

    #[test]
    fn test_rejects_long_md5_key() {
        let content = format!(
            r#"
            [[peer]]
            address = "192.0.2.1"
            local_address = "192.0.2.2"
            md5 = "{}"
            "#,
            "k".repeat(81)
        );

        let err = Config::from_toml(&content).unwrap_err();
        assert!(err.to_string().contains("81 bytes"));
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let err = Config::from_toml(
            r#"
            [[peer]]
            address = "192.0.2.1"
            local_address = "192.0.2.2"
            ttl = 0
            "#,
        )
        .unwrap_err();

        assert!(err.to_string().contains("ttl"));
    }

    #[test]
    fn test_rejects_out_of_range_ttl() {
        let err = Config::from_toml(
            r#"
            [[peer]]
            address = "192.0.2.1"
            local_address = "192.0.2.2"
            ttl = 256
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_invalid_address() {
        let err = Config::from_toml(
            r#"
            [[peer]]
            address = "not-an-ip"
            local_address = "192.0.2.2"
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/bgp-transport.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
