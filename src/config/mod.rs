//! Configuration module for paqet
//!
//! Loads the YAML configuration, fills role-dependent defaults, and
//! validates everything up front. Validation failures are aggregated into a
//! single message so operators see every problem at once.

mod crypto;
mod forward;
mod network;
mod transport;

pub use crypto::{
    block_key_size, derive_key, is_null_block, trim_key, validate_block_and_key, VALID_BLOCKS,
};
pub use forward::{ForwardConfig, ForwardProtocol};
pub use network::{parse_mac, AddrConfig, NetworkConfig, PcapBackend, PcapConfig, TcpConfig};
pub use transport::{KcpConfig, Protocol, QuicConfig, TransportConfig, UdpConfig};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Process role.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum Role {
    /// Tunnel client
    #[default]
    #[serde(rename = "client")]
    Client,
    /// Tunnel server
    #[serde(rename = "server")]
    Server,
}

/// Log output configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl LogConfig {
    fn set_defaults(&mut self) {
        if self.level.is_empty() {
            self.level = "info".into();
        }
    }

    fn validate(&self) -> Vec<String> {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" => Vec::new(),
            other => vec![format!("invalid log level '{}'", other)],
        }
    }
}

/// A plain `ip:port` endpoint (server listen / client server address).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EndpointConfig {
    /// Address in `ip:port` form
    pub addr: String,
}

impl EndpointConfig {
    /// Parsed socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        self.addr
            .parse()
            .map_err(|_| format!("invalid address '{}'", self.addr))
    }

    fn validate(&self) -> Vec<String> {
        match self.socket_addr() {
            Ok(_) => Vec::new(),
            Err(e) => vec![e],
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Process role
    pub role: Role,
    /// Log configuration
    pub log: LogConfig,
    /// Server role: address the transports are reachable at
    pub listen: EndpointConfig,
    /// Client role: server address to dial
    pub server: EndpointConfig,
    /// Network and capture configuration
    pub network: NetworkConfig,
    /// Transport configuration
    pub transport: TransportConfig,
    /// Client role: port forwarding rules
    pub forward: Vec<ForwardConfig>,
}

impl Config {
    fn set_defaults(&mut self) {
        self.log.set_defaults();
        self.network.set_defaults(self.role);
        self.transport.set_defaults();
        for f in &mut self.forward {
            f.set_defaults();
        }
        self.optimize_mtu();
    }

    // The KCP MTU can use the whole Ethernet payload minus the crafted
    // headers when only one address family is configured. Leaves an 8-byte
    // safety margin below the theoretical maximum.
    fn optimize_mtu(&mut self) {
        let Some(kcp) = &mut self.transport.kcp else {
            return;
        };
        if kcp.mtu != 1400 {
            return; // user-specified
        }
        if self.network.ipv4_only() {
            kcp.mtu = 1440;
        } else if self.network.ipv6_only() {
            kcp.mtu = 1420;
        }
    }

    fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        errors.extend(self.log.validate());
        errors.extend(self.network.validate());
        errors.extend(self.transport.validate());

        match self.role {
            Role::Server => errors.extend(self.listen.validate()),
            Role::Client => {
                errors.extend(self.server.validate());
                if let Ok(server) = self.server.socket_addr() {
                    if server.is_ipv6() && self.network.ipv6.is_none() {
                        errors.push(
                            "server address is IPv6, but the IPv6 interface is not configured"
                                .into(),
                        );
                    }
                    if server.is_ipv4() && self.network.ipv4.is_none() {
                        errors.push(
                            "server address is IPv4, but the IPv4 interface is not configured"
                                .into(),
                        );
                    }
                }
                if self.transport.conn > 1 && self.network.port() != 0 {
                    errors.push(
                        "only one connection is allowed when a client port is explicitly set"
                            .into(),
                    );
                }
                for (i, f) in self.forward.iter().enumerate() {
                    for e in f.validate() {
                        errors.push(format!("forward[{}] {}", i, e));
                    }
                }
            }
        }

        if !errors.is_empty() {
            bail!("validation failed:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
    parse_config(&content)
}

/// Parse configuration from a YAML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config =
        serde_yaml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.set_defaults();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT_YAML: &str = r#"
role: client
server:
  addr: "203.0.113.10:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  conn: 2
  kcp:
    key: "secret"
"#;

    const SERVER_YAML: &str = r#"
role: server
listen:
  addr: "0.0.0.0:443"
network:
  interface: eth0
  ipv4:
    addr: "203.0.113.10:443"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: quic
  quic:
    key: "secret"
"#;

    #[test]
    fn test_parse_client_config() {
        let config = parse_config(CLIENT_YAML).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.transport.conn, 2);
        assert_eq!(config.server.socket_addr().unwrap().port(), 443);
        // IPv4-only raises the default KCP MTU.
        assert_eq!(config.transport.kcp.as_ref().unwrap().mtu, 1440);
    }

    #[test]
    fn test_parse_server_config() {
        let config = parse_config(SERVER_YAML).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.network.port(), 443);
        assert_eq!(config.transport.quic.as_ref().unwrap().alpn, "h3");
    }

    #[test]
    fn test_errors_are_aggregated() {
        let yaml = r#"
role: client
server:
  addr: "bogus"
network:
  interface: ""
transport:
  protocol: kcp
"#;
        let err = parse_config(yaml).unwrap_err().to_string();
        assert!(err.contains("validation failed"));
        assert!(err.contains("interface is required"));
        assert!(err.contains("invalid address 'bogus'"));
        assert!(err.contains("address family"));
    }

    #[test]
    fn test_conn_with_pinned_port_rejected() {
        let yaml = r#"
role: client
server:
  addr: "203.0.113.10:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:40000"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  conn: 4
  kcp:
    key: "secret"
"#;
        let err = parse_config(yaml).unwrap_err().to_string();
        assert!(err.contains("only one connection"));
    }

    #[test]
    fn test_server_family_must_be_configured() {
        let yaml = r#"
role: client
server:
  addr: "[2001:db8::1]:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  kcp:
    key: "secret"
"#;
        let err = parse_config(yaml).unwrap_err().to_string();
        assert!(err.contains("IPv6 interface is not configured"));
    }

    #[test]
    fn test_auto_mode_validation() {
        let yaml = r#"
role: client
server:
  addr: "203.0.113.10:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: auto
  kcp:
    key: "secret"
"#;
        let err = parse_config(yaml).unwrap_err().to_string();
        assert!(err.contains("at least 2 protocol configurations"));
    }

    #[test]
    fn test_ipv6_only_mtu() {
        let yaml = r#"
role: client
server:
  addr: "[2001:db8::9]:443"
network:
  interface: eth0
  ipv6:
    addr: "[2001:db8::1]:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: kcp
  kcp:
    key: "secret"
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.transport.kcp.as_ref().unwrap().mtu, 1420);
    }
}
