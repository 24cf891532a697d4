//! Network and capture configuration
//!
//! Names the interface the raw endpoint attaches to, the local address and
//! gateway MAC per address family, the capture backend, and the TCP
//! fingerprint profile cycle.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::protocol::TcpFlags;

/// Capture backend selection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum PcapBackend {
    /// AF_PACKET first, libpcap as fallback when compiled in
    #[default]
    #[serde(rename = "auto")]
    Auto,
    /// libpcap capture library (requires the `pcap` cargo feature)
    #[serde(rename = "pcap")]
    Pcap,
    /// AF_PACKET memory-mapped ring (Linux only)
    #[serde(rename = "afpacket")]
    Afpacket,
}

/// Capture ring configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PcapConfig {
    /// Backend selection
    pub backend: PcapBackend,
    /// Capture buffer size in bytes; sizes the AF_PACKET ring block count
    pub sockbuf: usize,
}

impl PcapConfig {
    pub(crate) fn set_defaults(&mut self, role: super::Role) {
        if self.sockbuf == 0 {
            self.sockbuf = match role {
                // High-throughput server gets the bigger ring.
                super::Role::Server => 16 * 1024 * 1024,
                super::Role::Client => 8 * 1024 * 1024,
            };
        }
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        #[cfg(not(feature = "pcap"))]
        if self.backend == PcapBackend::Pcap {
            errors.push("backend 'pcap' requires building with the 'pcap' feature".into());
        }
        #[cfg(not(target_os = "linux"))]
        if self.backend == PcapBackend::Afpacket {
            errors.push("backend 'afpacket' is only available on Linux".into());
        }

        if self.sockbuf < 1024 {
            errors.push("pcap sockbuf must be >= 1024 bytes".into());
        }
        if self.sockbuf > 100 * 1024 * 1024 {
            errors.push("pcap sockbuf too large (max 100MB)".into());
        }
        errors
    }
}

/// One address family of the endpoint: local address and gateway MAC.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AddrConfig {
    /// Local `ip:port` the endpoint claims; port 0 picks a random one
    pub addr: String,
    /// MAC address of the next-hop router, colon-separated hex
    pub router_mac: String,
}

impl AddrConfig {
    /// Parse the configured local address.
    pub fn socket_addr(&self) -> Result<SocketAddr, String> {
        self.addr
            .parse()
            .map_err(|_| format!("invalid address '{}'", self.addr))
    }

    /// Parse the configured router MAC.
    pub fn router(&self) -> Result<[u8; 6], String> {
        parse_mac(&self.router_mac).ok_or_else(|| {
            format!("invalid router MAC address '{}'", self.router_mac)
        })
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = self.socket_addr() {
            errors.push(e);
        }
        if self.router_mac.is_empty() {
            errors.push("router MAC address is required".into());
        } else if let Err(e) = self.router() {
            errors.push(e);
        }
        errors
    }
}

/// Parse a colon- or hyphen-separated MAC address.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(|c| c == ':' || c == '-');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// TCP fingerprint configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TcpConfig {
    /// Flag-profile cycle advertised to the peer and used for local egress,
    /// e.g. `["psh+ack", "ack"]`
    pub rf: Vec<String>,
}

impl TcpConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.rf.is_empty() {
            self.rf = vec!["psh+ack".into(), "ack".into()];
        }
    }

    /// Parse the configured cycle into flag profiles.
    pub fn profiles(&self) -> Result<Vec<TcpFlags>, String> {
        self.rf.iter().map(|s| parse_profile(s)).collect()
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        match self.profiles() {
            Ok(_) => Vec::new(),
            Err(e) => vec![e],
        }
    }
}

fn parse_profile(s: &str) -> Result<TcpFlags, String> {
    let mut flags = TcpFlags::default();
    for part in s.split('+') {
        match part.trim().to_ascii_lowercase().as_str() {
            "fin" => flags.fin = true,
            "syn" => flags.syn = true,
            "rst" => flags.rst = true,
            "psh" => flags.psh = true,
            "ack" => flags.ack = true,
            "urg" => flags.urg = true,
            "ece" => flags.ece = true,
            "cwr" => flags.cwr = true,
            "ns" => flags.ns = true,
            other => return Err(format!("unknown TCP flag '{}' in profile '{}'", other, s)),
        }
    }
    Ok(flags)
}

/// Network configuration: interface, addresses, capture, fingerprint.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface name the raw endpoint attaches to
    pub interface: String,
    /// IPv4 address family configuration
    pub ipv4: Option<AddrConfig>,
    /// IPv6 address family configuration
    pub ipv6: Option<AddrConfig>,
    /// Capture backend configuration
    pub pcap: PcapConfig,
    /// TCP fingerprint configuration
    pub tcp: TcpConfig,
}

impl NetworkConfig {
    pub(crate) fn set_defaults(&mut self, role: super::Role) {
        self.pcap.set_defaults(role);
        self.tcp.set_defaults();
    }

    /// The endpoint port from whichever family is configured.
    ///
    /// Validation guarantees the families agree when both are present.
    pub fn port(&self) -> u16 {
        self.ipv4
            .as_ref()
            .and_then(|a| a.socket_addr().ok())
            .or_else(|| self.ipv6.as_ref().and_then(|a| a.socket_addr().ok()))
            .map(|sa| sa.port())
            .unwrap_or(0)
    }

    /// Whether only IPv4 is configured.
    pub fn ipv4_only(&self) -> bool {
        self.ipv4.is_some() && self.ipv6.is_none()
    }

    /// Whether only IPv6 is configured.
    pub fn ipv6_only(&self) -> bool {
        self.ipv6.is_some() && self.ipv4.is_none()
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.interface.is_empty() {
            errors.push("network interface is required".into());
        }
        if self.interface.len() > 15 {
            errors.push(format!(
                "network interface name too long (max 15 characters): '{}'",
                self.interface
            ));
        }

        if self.ipv4.is_none() && self.ipv6.is_none() {
            errors.push("at least one address family (IPv4 or IPv6) must be configured".into());
            return errors;
        }
        if let Some(v4) = &self.ipv4 {
            errors.extend(v4.validate());
            if let Ok(sa) = v4.socket_addr() {
                if !sa.is_ipv4() {
                    errors.push(format!("ipv4.addr '{}' is not an IPv4 address", v4.addr));
                }
            }
        }
        if let Some(v6) = &self.ipv6 {
            errors.extend(v6.validate());
            if let Ok(sa) = v6.socket_addr() {
                if !sa.is_ipv6() {
                    errors.push(format!("ipv6.addr '{}' is not an IPv6 address", v6.addr));
                }
            }
        }
        if let (Some(v4), Some(v6)) = (&self.ipv4, &self.ipv6) {
            if let (Ok(a4), Ok(a6)) = (v4.socket_addr(), v6.socket_addr()) {
                if a4.port() != a6.port() {
                    errors.push(format!(
                        "IPv4 port ({}) and IPv6 port ({}) must match when both are configured",
                        a4.port(),
                        a6.port()
                    ));
                }
            }
        }

        errors.extend(self.pcap.validate());
        errors.extend(self.tcp.validate());
        errors
    }
}
