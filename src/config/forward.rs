//! Port forwarder configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::tnet::Addr;

/// L4 protocol a forwarder carries.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForwardProtocol {
    /// TCP relay
    #[default]
    #[serde(rename = "tcp")]
    Tcp,
    /// UDP relay with parallel streams
    #[serde(rename = "udp")]
    Udp,
}

/// One local-port-to-tunnel-target forwarding rule.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ForwardConfig {
    /// Local listen address, `ip:port`
    pub listen: String,
    /// Tunnel target, `host:port`
    pub target: String,
    /// L4 protocol
    pub protocol: ForwardProtocol,
    /// Parallel tunnel streams per UDP flow
    pub streams: usize,
}

impl ForwardConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.streams == 0 {
            self.streams = 8;
        }
    }

    /// Parsed listen address.
    pub fn listen_addr(&self) -> Result<SocketAddr, String> {
        self.listen
            .parse()
            .map_err(|_| format!("invalid forward listen address '{}'", self.listen))
    }

    /// Parsed target address.
    pub fn target_addr(&self) -> Result<Addr, String> {
        Addr::parse(&self.target).map_err(|e| e.to_string())
    }

    /// Streams clamped to the supported range.
    pub fn stream_count(&self) -> usize {
        self.streams.clamp(1, 64)
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = self.listen_addr() {
            errors.push(e);
        }
        if let Err(e) = self.target_addr() {
            errors.push(e);
        }
        errors
    }
}
