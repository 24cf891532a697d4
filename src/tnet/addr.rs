//! Tunnel address type
//!
//! A host:port pair where the host may be an IP address or a hostname.
//! Hostnames are carried verbatim through the tunnel and resolved on the
//! server side, so the client needs no DNS for forwarded targets.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::error::PaqetError;

/// A tunnel target address: IP or hostname, plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Addr {
    /// Host part: IPv4/IPv6 literal or hostname
    pub host: String,
    /// Port number
    pub port: u16,
}

impl Addr {
    /// Parse an address from a `host:port` string.
    ///
    /// Accepts `1.2.3.4:80`, `[::1]:80`, and `example.com:80` forms.
    pub fn parse(s: &str) -> Result<Self, PaqetError> {
        // IPv6 literals come bracketed; SocketAddr handles those directly.
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Ok(Addr {
                host: sa.ip().to_string(),
                port: sa.port(),
            });
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PaqetError::Config(format!("invalid address '{}': missing port", s)))?;
        if host.is_empty() {
            return Err(PaqetError::Config(format!(
                "invalid address '{}': empty host",
                s
            )));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| PaqetError::Config(format!("invalid address '{}': bad port", s)))?;

        Ok(Addr {
            host: host.to_string(),
            port,
        })
    }

    /// The host parsed as an IP address, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Convert to a `SocketAddr` when the host is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(sa: SocketAddr) -> Self {
        Addr {
            host: sa.ip().to_string(),
            port: sa.port(),
        }
    }
}
