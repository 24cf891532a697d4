//! Transport configuration types
//!
//! Defines configuration for the three tunnel transports (KCP, QUIC, UDP
//! mux) and the auto-selection mode.

use serde::{Deserialize, Serialize};

use super::crypto;

/// Transport protocol selection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// KCP ARQ with stream mux
    #[default]
    #[serde(rename = "kcp")]
    Kcp,
    /// QUIC-TLS 1.3
    #[serde(rename = "quic")]
    Quic,
    /// AEAD-sealed UDP with stream mux
    #[serde(rename = "udp")]
    Udp,
    /// Probe configured transports and pick the fastest
    #[serde(rename = "auto")]
    Auto,
}

impl Protocol {
    /// The 1-byte packet tag used to demultiplex transports in auto mode.
    pub fn tag(&self) -> Option<u8> {
        match self {
            Protocol::Kcp => Some(0x10),
            Protocol::Quic => Some(0x20),
            Protocol::Udp => Some(0x30),
            Protocol::Auto => None,
        }
    }

    /// Protocol name as it appears in configuration and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Kcp => "kcp",
            Protocol::Quic => "quic",
            Protocol::Udp => "udp",
            Protocol::Auto => "auto",
        }
    }
}

/// KCP transport configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KcpConfig {
    /// Mode preset: fast | fast2 | fast3 | fast4 | normal | manual
    pub mode: String,
    /// Key passphrase; expanded with PBKDF2 before use
    pub key: String,
    /// Block cipher name (see [`crypto::VALID_BLOCKS`])
    pub block: String,
    /// KCP MTU; defaults to 1400, raised for single-family configs
    pub mtu: usize,
    /// Send window in segments
    pub sndwnd: u32,
    /// Receive window in segments
    pub rcvwnd: u32,
    /// Mux session receive buffer in bytes
    pub smuxbuf: usize,
    /// Mux per-stream receive buffer in bytes
    pub streambuf: usize,
    /// Manual mode: nodelay flag
    pub nodelay: Option<bool>,
    /// Manual mode: internal update interval in milliseconds
    pub interval: Option<u32>,
    /// Manual mode: fast resend threshold
    pub resend: Option<i32>,
    /// Manual mode: disable congestion control
    pub nc: Option<bool>,
}

impl KcpConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.mode.is_empty() {
            self.mode = "fast3".into();
        }
        if self.block.is_empty() {
            self.block = "aes".into();
        }
        if self.mtu == 0 {
            self.mtu = 1400;
        }
        if self.sndwnd == 0 {
            self.sndwnd = 1024;
        }
        if self.rcvwnd == 0 {
            self.rcvwnd = 1024;
        }
        if self.smuxbuf == 0 {
            self.smuxbuf = 8 * 1024 * 1024;
        }
        if self.streambuf == 0 {
            self.streambuf = 4 * 1024 * 1024;
        }
    }

    /// Resolve the mode preset to `(nodelay, interval, resend, nc)`.
    pub fn mode_params(&self) -> Result<(bool, u32, i32, bool), String> {
        match self.mode.as_str() {
            "normal" => Ok((false, 40, 2, true)),
            "fast" => Ok((false, 30, 2, true)),
            "fast2" => Ok((true, 20, 2, true)),
            "fast3" => Ok((true, 10, 2, true)),
            "fast4" => Ok((true, 5, 2, true)),
            "manual" => Ok((
                self.nodelay.unwrap_or(false),
                self.interval.unwrap_or(40),
                self.resend.unwrap_or(0),
                self.nc.unwrap_or(false),
            )),
            other => Err(format!(
                "KCP mode must be one of fast, fast2, fast3, fast4, normal, manual; got '{}'",
                other
            )),
        }
    }

    /// The derived and trimmed packet key, or `None` without encryption.
    pub fn packet_key(&self) -> Option<Vec<u8>> {
        if crypto::is_null_block(&self.block) || self.key.is_empty() {
            return None;
        }
        let dkey = crypto::derive_key(&self.key);
        Some(crypto::trim_key(&dkey, &self.block))
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = self.mode_params() {
            errors.push(e);
        }
        if let Err(e) = crypto::validate_block_and_key(&self.block, &self.key) {
            errors.push(format!("KCP: {}", e));
        }
        if self.mtu < 50 || self.mtu > 1500 {
            errors.push(format!("KCP mtu must be between 50-1500, got {}", self.mtu));
        }
        if self.smuxbuf < 1024 {
            errors.push("KCP smuxbuf must be >= 1024 bytes".into());
        }
        if self.streambuf < 1024 {
            errors.push("KCP streambuf must be >= 1024 bytes".into());
        }
        errors
    }
}

fn default_idle_timeout() -> u64 {
    30
}

/// QUIC transport configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QuicConfig {
    /// Shared key; both ends derive the identical certificate from it
    pub key: String,
    /// TLS certificate file (alternative to `key`)
    pub cert_file: String,
    /// TLS private key file (goes with `cert_file`)
    pub key_file: String,
    /// ALPN protocol
    pub alpn: String,
    /// Maximum concurrent bidirectional streams
    pub max_streams: u32,
    /// Idle timeout in seconds
    pub idle_timeout: u64,
    /// Initial per-stream flow-control window in bytes
    pub initial_stream_window: u64,
    /// Maximum per-stream flow-control window in bytes
    pub max_stream_window: u64,
    /// Initial connection flow-control window in bytes
    pub initial_conn_window: u64,
    /// Maximum connection flow-control window in bytes
    pub max_conn_window: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        QuicConfig {
            key: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            alpn: String::new(),
            max_streams: 0,
            idle_timeout: 0,
            initial_stream_window: 0,
            max_stream_window: 0,
            initial_conn_window: 0,
            max_conn_window: 0,
        }
    }
}

impl QuicConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.alpn.is_empty() {
            self.alpn = "h3".into();
        }
        if self.max_streams == 0 {
            self.max_streams = 256;
        }
        if self.idle_timeout == 0 {
            self.idle_timeout = default_idle_timeout();
        }
        if self.initial_stream_window == 0 {
            self.initial_stream_window = 4 * 1024 * 1024;
        }
        if self.max_stream_window == 0 {
            self.max_stream_window = 8 * 1024 * 1024;
        }
        if self.initial_conn_window == 0 {
            self.initial_conn_window = 8 * 1024 * 1024;
        }
        if self.max_conn_window == 0 {
            self.max_conn_window = 16 * 1024 * 1024;
        }
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.key.is_empty() && self.cert_file.is_empty() {
            errors.push("QUIC: key or cert_file/key_file is required".into());
        }
        if self.max_streams < 1 || self.max_streams > 65535 {
            errors.push("QUIC: max_streams must be between 1-65535".into());
        }
        if self.idle_timeout < 1 || self.idle_timeout > 300 {
            errors.push("QUIC: idle_timeout must be between 1s-5m".into());
        }
        if self.cert_file.is_empty() != self.key_file.is_empty() {
            errors.push("QUIC: both cert_file and key_file must be set, or neither".into());
        }
        errors
    }
}

/// UDP mux transport configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct UdpConfig {
    /// Key passphrase; expanded with PBKDF2 before use
    pub key: String,
    /// Block cipher name
    pub block: String,
    /// Mux session receive buffer in bytes
    pub smuxbuf: usize,
    /// Mux per-stream receive buffer in bytes
    pub streambuf: usize,
}

impl UdpConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.block.is_empty() {
            self.block = "aes".into();
        }
        if self.smuxbuf == 0 {
            self.smuxbuf = 8 * 1024 * 1024;
        }
        if self.streambuf == 0 {
            self.streambuf = 4 * 1024 * 1024;
        }
    }

    /// The derived and trimmed packet key, or `None` without encryption.
    pub fn packet_key(&self) -> Option<Vec<u8>> {
        if crypto::is_null_block(&self.block) || self.key.is_empty() {
            return None;
        }
        let dkey = crypto::derive_key(&self.key);
        Some(crypto::trim_key(&dkey, &self.block))
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = crypto::validate_block_and_key(&self.block, &self.key) {
            errors.push(format!("UDP: {}", e));
        }
        if self.smuxbuf < 1024 {
            errors.push("UDP smuxbuf must be >= 1024 bytes".into());
        }
        if self.streambuf < 1024 {
            errors.push("UDP streambuf must be >= 1024 bytes".into());
        }
        errors
    }
}

/// Main transport configuration.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport protocol
    pub protocol: Protocol,
    /// Number of parallel packet endpoints and transport connections
    pub conn: usize,
    /// KCP configuration
    pub kcp: Option<KcpConfig>,
    /// QUIC configuration
    pub quic: Option<QuicConfig>,
    /// UDP configuration
    pub udp: Option<UdpConfig>,
}

impl TransportConfig {
    pub(crate) fn set_defaults(&mut self) {
        if self.conn == 0 {
            self.conn = 1;
        }
        match self.protocol {
            Protocol::Kcp => {
                self.kcp.get_or_insert_with(KcpConfig::default).set_defaults();
            }
            Protocol::Quic => {
                self.quic.get_or_insert_with(QuicConfig::default).set_defaults();
            }
            Protocol::Udp => {
                self.udp.get_or_insert_with(UdpConfig::default).set_defaults();
            }
            Protocol::Auto => {
                // Auto mode fills defaults only for the protocols actually
                // configured; validation requires at least two.
                if let Some(kcp) = &mut self.kcp {
                    kcp.set_defaults();
                }
                if let Some(quic) = &mut self.quic {
                    quic.set_defaults();
                }
                if let Some(udp) = &mut self.udp {
                    udp.set_defaults();
                }
            }
        }
    }

    /// The protocols configured for auto mode, in probe order.
    pub fn auto_candidates(&self) -> Vec<Protocol> {
        let mut out = Vec::new();
        if self.kcp.is_some() {
            out.push(Protocol::Kcp);
        }
        if self.quic.is_some() {
            out.push(Protocol::Quic);
        }
        if self.udp.is_some() {
            out.push(Protocol::Udp);
        }
        out
    }

    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.conn < 1 || self.conn > 256 {
            errors.push("transport conn must be between 1-256 connections".into());
        }

        match self.protocol {
            Protocol::Kcp => match &self.kcp {
                Some(kcp) => errors.extend(kcp.validate()),
                None => errors.push("KCP configuration is required when protocol is 'kcp'".into()),
            },
            Protocol::Quic => match &self.quic {
                Some(quic) => errors.extend(quic.validate()),
                None => {
                    errors.push("QUIC configuration is required when protocol is 'quic'".into())
                }
            },
            Protocol::Udp => match &self.udp {
                Some(udp) => errors.extend(udp.validate()),
                None => errors.push("UDP configuration is required when protocol is 'udp'".into()),
            },
            Protocol::Auto => {
                let mut configured = 0;
                if let Some(kcp) = &self.kcp {
                    configured += 1;
                    errors.extend(kcp.validate());
                }
                if let Some(quic) = &self.quic {
                    configured += 1;
                    errors.extend(quic.validate());
                }
                if let Some(udp) = &self.udp {
                    configured += 1;
                    errors.extend(udp.validate());
                }
                if configured < 2 {
                    errors.push(
                        "auto mode requires at least 2 protocol configurations (kcp, quic, udp)"
                            .into(),
                    );
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_kcp() {
        let mut tr = TransportConfig {
            protocol: Protocol::Kcp,
            ..Default::default()
        };
        tr.set_defaults();
        assert_eq!(tr.conn, 1);
        let kcp = tr.kcp.as_ref().unwrap();
        assert_eq!(kcp.mode, "fast3");
        assert_eq!(kcp.block, "aes");
        assert_eq!(kcp.mtu, 1400);
    }

    #[test]
    fn test_defaults_quic() {
        let mut tr = TransportConfig {
            protocol: Protocol::Quic,
            ..Default::default()
        };
        tr.set_defaults();
        let quic = tr.quic.as_ref().unwrap();
        assert_eq!(quic.alpn, "h3");
        assert_eq!(quic.max_streams, 256);
        assert_eq!(quic.idle_timeout, 30);
        assert_eq!(quic.initial_stream_window, 4 * 1024 * 1024);
        assert_eq!(quic.max_conn_window, 16 * 1024 * 1024);
    }

    #[test]
    fn test_defaults_udp() {
        let mut tr = TransportConfig {
            protocol: Protocol::Udp,
            ..Default::default()
        };
        tr.set_defaults();
        let udp = tr.udp.as_ref().unwrap();
        assert_eq!(udp.block, "aes");
        assert_eq!(udp.smuxbuf, 8 * 1024 * 1024);
    }

    #[test]
    fn test_conn_bounds() {
        for conn in [0usize, 257] {
            let mut tr = TransportConfig {
                protocol: Protocol::Kcp,
                conn,
                kcp: Some(KcpConfig {
                    key: "k".into(),
                    ..Default::default()
                }),
                ..Default::default()
            };
            tr.set_defaults();
            if conn == 0 {
                // Zero means unset and defaults to 1.
                assert!(tr.validate().is_empty());
            } else {
                assert!(tr
                    .validate()
                    .iter()
                    .any(|e| e.contains("between 1-256")));
            }
        }
    }

    #[test]
    fn test_quic_bounds() {
        let mut quic = QuicConfig {
            key: "k".into(),
            ..Default::default()
        };
        quic.set_defaults();
        assert!(quic.validate().is_empty());

        quic.max_streams = 70000;
        assert!(quic.validate().iter().any(|e| e.contains("max_streams")));
        quic.max_streams = 256;

        quic.idle_timeout = 301;
        assert!(quic.validate().iter().any(|e| e.contains("idle_timeout")));
        quic.idle_timeout = 0;
        assert!(!quic.validate().is_empty());
    }

    #[test]
    fn test_auto_requires_two() {
        let mut tr = TransportConfig {
            protocol: Protocol::Auto,
            kcp: Some(KcpConfig {
                key: "k".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        tr.set_defaults();
        assert!(tr
            .validate()
            .iter()
            .any(|e| e.contains("at least 2 protocol configurations")));

        tr.quic = Some(QuicConfig {
            key: "k".into(),
            ..Default::default()
        });
        tr.set_defaults();
        assert!(tr.validate().is_empty());
        assert_eq!(
            tr.auto_candidates(),
            vec![Protocol::Kcp, Protocol::Quic]
        );
    }

    #[test]
    fn test_block_requires_key() {
        let mut kcp = KcpConfig::default();
        kcp.set_defaults();
        assert!(kcp.validate().iter().any(|e| e.contains("key is required")));

        kcp.block = "none".into();
        assert!(kcp.validate().is_empty());
        assert!(kcp.packet_key().is_none());
    }

    #[test]
    fn test_mode_params() {
        let mut kcp = KcpConfig {
            mode: "fast3".into(),
            ..Default::default()
        };
        assert_eq!(kcp.mode_params().unwrap(), (true, 10, 2, true));

        kcp.mode = "normal".into();
        assert_eq!(kcp.mode_params().unwrap(), (false, 40, 2, true));

        kcp.mode = "manual".into();
        kcp.nodelay = Some(true);
        kcp.interval = Some(15);
        kcp.resend = Some(1);
        kcp.nc = Some(true);
        assert_eq!(kcp.mode_params().unwrap(), (true, 15, 1, true));

        kcp.mode = "warp".into();
        assert!(kcp.mode_params().is_err());
    }

    #[test]
    fn test_protocol_tags() {
        assert_eq!(Protocol::Kcp.tag(), Some(0x10));
        assert_eq!(Protocol::Quic.tag(), Some(0x20));
        assert_eq!(Protocol::Udp.tag(), Some(0x30));
        assert_eq!(Protocol::Auto.tag(), None);
    }
}
