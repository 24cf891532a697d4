//! # paqet - Raw TCP Packet Tunnel
//!
//! Paqet is a bidirectional packet-level tunnel that carries a reliable,
//! stream-multiplexed transport (KCP, QUIC, or a lightweight UDP mux) inside
//! crafted raw TCP packets injected directly at the network interface,
//! bypassing the kernel's TCP/IP stack. The crafted flows mimic ordinary TCP
//! traffic against stateful DPI while applications get in-order, multiplexed,
//! encrypted streams.
//!
//! ## Features
//!
//! - **Raw packet endpoint**: AF_PACKET (mmap ring) or libpcap capture and
//!   injection, with fabricated TCP flow state and kernel RST suppression
//! - **Three transports**: KCP ARQ, QUIC-TLS 1.3, and an AEAD-sealed UDP mux,
//!   all riding the packet endpoint as if it were a UDP socket
//! - **Auto protocol selection**: parallel RTT probe picks the fastest
//!   working transport at startup
//! - **Client session**: connection pool, reconnect loop, health checks,
//!   network-change detection, and a cached UDP stream pool
//! - **Server session**: per-stream TCP/UDP target dialing with a shared UDP
//!   egress pool
//!
//! ## Usage
//!
//! ```rust,ignore
//! use paqet::config::load_config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.yaml")?;
//!     let shutdown = CancellationToken::new();
//!
//!     match config.role {
//!         paqet::config::Role::Client => paqet::client::run(config, shutdown).await,
//!         paqet::config::Role::Server => paqet::server::run(config, shutdown).await,
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! app bytes -> protocol header -> transport mux -> packet endpoint -> NIC
//! ```
//!
//! The reverse path is symmetric. The kernel never sees a real TCP socket;
//! iptables NOTRACK/RST-drop rules keep it from tearing the fake flows down.

#![warn(rust_2018_idioms)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod protocol;
pub mod server;
pub mod socket;
pub mod tnet;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{PaqetError, ProtocolError};

/// Version of the paqet library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "paqet");
    }
}
