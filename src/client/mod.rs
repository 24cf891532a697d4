//! Client session core
//!
//! Owns N packet endpoints with their transport connections, dispatches
//! stream opens round-robin across them, keeps them healthy (30s waited
//! pings), watches for network changes (5s polls), and caches UDP streams
//! per flow. In auto mode the probe picks the transport before any real
//! connection is made.

mod conn;
mod dial;
mod iter;
mod netmon;
mod ticker;
mod udp;

pub use iter::RoundRobin;
pub use udp::{flow_key, UdpStrm};

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Protocol};
use crate::error::PaqetError;
use crate::forward;
use crate::protocol::Frame;
use crate::tnet::{Addr, BoxStrm};
use crate::transport;

use conn::TimedConn;
use udp::UdpPool;

/// The client session.
pub struct Client {
    pub(crate) cfg: Arc<Config>,
    pub(crate) conns: RoundRobin<Arc<TimedConn>>,
    pub(crate) udp_pool: UdpPool,
    pub(crate) cancel: CancellationToken,
    protocol: Protocol,
}

impl Client {
    /// Resolve the transport, dial every endpoint, and start the
    /// background loops. Any endpoint failing its initial dial aborts
    /// startup.
    pub async fn start(cfg: Config, cancel: CancellationToken) -> Result<Arc<Self>, PaqetError> {
        let cfg = Arc::new(cfg);
        let server = cfg.server.socket_addr().map_err(PaqetError::Config)?;

        let protocol = match cfg.transport.protocol {
            Protocol::Auto => {
                let best = transport::probe(server, &cfg.transport, &cfg.network).await?;
                tracing::info!("auto-protocol selected: {}", best.name());
                best
            }
            proto => proto,
        };

        let mut conns = Vec::with_capacity(cfg.transport.conn);
        for i in 0..cfg.transport.conn {
            let tc = TimedConn::connect(cfg.clone(), protocol, cancel.clone())
                .await
                .map_err(|e| {
                    tracing::error!("failed to establish connection {}: {}", i + 1, e);
                    e
                })?;
            tracing::debug!("client connection {} established successfully", i + 1);
            conns.push(tc);
        }

        let client = Arc::new(Client {
            cfg: cfg.clone(),
            conns: RoundRobin::new(conns),
            udp_pool: UdpPool::new(),
            cancel: cancel.clone(),
            protocol,
        });

        tokio::spawn(ticker::run(client.clone()));
        tokio::spawn(netmon::run(client.clone()));

        let ipv4 = cfg
            .network
            .ipv4
            .as_ref()
            .map(|a| a.addr.clone())
            .unwrap_or_else(|| "<nil>".into());
        let ipv6 = cfg
            .network
            .ipv6
            .as_ref()
            .map(|a| a.addr.clone())
            .unwrap_or_else(|| "<nil>".into());
        tracing::info!(
            "Client started: IPv4:{} IPv6:{} -> {} ({} connections, protocol: {})",
            ipv4,
            ipv6,
            cfg.server.addr,
            client.conns.len(),
            protocol.name()
        );

        Ok(client)
    }

    /// The transport in use (resolved from auto mode when applicable).
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Open a tunnel stream carrying TCP to `target`.
    pub async fn open_tcp(&self, target: &Addr) -> Result<BoxStrm, PaqetError> {
        let mut strm = self.new_strm().await?;
        if let Err(e) = Frame::Tcp(target.clone()).write(&mut strm).await {
            use tokio::io::AsyncWriteExt;
            let _ = strm.shutdown().await;
            return Err(e.into());
        }
        Ok(strm)
    }

    // Network moved: every cached UDP stream is stale and every endpoint
    // needs a fresh flow.
    pub(crate) fn handle_network_change(&self) {
        self.udp_pool.invalidate_all();
        for tc in self.conns.items() {
            tc.trigger_reconnect();
        }
        tracing::info!("triggered reconnection for all connections");
    }

    /// Shut the session down.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.udp_pool.invalidate_all();
        for tc in self.conns.items() {
            tc.close().await;
        }
        tracing::info!("client shutdown complete");
    }
}

/// Run the client role: session plus the configured forwarders.
pub async fn run(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    if cfg.forward.is_empty() {
        tracing::warn!("client mode enabled but no forward configurations found");
    }

    let client = Client::start(cfg.clone(), shutdown.clone())
        .await
        .context("client startup failed")?;

    for fwd in &cfg.forward {
        forward::spawn(client.clone(), fwd.clone(), shutdown.clone())
            .context("starting forwarder")?;
    }

    shutdown.cancelled().await;
    client.close().await;
    Ok(())
}
