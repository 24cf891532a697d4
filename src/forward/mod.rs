//! L4 port forwarders
//!
//! Expose local TCP/UDP listeners whose traffic rides tunnel streams. TCP
//! pipes one connection per stream; UDP fans each client flow out over N
//! parallel uncached streams.

mod tcp;
mod udp;

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::{ForwardConfig, ForwardProtocol};

/// Start one forwarder in the background.
pub fn spawn(
    client: Arc<Client>,
    cfg: ForwardConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let listen = cfg
        .listen_addr()
        .map_err(|e| anyhow::anyhow!("forward listen: {}", e))?;
    let target = cfg
        .target_addr()
        .map_err(|e| anyhow::anyhow!("forward target: {}", e))?;

    match cfg.protocol {
        ForwardProtocol::Tcp => {
            tokio::spawn(tcp::run(client, listen, target, cancel));
        }
        ForwardProtocol::Udp => {
            tokio::spawn(udp::run(client, listen, target, cfg.stream_count(), cancel));
        }
    }
    Ok(())
}
