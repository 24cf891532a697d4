//! Periodic connection health checks

use std::sync::Arc;
use std::time::Duration;

use crate::tnet::Conn;

use super::Client;

/// Interval between health check sweeps.
pub(crate) const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) async fn run(client: Arc<Client>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a freshly started
    // client is not re-probed right after dialing.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        health_check(&client).await;
    }
}

// Waited pings across the pool; failures kick the slot into reconnect.
async fn health_check(client: &Client) {
    for (i, tc) in client.conns.items().iter().enumerate() {
        let Some(conn) = tc.conn() else {
            continue;
        };
        if let Err(e) = conn.ping(true).await {
            tracing::warn!("connection {} health check failed: {}", i + 1, e);
            tc.trigger_reconnect();
        }
    }
}
