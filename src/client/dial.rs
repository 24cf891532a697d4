//! Stream creation with retry and backoff

use std::time::Duration;

use crate::error::PaqetError;
use crate::tnet::{BoxStrm, Conn};

use super::Client;

/// Attempts before a stream open is reported as failed.
const MAX_RETRIES: u32 = 10;
/// Backoff base; doubles per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(5);

fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(16))
        .min(BACKOFF_CAP)
}

impl Client {
    // Pick the next connection round-robin and probe it cheaply. A failed
    // probe kicks the slot into reconnect and reports the failure; the
    // caller retries on another slot.
    pub(crate) async fn new_conn(&self) -> Result<std::sync::Arc<dyn Conn>, PaqetError> {
        let tc = self.conns.next();
        let Some(conn) = tc.conn() else {
            tc.trigger_reconnect();
            return Err(PaqetError::Connection("connection is down".into()));
        };
        // Ping without waiting: proves the session still accepts streams
        // without paying a round trip.
        if let Err(e) = conn.ping(false).await {
            tracing::info!("connection lost, retrying....");
            tc.trigger_reconnect();
            return Err(e);
        }
        Ok(conn)
    }

    /// Open a stream on a healthy connection, retrying with exponential
    /// backoff across the pool.
    pub(crate) async fn new_strm(&self) -> Result<BoxStrm, PaqetError> {
        for attempt in 0..MAX_RETRIES {
            let conn = match self.new_conn().await {
                Ok(conn) => conn,
                Err(_) => {
                    tracing::debug!(
                        "session creation failed (attempt {}/{}), retrying",
                        attempt + 1,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };
            match conn.open_strm().await {
                Ok(strm) => return Ok(strm),
                Err(e) => {
                    tracing::debug!(
                        "failed to open stream (attempt {}/{}), retrying: {}",
                        attempt + 1,
                        MAX_RETRIES,
                        e
                    );
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
        Err(PaqetError::Connection(format!(
            "failed to create stream after {} attempts",
            MAX_RETRIES
        )))
    }
}
