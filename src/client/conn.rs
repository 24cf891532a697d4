//! Timed connection: one endpoint plus its reconnect loop
//!
//! Each endpoint slot owns a packet endpoint and a transport connection.
//! A background loop waits for reconnect signals; reconnecting closes the
//! old connection and retries a fresh dial every second until it works.
//! The slot mutex is held only to swap the connection pointer.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, Protocol};
use crate::error::PaqetError;
use crate::protocol::Frame;
use crate::socket::PacketConn;
use crate::tnet::{Conn, DatagramSocket};
use crate::transport;

/// Seconds between reconnect attempts.
const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// One endpoint slot of the client session.
pub(crate) struct TimedConn {
    cfg: Arc<Config>,
    protocol: Protocol,
    conn: Mutex<Option<Arc<dyn Conn>>>,
    reconnect_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl TimedConn {
    /// Dial the initial connection and start the reconnect loop.
    ///
    /// A failed initial dial is fatal: the client refuses to start with a
    /// dead endpoint.
    pub(crate) async fn connect(
        cfg: Arc<Config>,
        protocol: Protocol,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, PaqetError> {
        let conn = create_conn(&cfg, protocol).await?;

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let tc = Arc::new(TimedConn {
            cfg,
            protocol,
            conn: Mutex::new(Some(conn)),
            reconnect_tx,
            cancel,
        });

        tokio::spawn(reconnect_loop(tc.clone(), reconnect_rx));
        Ok(tc)
    }

    /// The current connection, if one is up.
    pub(crate) fn conn(&self) -> Option<Arc<dyn Conn>> {
        self.conn.lock().clone()
    }

    /// Signal the reconnect loop. Signals coalesce while a reconnect is in
    /// flight.
    pub(crate) fn trigger_reconnect(&self) {
        if self.reconnect_tx.try_send(()).is_ok() {
            tracing::debug!("reconnect triggered");
        }
    }

    /// Close the slot and its connection.
    pub(crate) async fn close(&self) {
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }
}

async fn reconnect_loop(tc: Arc<TimedConn>, mut reconnect_rx: mpsc::Receiver<()>) {
    loop {
        tokio::select! {
            _ = tc.cancel.cancelled() => return,
            signal = reconnect_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }

        // Tear the old connection down before dialing anew.
        let old = tc.conn.lock().take();
        if let Some(old) = old {
            old.close().await;
        }
        tracing::info!("reconnecting...");

        loop {
            if tc.cancel.is_cancelled() {
                return;
            }
            match create_conn(&tc.cfg, tc.protocol).await {
                Ok(conn) => {
                    *tc.conn.lock() = Some(conn);
                    tracing::info!("reconnected successfully");
                    break;
                }
                Err(e) => {
                    tracing::warn!("reconnect failed: {}, retrying", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}

// Dial one fresh endpoint + transport connection and advertise the TCP
// fingerprint cycle.
async fn create_conn(cfg: &Config, protocol: Protocol) -> Result<Arc<dyn Conn>, PaqetError> {
    let server = cfg
        .server
        .socket_addr()
        .map_err(PaqetError::Config)?;

    let pconn = PacketConn::new(&cfg.network)?;
    let sock: Arc<dyn DatagramSocket> = Arc::new(pconn.clone());

    let tagged = cfg.transport.protocol == Protocol::Auto;
    let conn = match transport::dial_proto(protocol, server, &cfg.transport, sock, tagged).await
    {
        Ok(conn) => conn,
        Err(e) => {
            pconn.close().await;
            return Err(e);
        }
    };
    let conn: Arc<dyn Conn> = Arc::from(conn);

    if let Err(e) = send_tcpf(cfg, conn.as_ref()).await {
        conn.close().await;
        return Err(e);
    }

    Ok(conn)
}

// Tell the server which flag cycle to use towards us.
async fn send_tcpf(cfg: &Config, conn: &dyn Conn) -> Result<(), PaqetError> {
    let profiles = cfg.network.tcp.profiles().map_err(PaqetError::Config)?;
    let mut strm = conn.open_strm().await?;
    Frame::Tcpf(profiles).write(&mut strm).await?;
    use tokio::io::AsyncWriteExt;
    let _ = strm.shutdown().await;
    Ok(())
}
