//! Async KCP session
//!
//! Drives the [`Kcp`] state machine with two tasks: an input task feeding
//! received datagrams into the machine and a ticker flushing due segments
//! onto the wire at the configured interval. Readers and writers park on
//! notifies instead of polling.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::core::Kcp;
use crate::config::KcpConfig;
use crate::error::PaqetError;
use crate::tnet::io::PacketIo;
use crate::tnet::mux::SessionIo;

/// An established KCP conversation over a packet substrate.
pub struct KcpSession {
    kcp: Mutex<Kcp>,
    io: Arc<dyn PacketIo>,
    leftover: Mutex<Vec<u8>>,
    read_notify: Notify,
    write_notify: Notify,
    cancel: CancellationToken,
}

impl KcpSession {
    /// Create and start a session.
    ///
    /// `initial` is the first datagram for server-side sessions, whose
    /// conversation id was already peeked by the listener.
    pub fn new(
        conv: u32,
        cfg: &KcpConfig,
        io: Arc<dyn PacketIo>,
        initial: Option<&[u8]>,
    ) -> Result<Arc<Self>, PaqetError> {
        let (nodelay, interval, resend, nc) =
            cfg.mode_params().map_err(PaqetError::Config)?;

        let mut kcp = Kcp::new(conv);
        kcp.set_mtu(cfg.mtu);
        kcp.set_wndsize(cfg.sndwnd, cfg.rcvwnd);
        kcp.set_nodelay(nodelay, interval, resend.max(0) as u32, nc);
        if let Some(pkt) = initial {
            kcp.input(pkt)
                .map_err(|e| PaqetError::Transport(format!("bad first KCP packet: {:?}", e)))?;
        }

        let session = Arc::new(KcpSession {
            kcp: Mutex::new(kcp),
            io,
            leftover: Mutex::new(Vec::new()),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
            cancel: CancellationToken::new(),
        });
        session.start();
        Ok(session)
    }

    /// Stop the session tasks. The ticker closes the packet IO on exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.read_notify.notify_waiters();
        self.write_notify.notify_waiters();
    }

    /// Whether the session has stopped.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn start(self: &Arc<Self>) {
        // Input: substrate -> state machine.
        let s = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = tokio::select! {
                    _ = s.cancel.cancelled() => break,
                    res = s.io.recv_packet(&mut buf) => match res {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!("kcp substrate read ended: {}", e);
                            break;
                        }
                    },
                };
                {
                    let mut kcp = s.kcp.lock();
                    if kcp.input(&buf[..n]).is_err() {
                        continue; // stray datagram
                    }
                }
                s.read_notify.notify_waiters();
                s.write_notify.notify_waiters();
            }
            s.shutdown();
        });

        // Ticker: clock the machine and put due segments on the wire.
        let s = self.clone();
        tokio::spawn(async move {
            let interval_ms = s.kcp.lock().interval();
            let epoch = tokio::time::Instant::now();
            let mut ticker =
                tokio::time::interval(Duration::from_millis(interval_ms as u64));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = s.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let (packets, dead, can_send) = {
                    let mut kcp = s.kcp.lock();
                    kcp.update(epoch.elapsed().as_millis() as u32);
                    (kcp.flush(), kcp.is_dead(), kcp.send_ready())
                };
                let mut failed = false;
                for pkt in &packets {
                    if let Err(e) = s.io.send_packet(pkt) {
                        tracing::debug!("kcp substrate write failed: {}", e);
                        failed = true;
                        break;
                    }
                }
                if dead {
                    tracing::warn!("kcp conversation dead (peer stopped acking)");
                }
                if dead || failed {
                    break;
                }
                if can_send {
                    s.write_notify.notify_waiters();
                }
            }
            s.shutdown();
            s.io.close();
        });
    }
}

#[async_trait]
impl SessionIo for KcpSession {
    async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.read_notify.notified();
            {
                let mut leftover = self.leftover.lock();
                if !leftover.is_empty() {
                    let n = leftover.len().min(buf.len());
                    buf[..n].copy_from_slice(&leftover[..n]);
                    leftover.drain(..n);
                    return Ok(n);
                }
                let mut kcp = self.kcp.lock();
                if let Some(data) = kcp.recv() {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        leftover.extend_from_slice(&data[n..]);
                    }
                    return Ok(n);
                }
            }
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            notified.await;
        }
    }

    async fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
        loop {
            let notified = self.write_notify.notified();
            {
                let mut kcp = self.kcp.lock();
                if kcp.send_ready() {
                    kcp.send(buf);
                    return Ok(());
                }
            }
            if self.cancel.is_cancelled() {
                return Err(io::ErrorKind::NotConnected.into());
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn local_addr(&self) -> SocketAddr {
        self.io.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.io.peer_addr())
    }
}
