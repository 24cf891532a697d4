//! Raw packet socket core
//!
//! [`PacketConn`] is a datagram-shaped endpoint over a raw capture/inject
//! handle: transports use it as if it were a UDP socket while every
//! datagram actually travels inside a crafted TCP packet. The module also
//! houses the capture backends, the BPF filter compiler, the packet
//! crafting and decoding engines, and the kernel guard rules.

#[cfg(target_os = "linux")]
mod afpacket;
pub mod bpf;
mod fingerprint;
mod guard;
mod handle;
#[cfg(feature = "pcap")]
mod pcap;
mod recv;
mod send;

pub use fingerprint::{FlowState, PacketFingerprint, MSS};
pub use guard::IptablesGuard;
pub use handle::{Direction, RawHandle, RawInject, RawRead};
pub use send::SendEngine;

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::error::PaqetError;
use crate::protocol::TcpFlags;

/// Inbound queue depth. Bursts beyond it are dropped like any other UDP
/// overflow; the transports above recover.
const RECV_QUEUE: usize = 1024;

/// How long `close` waits for the reader task to observe cancellation
/// before giving up on the join.
const CLOSE_DRAIN: Duration = Duration::from_millis(500);

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "packet endpoint closed")
}

/// A datagram-shaped endpoint over crafted raw TCP packets.
pub struct PacketConn {
    port: u16,
    local_addr: SocketAddr,
    engine: Arc<SendEngine>,
    rx: parking_lot::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    read_deadline: AtomicI64,
    write_deadline: AtomicI64,
    cancel: CancellationToken,
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    guard: IptablesGuard,
    closed: AtomicBool,
}

impl PacketConn {
    /// Open an endpoint on the configured interface.
    ///
    /// The port is fixed for the lifetime of the endpoint: the configured
    /// one, or a random port in 32768-65535 when unset. Guard rules are
    /// installed before capture starts so no early packet is answered by
    /// the kernel.
    pub fn new(cfg: &NetworkConfig) -> Result<Arc<Self>, PaqetError> {
        let mut port = cfg.port();
        if port == 0 {
            port = rand::thread_rng().gen_range(32768..=65535);
        }

        let guard = IptablesGuard::new(port);
        guard.install();

        let filter = format!("tcp and dst port {}", port);
        let raw = match handle::open(cfg, &filter, Direction::In) {
            Ok(raw) => raw,
            Err(e) => {
                guard.remove();
                return Err(PaqetError::Socket(format!(
                    "failed to create raw handle on {}: {}",
                    cfg.interface, e
                )));
            }
        };

        let engine = match SendEngine::new(cfg, raw.iface_mac, port, raw.injector.clone()) {
            Ok(engine) => Arc::new(engine),
            Err(e) => {
                guard.remove();
                return Err(e);
            }
        };

        // LocalAddr is required by the QUIC layer; prefer IPv4 like the
        // rest of the dial path.
        let local_ip = cfg
            .ipv4
            .as_ref()
            .and_then(|a| a.socket_addr().ok())
            .or_else(|| cfg.ipv6.as_ref().and_then(|a| a.socket_addr().ok()))
            .map(|sa| sa.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let local_addr = SocketAddr::new(local_ip, port);

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(RECV_QUEUE);
        let reader = spawn_reader(raw.reader, tx, cancel.clone());

        Ok(Arc::new(PacketConn {
            port,
            local_addr,
            engine,
            rx: parking_lot::Mutex::new(rx),
            read_deadline: AtomicI64::new(0),
            write_deadline: AtomicI64::new(0),
            cancel,
            reader: parking_lot::Mutex::new(Some(reader)),
            guard,
            closed: AtomicBool::new(false),
        }))
    }

    /// The fixed endpoint port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The local address crafted packets claim as their source.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Poll for the next received datagram. Used by the QUIC adapter.
    pub fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        let mut rx = self.rx.lock();
        match rx.poll_recv(cx) {
            Poll::Ready(Some((data, addr))) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Poll::Ready(Ok((n, addr)))
            }
            Poll::Ready(None) => Poll::Ready(Err(closed_err())),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Receive the next datagram, honoring cancellation and the read
    /// deadline.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.cancel.is_cancelled() {
            return Err(closed_err());
        }
        let deadline = self.read_deadline.load(Ordering::Acquire);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(closed_err()),
            _ = wait_deadline(deadline) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "read deadline exceeded",
            )),
            res = std::future::poll_fn(|cx| self.poll_recv_from(cx, buf)) => res,
        }
    }

    /// Craft and inject one datagram towards `dst`.
    pub fn send_to(&self, payload: &[u8], dst: SocketAddr) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(closed_err());
        }
        let deadline = self.write_deadline.load(Ordering::Acquire);
        if deadline != 0 && now_nanos() >= deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write deadline exceeded",
            ));
        }
        self.engine.send(payload, dst)?;
        Ok(payload.len())
    }

    /// Set both deadlines. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<SystemTime>) {
        let ns = deadline_nanos(deadline);
        self.read_deadline.store(ns, Ordering::Release);
        self.write_deadline.store(ns, Ordering::Release);
    }

    /// Set the read deadline. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<SystemTime>) {
        self.read_deadline
            .store(deadline_nanos(deadline), Ordering::Release);
    }

    /// Set the write deadline. `None` clears it.
    pub fn set_write_deadline(&self, deadline: Option<SystemTime>) {
        self.write_deadline
            .store(deadline_nanos(deadline), Ordering::Release);
    }

    /// Install the flag cycle a peer advertised; subsequent egress to that
    /// peer uses it.
    pub fn set_client_tcpf(&self, peer: SocketAddr, flags: Vec<TcpFlags>) {
        self.engine.set_peer_flags(peer, flags);
    }

    /// Whether `close` has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the endpoint.
    ///
    /// Ordering matters: cancel first, then wait for the reader task to
    /// exit so the capture mapping is never unmapped under it, then drop
    /// the handle, then remove the guard rules.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let task = self.reader.lock().take();
        if let Some(task) = task {
            // The reader polls at 200ms, so it notices within one poll.
            if tokio::time::timeout(CLOSE_DRAIN, task).await.is_err() {
                tracing::warn!("packet reader did not stop within {:?}", CLOSE_DRAIN);
            }
        }

        self.guard.remove();
        tracing::debug!("packet endpoint on port {} closed", self.port);
    }
}

fn spawn_reader(
    mut reader: Box<dyn RawRead>,
    tx: mpsc::Sender<(Bytes, SocketAddr)>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        loop {
            if cancel.is_cancelled() || tx.is_closed() {
                return;
            }
            match reader.read() {
                // Poll timeout: loop around and re-check cancellation.
                Ok(None) => continue,
                Ok(Some(frame)) => {
                    let Some((payload, src)) = recv::decode(frame) else {
                        continue;
                    };
                    if payload.is_empty() {
                        continue; // keepalive-shaped, drop
                    }
                    // Drop on overflow; reliability lives a layer up.
                    let _ = tx.try_send((Bytes::copy_from_slice(payload), src));
                }
                Err(e) => {
                    if !cancel.is_cancelled() {
                        tracing::error!("raw handle read failed: {}", e);
                    }
                    return;
                }
            }
        }
    })
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

fn deadline_nanos(deadline: Option<SystemTime>) -> i64 {
    deadline
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// Resolves when the deadline passes; never resolves when no deadline is
// set.
async fn wait_deadline(deadline_ns: i64) {
    if deadline_ns == 0 {
        std::future::pending::<()>().await;
        return;
    }
    let now = now_nanos();
    if deadline_ns > now {
        tokio::time::sleep(Duration::from_nanos((deadline_ns - now) as u64)).await;
    }
}
