//! Transport factory, auto-mode tagging, and the protocol probe
//!
//! Dial and listen dispatch to the configured transport adapter. In auto
//! mode every datagram carries a 1-byte protocol tag (0x10 KCP, 0x20 QUIC,
//! 0x30 UDP mux): the client tags egress and strips ingress, the server
//! demultiplexes one endpoint into per-transport virtual sockets. The
//! probe dials every configured candidate over a throwaway endpoint,
//! measures three ping round-trips, and picks the lowest median.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{NetworkConfig, Protocol, TransportConfig};
use crate::error::PaqetError;
use crate::socket::PacketConn;
use crate::tnet::{kcp, quic, udp, BoxConn, BoxListener, Conn, DatagramSocket};

/// Ceiling for a whole probe attempt (dial plus three pings).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pings per probe candidate.
const PROBE_PINGS: usize = 3;

/// Dial with the configured (non-auto) protocol.
pub async fn dial(
    addr: SocketAddr,
    cfg: &TransportConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxConn, PaqetError> {
    dial_proto(cfg.protocol, addr, cfg, sock, false).await
}

/// Dial a specific protocol; `tagged` wraps the socket with the auto-mode
/// tag byte.
pub async fn dial_proto(
    proto: Protocol,
    addr: SocketAddr,
    cfg: &TransportConfig,
    sock: Arc<dyn DatagramSocket>,
    tagged: bool,
) -> Result<BoxConn, PaqetError> {
    let sock: Arc<dyn DatagramSocket> = if tagged {
        let tag = proto
            .tag()
            .ok_or_else(|| PaqetError::Transport("auto is not a concrete protocol".into()))?;
        Arc::new(TaggedSocket { inner: sock, tag })
    } else {
        sock
    };

    match proto {
        Protocol::Kcp => {
            let kcp_cfg = cfg
                .kcp
                .as_ref()
                .ok_or_else(|| PaqetError::Config("KCP is not configured".into()))?;
            kcp::dial(addr, kcp_cfg, sock).await
        }
        Protocol::Quic => {
            let quic_cfg = cfg
                .quic
                .as_ref()
                .ok_or_else(|| PaqetError::Config("QUIC is not configured".into()))?;
            quic::dial(addr, quic_cfg, sock).await
        }
        Protocol::Udp => {
            let udp_cfg = cfg
                .udp
                .as_ref()
                .ok_or_else(|| PaqetError::Config("UDP is not configured".into()))?;
            udp::dial(addr, udp_cfg, sock).await
        }
        Protocol::Auto => Err(PaqetError::Transport(
            "auto must be resolved by the probe before dialing".into(),
        )),
    }
}

/// Listen with the configured protocol.
///
/// In auto mode this returns one listener per configured transport, all
/// demultiplexed from the same endpoint by the tag byte.
pub fn listen(
    cfg: &TransportConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<Vec<BoxListener>, PaqetError> {
    match cfg.protocol {
        Protocol::Auto => {
            let candidates = cfg.auto_candidates();
            let mut sockets = tag_demux(sock, &candidates);
            let mut listeners = Vec::with_capacity(candidates.len());
            for proto in candidates {
                let vsock = sockets
                    .remove(&proto)
                    .expect("tag_demux returns every candidate");
                listeners.push(listen_proto(proto, cfg, vsock)?);
            }
            Ok(listeners)
        }
        proto => Ok(vec![listen_proto(proto, cfg, sock)?]),
    }
}

fn listen_proto(
    proto: Protocol,
    cfg: &TransportConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxListener, PaqetError> {
    match proto {
        Protocol::Kcp => {
            let kcp_cfg = cfg
                .kcp
                .as_ref()
                .ok_or_else(|| PaqetError::Config("KCP is not configured".into()))?;
            kcp::listen(kcp_cfg, sock)
        }
        Protocol::Quic => {
            let quic_cfg = cfg
                .quic
                .as_ref()
                .ok_or_else(|| PaqetError::Config("QUIC is not configured".into()))?;
            quic::listen(quic_cfg, sock)
        }
        Protocol::Udp => {
            let udp_cfg = cfg
                .udp
                .as_ref()
                .ok_or_else(|| PaqetError::Config("UDP is not configured".into()))?;
            udp::listen(udp_cfg, sock)
        }
        Protocol::Auto => unreachable!("auto expands to concrete listeners"),
    }
}

// Client side of auto mode: prepend the tag on egress, require and strip
// it on ingress.
struct TaggedSocket {
    inner: Arc<dyn DatagramSocket>,
    tag: u8,
}

impl DatagramSocket for TaggedSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>> {
        loop {
            match self.inner.poll_recv_from(cx, buf) {
                Poll::Ready(Ok((n, addr))) => {
                    if n == 0 || buf[0] != self.tag {
                        continue; // other transport's packet
                    }
                    buf.copy_within(1..n, 0);
                    return Poll::Ready(Ok((n - 1, addr)));
                }
                other => return other,
            }
        }
    }

    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        let mut tagged = Vec::with_capacity(buf.len() + 1);
        tagged.push(self.tag);
        tagged.extend_from_slice(buf);
        self.inner.send_to(&tagged, dst)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }
}

// Server side of auto mode: route one endpoint's ingress to per-transport
// queues by tag byte.
fn tag_demux(
    sock: Arc<dyn DatagramSocket>,
    protocols: &[Protocol],
) -> HashMap<Protocol, Arc<dyn DatagramSocket>> {
    let cancel = CancellationToken::new();
    let mut queues: HashMap<u8, mpsc::Sender<(Bytes, SocketAddr)>> = HashMap::new();
    let mut sockets: HashMap<Protocol, Arc<dyn DatagramSocket>> = HashMap::new();

    for proto in protocols {
        let tag = proto.tag().expect("auto candidates are concrete");
        let (tx, rx) = mpsc::channel(1024);
        queues.insert(tag, tx);
        sockets.insert(
            *proto,
            Arc::new(VirtualSocket {
                inner: sock.clone(),
                tag,
                rx: parking_lot::Mutex::new(rx),
                cancel: cancel.clone(),
            }) as Arc<dyn DatagramSocket>,
        );
    }

    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (n, from) = tokio::select! {
                _ = cancel.cancelled() => return,
                res = crate::tnet::recv_from(sock.as_ref(), &mut buf) => match res {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::debug!("tag demux read ended: {}", e);
                        return;
                    }
                },
            };
            if n == 0 {
                continue;
            }
            let Some(tx) = queues.get(&buf[0]) else {
                tracing::trace!("dropping packet with unknown protocol tag 0x{:02x}", buf[0]);
                continue;
            };
            let _ = tx.try_send((Bytes::copy_from_slice(&buf[1..n]), from));
        }
    });

    sockets
}

struct VirtualSocket {
    inner: Arc<dyn DatagramSocket>,
    tag: u8,
    rx: parking_lot::Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    cancel: CancellationToken,
}

impl DatagramSocket for VirtualSocket {
    fn poll_recv_from(
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
            Poll::Ready(None) => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        let mut tagged = Vec::with_capacity(buf.len() + 1);
        tagged.push(self.tag);
        tagged.extend_from_slice(buf);
        self.inner.send_to(&tagged, dst)?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }

    fn shutdown(&self) {
        self.cancel.cancel();
        self.inner.shutdown();
    }
}

/// Outcome of probing one candidate transport.
#[derive(Debug)]
pub struct ProbeResult {
    /// Probed protocol
    pub protocol: Protocol,
    /// Median RTT of the successful pings, if any succeeded
    pub rtt: Option<Duration>,
}

/// Probe every configured auto-mode candidate and pick the fastest.
///
/// Each candidate gets its own throwaway packet endpoint, a tagged dial,
/// and [`PROBE_PINGS`] waited pings; candidates with no successful ping
/// are excluded. Fails when nothing answers.
pub async fn probe(
    server: SocketAddr,
    cfg: &TransportConfig,
    net: &NetworkConfig,
) -> Result<Protocol, PaqetError> {
    let candidates = cfg.auto_candidates();
    if candidates.len() < 2 {
        return Err(PaqetError::Config(
            "auto mode requires at least 2 configured protocols".into(),
        ));
    }

    let mut tasks = Vec::with_capacity(candidates.len());
    for proto in candidates {
        let cfg = cfg.clone();
        let net = net.clone();
        tasks.push(tokio::spawn(async move {
            let rtt = tokio::time::timeout(PROBE_TIMEOUT, probe_one(proto, server, &cfg, &net))
                .await
                .ok()
                .flatten();
            ProbeResult {
                protocol: proto,
                rtt,
            }
        }));
    }

    let mut best: Option<ProbeResult> = None;
    for task in tasks {
        let result = task
            .await
            .map_err(|e| PaqetError::Transport(format!("probe task failed: {}", e)))?;
        match &result.rtt {
            Some(rtt) => tracing::info!(
                "probe: {} median rtt {:?}",
                result.protocol.name(),
                rtt
            ),
            None => tracing::warn!("probe: {} failed all pings", result.protocol.name()),
        }
        if result.rtt.is_some()
            && best.as_ref().map_or(true, |b| result.rtt < b.rtt)
        {
            best = Some(result);
        }
    }

    best.map(|b| b.protocol).ok_or_else(|| {
        PaqetError::Connection("auto-protocol probe: no transport answered".into())
    })
}

async fn probe_one(
    proto: Protocol,
    server: SocketAddr,
    cfg: &TransportConfig,
    net: &NetworkConfig,
) -> Option<Duration> {
    let pconn = match PacketConn::new(net) {
        Ok(pconn) => pconn,
        Err(e) => {
            tracing::warn!("probe {}: endpoint failed: {}", proto.name(), e);
            return None;
        }
    };

    let conn = match dial_proto(proto, server, cfg, Arc::new(pconn.clone()), true).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!("probe {}: dial failed: {}", proto.name(), e);
            pconn.close().await;
            return None;
        }
    };

    let mut rtts = Vec::with_capacity(PROBE_PINGS);
    for _ in 0..PROBE_PINGS {
        let start = Instant::now();
        if conn.ping(true).await.is_ok() {
            rtts.push(start.elapsed());
        }
    }

    conn.close().await;
    pconn.close().await;

    if rtts.is_empty() {
        return None;
    }
    rtts.sort();
    Some(rtts[rtts.len() / 2])
}
