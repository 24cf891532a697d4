//! Server-side UDP egress
//!
//! Non-DNS targets share one real UDP socket per `host:port`: protocols
//! like WireGuard expect a single source port per peer, and sharing avoids
//! a source-port explosion when many tunnel streams hit one target. The
//! socket has one reader distributing responses round-robin over a
//! copy-on-write subscriber list; the reference count drops the socket
//! when the last stream leaves. DNS (port 53) is exempt: responses must
//! reach the stream whose transaction id matches, so each stream gets its
//! own socket.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::buffer::{self, UDP_BUF_SIZE};
use crate::error::PaqetError;
use crate::tnet::BoxStrm;

/// Write deadline towards the target socket.
const TARGET_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout on the shared socket; bounds reader shutdown.
const TARGET_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Write deadline towards a subscriber stream.
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type StreamWriter = Arc<Mutex<WriteHalf<BoxStrm>>>;

// Big socket buffers keep bursty targets from dropping on the floor.
pub(crate) fn set_socket_buffers(sock: &UdpSocket) {
    let sref = socket2::SockRef::from(sock);
    let _ = sref.set_recv_buffer_size(8 * 1024 * 1024);
    let _ = sref.set_send_buffer_size(8 * 1024 * 1024);
}

/// One subscriber of a shared socket.
#[derive(Clone)]
struct Subscriber {
    id: u64,
    writer: StreamWriter,
}

/// A shared UDP socket towards one target.
pub(crate) struct SharedUdp {
    sock: Arc<UdpSocket>,
    addr: String,
    refcount: AtomicI32,
    subscribers: ArcSwap<Vec<Subscriber>>,
    next_idx: AtomicU64,
    next_sub_id: AtomicU64,
    cancel: CancellationToken,
}

impl SharedUdp {
    /// Send one datagram to the target.
    pub(crate) async fn send(&self, data: &[u8]) -> std::io::Result<()> {
        tokio::time::timeout(TARGET_WRITE_TIMEOUT, self.sock.send(data))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "udp send timeout"))?
            .map(|_| ())
    }

    // Copy-on-write subscribe; returns the id for removal.
    fn add_subscriber(&self, writer: StreamWriter) -> u64 {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.rcu(|subs| {
            let mut next = Vec::with_capacity(subs.len() + 1);
            next.extend(subs.iter().cloned());
            next.push(Subscriber {
                id,
                writer: writer.clone(),
            });
            next
        });
        id
    }

    fn remove_subscriber(&self, id: u64) {
        self.subscribers.rcu(|subs| {
            subs.iter().filter(|s| s.id != id).cloned().collect::<Vec<_>>()
        });
    }

    // One reader for the whole socket: pick a subscriber round-robin and
    // hand it the datagram; on a write failure try the others, wrapping
    // once.
    async fn read_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = tokio::time::timeout(TARGET_READ_TIMEOUT, self.sock.recv(&mut buf)) => {
                    match res {
                        Err(_) => continue, // idle; re-check cancellation
                        Ok(Err(e)) => {
                            tracing::debug!("shared UDP read error for {}: {}", self.addr, e);
                            return;
                        }
                        Ok(Ok(n)) => n,
                    }
                }
            };

            let subs = self.subscribers.load();
            if subs.is_empty() {
                continue;
            }
            let start = self.next_idx.fetch_add(1, Ordering::Relaxed) as usize % subs.len();
            for offset in 0..subs.len() {
                let sub = &subs[(start + offset) % subs.len()];
                if write_frame_to(sub, &buf[..n]).await {
                    break;
                }
            }
        }
    }
}

async fn write_frame_to(sub: &Subscriber, data: &[u8]) -> bool {
    let fut = async {
        let mut writer = sub.writer.lock().await;
        buffer::write_udp_frame(&mut *writer, data).await
    };
    matches!(tokio::time::timeout(STREAM_WRITE_TIMEOUT, fut).await, Ok(Ok(())))
}

/// Registry of shared sockets by target address.
pub(crate) struct SharedUdpPool {
    conns: DashMap<String, Arc<SharedUdp>>,
    create_mu: Mutex<()>,
}

impl SharedUdpPool {
    pub(crate) fn new() -> Self {
        SharedUdpPool {
            conns: DashMap::new(),
            create_mu: Mutex::new(()),
        }
    }

    /// Number of live shared sockets.
    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    /// Take a reference on the shared socket for `addr`, creating it on
    /// first use. The create path is serialized and double-checked so two
    /// streams never race two sockets into existence.
    pub(crate) async fn get_or_create(&self, addr: &str) -> Result<Arc<SharedUdp>, PaqetError> {
        if let Some(shared) = self.conns.get(addr) {
            shared.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(shared.clone());
        }

        let _guard = self.create_mu.lock().await;
        if let Some(shared) = self.conns.get(addr) {
            shared.refcount.fetch_add(1, Ordering::SeqCst);
            return Ok(shared.clone());
        }

        let sock = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(PaqetError::Io)?;
        set_socket_buffers(&sock);
        sock.connect(addr).await.map_err(|e| {
            PaqetError::Connection(format!("UDP connect to {}: {}", addr, e))
        })?;

        let shared = Arc::new(SharedUdp {
            sock: Arc::new(sock),
            addr: addr.to_string(),
            refcount: AtomicI32::new(1),
            subscribers: ArcSwap::from_pointee(Vec::new()),
            next_idx: AtomicU64::new(0),
            next_sub_id: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        self.conns.insert(addr.to_string(), shared.clone());
        tokio::spawn(shared.clone().read_loop());

        tracing::debug!("created shared UDP connection to {}", addr);
        Ok(shared)
    }

    /// Drop a reference; the last one closes the socket.
    pub(crate) fn release(&self, shared: &Arc<SharedUdp>) {
        if shared.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.conns.remove(&shared.addr);
            shared.cancel.cancel();
            tracing::debug!("closed shared UDP connection to {}", shared.addr);
        }
    }
}

/// Relay one tunnel stream through the shared socket for `addr`.
pub(crate) async fn handle_shared(
    pool: &SharedUdpPool,
    strm: BoxStrm,
    addr: &str,
    sid: u64,
) -> Result<(), PaqetError> {
    let shared = pool.get_or_create(addr).await.map_err(|e| {
        tracing::error!(
            "failed to get shared UDP connection to {} for stream {}: {}",
            addr,
            sid,
            e
        );
        e
    })?;

    let (read_half, write_half) = tokio::io::split(strm);
    let writer: StreamWriter = Arc::new(Mutex::new(write_half));
    let sub_id = shared.add_subscriber(writer);

    tracing::debug!(
        "UDP stream {} joined shared connection to {} (refs: {})",
        sid,
        addr,
        shared.refcount.load(Ordering::SeqCst)
    );

    let result = pump_to_target(read_half, &shared, addr, sid).await;

    shared.remove_subscriber(sub_id);
    pool.release(&shared);
    result
}

// Stream -> target; responses flow back through the shared read loop.
async fn pump_to_target<R: AsyncRead + Unpin>(
    mut read_half: R,
    shared: &SharedUdp,
    addr: &str,
    sid: u64,
) -> Result<(), PaqetError> {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let n = match buffer::read_udp_frame(&mut read_half, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("UDP stream {} to {} ended: {}", sid, addr, e);
                return Ok(());
            }
        };
        if let Err(e) = shared.send(&buf[..n]).await {
            tracing::debug!("UDP stream {} write to {} failed: {}", sid, addr, e);
            return Err(PaqetError::Io(e));
        }
    }
}

/// Relay one tunnel stream through a dedicated socket. Used for DNS.
pub(crate) async fn handle_direct(strm: BoxStrm, addr: &str, sid: u64) -> Result<(), PaqetError> {
    let sock = UdpSocket::bind("0.0.0.0:0").await.map_err(PaqetError::Io)?;
    sock.connect(addr)
        .await
        .map_err(|e| PaqetError::Connection(format!("UDP connect to {}: {}", addr, e)))?;
    let sock = Arc::new(sock);

    tracing::debug!("UDP stream {} direct connection to {}", sid, addr);

    let (mut read_half, write_half) = tokio::io::split(strm);
    let writer = Arc::new(Mutex::new(write_half));

    // Responses: target -> stream.
    let resp_sock = sock.clone();
    let resp_writer = writer.clone();
    let resp_addr = addr.to_string();
    let responder = tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let n = match tokio::time::timeout(
                Duration::from_secs(30),
                resp_sock.recv(&mut buf),
            )
            .await
            {
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::debug!("UDP stream {} read from {} ended: {}", sid, resp_addr, e);
                    return;
                }
                Ok(Ok(n)) => n,
            };
            let mut writer = resp_writer.lock().await;
            if buffer::write_udp_frame(&mut *writer, &buf[..n]).await.is_err() {
                tracing::debug!("UDP stream {} write to client failed", sid);
                return;
            }
        }
    });

    // Requests: stream -> target.
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    loop {
        let n = match buffer::read_udp_frame(&mut read_half, &mut buf).await {
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("UDP stream {} to {} ended: {}", sid, addr, e);
                break;
            }
        };
        let send = tokio::time::timeout(TARGET_WRITE_TIMEOUT, sock.send(&buf[..n])).await;
        match send {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::debug!("UDP stream {} write to {} failed: {}", sid, addr, e);
                break;
            }
            Err(_) => {
                tracing::debug!("UDP stream {} write to {} timed out", sid, addr);
                break;
            }
        }
    }

    responder.abort();
    Ok(())
}
