//! UDP port forwarder
//!
//! Each local client flow gets N parallel uncached tunnel streams;
//! outgoing datagrams round-robin across them through bounded queues
//! (overflow drops, with a counter), responses flow back to the client
//! address. Stream 0 owns session teardown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::{self, UDP_BUF_SIZE};
use crate::client::{flow_key, Client};
use crate::tnet::Addr;

/// Total queued packets per session, divided across its streams.
const SESSION_QUEUE: usize = 4096;
/// Read timeout on tunnel streams; generous enough for WireGuard
/// keepalives (25s default interval).
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Write deadline towards the tunnel.
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

struct UdpSession {
    queues: Vec<mpsc::Sender<Vec<u8>>>,
    next_idx: AtomicU64,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

pub(crate) async fn run(
    client: Arc<Client>,
    listen: SocketAddr,
    target: Addr,
    streams: usize,
    cancel: CancellationToken,
) {
    let sock = match UdpSocket::bind(listen).await {
        Ok(sock) => Arc::new(sock),
        Err(e) => {
            tracing::error!("failed to bind UDP socket on {}: {}", listen, e);
            return;
        }
    };
    // High-throughput flows need roomy socket buffers.
    {
        let sref = socket2::SockRef::from(sock.as_ref());
        let _ = sref.set_recv_buffer_size(8 * 1024 * 1024);
        let _ = sref.set_send_buffer_size(8 * 1024 * 1024);
    }
    tracing::info!(
        "UDP forwarder listening on {} -> {} ({} parallel streams)",
        listen,
        target,
        streams
    );

    let sessions: Arc<DashMap<u64, Arc<UdpSession>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; UDP_BUF_SIZE];

    loop {
        let (n, caddr) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = sock.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("UDP read error on {}: {}", listen, e);
                    continue;
                }
            },
        };
        if n == 0 {
            continue;
        }

        let key = flow_key(&caddr.to_string(), &target.to_string());
        if let Some(sess) = sessions.get(&key) {
            enqueue(&sess, &buf[..n], caddr);
            continue;
        }

        // New flow: establish the parallel streams before any packet is
        // queued.
        match new_session(
            &client,
            &sock,
            &sessions,
            key,
            caddr,
            &target,
            streams,
            &cancel,
        )
        .await
        {
            Some(sess) => {
                tracing::info!(
                    "accepted UDP session for {} -> {} ({} parallel streams)",
                    caddr,
                    target,
                    streams
                );
                enqueue(&sess, &buf[..n], caddr);
            }
            None => continue,
        }
    }
}

fn enqueue(sess: &UdpSession, pkt: &[u8], caddr: SocketAddr) {
    let idx =
        sess.next_idx.fetch_add(1, Ordering::Relaxed) as usize % sess.queues.len();
    if sess.queues[idx].try_send(pkt.to_vec()).is_err() {
        let dropped = sess.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % 1000 == 1 {
            tracing::debug!(
                "UDP forward: dropped {} packets for {} (buffer full)",
                dropped,
                caddr
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn new_session(
    client: &Arc<Client>,
    sock: &Arc<UdpSocket>,
    sessions: &Arc<DashMap<u64, Arc<UdpSession>>>,
    key: u64,
    caddr: SocketAddr,
    target: &Addr,
    streams: usize,
    cancel: &CancellationToken,
) -> Option<Arc<UdpSession>> {
    let per_stream = (SESSION_QUEUE / streams).max(64);
    let sess_cancel = cancel.child_token();

    let mut opened = Vec::with_capacity(streams);
    for i in 0..streams {
        match client.udp_new(target).await {
            Ok(strm) => opened.push(strm),
            Err(e) => {
                tracing::error!(
                    "failed to establish UDP stream {} for {} -> {}: {}",
                    i,
                    caddr,
                    target,
                    e
                );
                // Tear down the ones already opened.
                for strm in opened {
                    client.close_udp_strm(strm).await;
                }
                return None;
            }
        }
    }

    let mut queues = Vec::with_capacity(streams);
    for (i, strm) in opened.into_iter().enumerate() {
        let (tx, rx) = mpsc::channel(per_stream);
        queues.push(tx);
        let (read_half, write_half) = tokio::io::split(strm);

        tokio::spawn(write_loop(write_half, rx, sess_cancel.clone()));
        tokio::spawn(read_loop(
            read_half,
            sock.clone(),
            caddr,
            key,
            i,
            sessions.clone(),
            sess_cancel.clone(),
        ));
    }

    let sess = Arc::new(UdpSession {
        queues,
        next_idx: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        cancel: sess_cancel,
    });
    sessions.insert(key, sess.clone());
    Some(sess)
}

// Queue -> tunnel. Drains bursts without re-arming the deadline per
// packet.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    let mut written: u64 = 0;
    loop {
        let pkt = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("UDP stream writer stopping, wrote {} packets", written);
                return;
            }
            pkt = rx.recv() => match pkt {
                Some(pkt) => pkt,
                None => return,
            },
        };

        let deadline = tokio::time::Instant::now() + STREAM_WRITE_TIMEOUT;
        match tokio::time::timeout_at(deadline, buffer::write_udp_frame(&mut writer, &pkt)).await
        {
            Ok(Ok(())) => written += 1,
            _ => {
                tracing::debug!("UDP stream write error after {} packets", written);
                cancel.cancel();
                return;
            }
        }

        // Drain whatever queued behind without blocking.
        while let Ok(pkt) = rx.try_recv() {
            match tokio::time::timeout_at(deadline, buffer::write_udp_frame(&mut writer, &pkt))
                .await
            {
                Ok(Ok(())) => written += 1,
                _ => {
                    tracing::debug!("UDP stream write error after {} packets", written);
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

// Tunnel -> local client. Stream 0 cleans the session up on exit.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    sock: Arc<UdpSocket>,
    caddr: SocketAddr,
    key: u64,
    stream_idx: usize,
    sessions: Arc<DashMap<u64, Arc<UdpSession>>>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    let mut read: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let n = match tokio::time::timeout(
            STREAM_READ_TIMEOUT,
            buffer::read_udp_frame(&mut reader, &mut buf),
        )
        .await
        {
            Err(_) => {
                tracing::debug!("UDP stream read timed out after {} packets", read);
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!("UDP stream read error after {} packets: {}", read, e);
                break;
            }
            Ok(Ok(n)) => n,
        };
        read += 1;

        if let Err(e) = sock.send_to(&buf[..n], caddr).await {
            tracing::debug!("UDP write to {} failed after {} packets: {}", caddr, read, e);
            break;
        }
    }

    if stream_idx == 0 {
        sessions.remove(&key);
        cancel.cancel();
        tracing::debug!("UDP session closed for {}", caddr);
    }
    tracing::debug!("UDP stream closed (read {} packets)", read);
}
