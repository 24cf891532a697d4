//! Datagram plumbing between the packet endpoint and the transports
//!
//! [`DialIo`] binds a datagram socket to one remote peer and optionally
//! seals every packet with the transport cipher. [`Demux`] is the server
//! side: one read loop fans packets out to per-peer queues keyed by the
//! sender's apparent address, creating a queue (and announcing the peer)
//! on first sight. Packets that fail decryption are dropped before they
//! can create peer state.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cipher::PacketCipher;
use super::{recv_from, DatagramSocket};

/// Per-peer inbound queue depth, in packets.
const PEER_QUEUE: usize = 256;

/// Datagram IO against a single peer.
#[async_trait]
pub trait PacketIo: Send + Sync + 'static {
    /// Receive the next packet from the peer.
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one packet to the peer.
    fn send_packet(&self, buf: &[u8]) -> io::Result<()>;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// The peer.
    fn peer_addr(&self) -> SocketAddr;

    /// Release underlying resources. Idempotent.
    fn close(&self);
}

/// Client-side IO: a socket dedicated to one remote endpoint.
pub struct DialIo {
    sock: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    cipher: Option<PacketCipher>,
}

impl DialIo {
    /// Bind `sock` to `peer`, sealing packets when a cipher is given.
    pub fn new(
        sock: Arc<dyn DatagramSocket>,
        peer: SocketAddr,
        cipher: Option<PacketCipher>,
    ) -> Self {
        DialIo { sock, peer, cipher }
    }
}

#[async_trait]
impl PacketIo for DialIo {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (n, _from) = recv_from(self.sock.as_ref(), buf).await?;
            match &self.cipher {
                None => return Ok(n),
                Some(cipher) => match cipher.open(&buf[..n]) {
                    Some(plain) => {
                        buf[..plain.len()].copy_from_slice(&plain);
                        return Ok(plain.len());
                    }
                    // Corrupted or foreign packet; silently drop.
                    None => continue,
                },
            }
        }
    }

    fn send_packet(&self, buf: &[u8]) -> io::Result<()> {
        match &self.cipher {
            None => self.sock.send_to(buf, self.peer).map(|_| ()),
            Some(cipher) => {
                let sealed = cipher.seal(buf).map_err(io::Error::from)?;
                self.sock.send_to(&sealed, self.peer).map(|_| ())
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        self.sock.shutdown();
    }
}

/// A newly seen peer: its address and its inbound packet queue.
pub struct DemuxPeer {
    /// The peer's apparent address
    pub addr: SocketAddr,
    /// Plaintext packets from that peer
    pub queue: mpsc::Receiver<Bytes>,
}

/// Server-side packet demultiplexer by source address.
pub struct Demux {
    sock: Arc<dyn DatagramSocket>,
    cipher: Option<Arc<PacketCipher>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<DemuxPeer>>,
    cancel: CancellationToken,
}

impl Demux {
    /// Start demultiplexing `sock`. With a cipher, packets are decrypted
    /// before routing and failures never create peer state.
    pub fn new(sock: Arc<dyn DatagramSocket>, cipher: Option<Arc<PacketCipher>>) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::channel(64);
        let demux = Arc::new(Demux {
            sock: sock.clone(),
            cipher: cipher.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            cancel: CancellationToken::new(),
        });

        let cancel = demux.cancel.clone();
        tokio::spawn(read_loop(sock, cipher, accept_tx, cancel));
        demux
    }

    /// Wait for the next previously unseen peer.
    pub async fn accept(&self) -> io::Result<DemuxPeer> {
        let mut rx = self.accept_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "demux closed"))
    }

    /// Build the per-peer IO for an accepted peer.
    pub fn peer_io(&self, peer: DemuxPeer) -> DemuxIo {
        DemuxIo {
            sock: self.sock.clone(),
            cipher: self.cipher.clone(),
            peer: peer.addr,
            queue: tokio::sync::Mutex::new(peer.queue),
        }
    }

    /// Stop the read loop and release the socket.
    pub fn close(&self) {
        self.cancel.cancel();
        self.sock.shutdown();
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }
}

async fn read_loop(
    sock: Arc<dyn DatagramSocket>,
    cipher: Option<Arc<PacketCipher>>,
    accept_tx: mpsc::Sender<DemuxPeer>,
    cancel: CancellationToken,
) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Bytes>> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let (n, from) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = recv_from(sock.as_ref(), &mut buf) => match res {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("demux read ended: {}", e);
                    return;
                }
            },
        };

        let plain = match &cipher {
            None => Bytes::copy_from_slice(&buf[..n]),
            Some(cipher) => match cipher.open(&buf[..n]) {
                Some(p) => Bytes::from(p),
                None => continue,
            },
        };

        if let Some(tx) = peers.get(&from) {
            if tx.try_send(plain).is_err() && tx.is_closed() {
                // Session went away; forget the peer so a reconnect from
                // the same address starts fresh.
                peers.remove(&from);
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(PEER_QUEUE);
        let _ = tx.try_send(plain);
        peers.insert(from, tx);
        if accept_tx
            .send(DemuxPeer {
                addr: from,
                queue: rx,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

/// Server-side IO for one demultiplexed peer.
pub struct DemuxIo {
    sock: Arc<dyn DatagramSocket>,
    cipher: Option<Arc<PacketCipher>>,
    peer: SocketAddr,
    queue: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl PacketIo for DemuxIo {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut queue = self.queue.lock().await;
        let data = queue
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer queue closed"))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn send_packet(&self, buf: &[u8]) -> io::Result<()> {
        match &self.cipher {
            None => self.sock.send_to(buf, self.peer).map(|_| ()),
            Some(cipher) => {
                let sealed = cipher.seal(buf).map_err(io::Error::from)?;
                self.sock.send_to(&sealed, self.peer).map(|_| ())
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn close(&self) {
        // The socket is shared with every other peer; only this peer's
        // queue is released (by dropping the receiver with self).
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory datagram sockets for transport tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    /// One end of an in-memory packet link with configurable loss.
    pub struct TestSocket {
        addr: SocketAddr,
        tx: mpsc::Sender<(Bytes, SocketAddr)>,
        rx: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
        drop_every: Option<u64>,
        sent: std::sync::atomic::AtomicU64,
        closed: AtomicBool,
    }

    /// A connected pair of in-memory sockets.
    pub fn socket_pair(
        a_addr: SocketAddr,
        b_addr: SocketAddr,
        drop_every: Option<u64>,
    ) -> (Arc<TestSocket>, Arc<TestSocket>) {
        let (a_tx, b_rx) = mpsc::channel(1024);
        let (b_tx, a_rx) = mpsc::channel(1024);
        (
            Arc::new(TestSocket {
                addr: a_addr,
                tx: a_tx,
                rx: Mutex::new(a_rx),
                drop_every,
                sent: std::sync::atomic::AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            Arc::new(TestSocket {
                addr: b_addr,
                tx: b_tx,
                rx: Mutex::new(b_rx),
                drop_every,
                sent: std::sync::atomic::AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        )
    }

    impl DatagramSocket for Arc<TestSocket> {
        fn poll_recv_from(
            &self,
            cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<(usize, SocketAddr)>> {
            let mut rx = self.rx.lock();
            match rx.poll_recv(cx) {
                Poll::Ready(Some((data, from))) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Poll::Ready(Ok((n, from)))
                }
                Poll::Ready(None) => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
                Poll::Pending => Poll::Pending,
            }
        }

        fn send_to(&self, buf: &[u8], _dst: SocketAddr) -> io::Result<usize> {
            if self.closed.load(Ordering::Relaxed) {
                return Err(io::ErrorKind::NotConnected.into());
            }
            let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(every) = self.drop_every {
                if count % every == 0 {
                    return Ok(buf.len()); // simulated loss
                }
            }
            let _ = self
                .tx
                .try_send((Bytes::copy_from_slice(buf), self.addr));
            Ok(buf.len())
        }

        fn local_addr(&self) -> SocketAddr {
            self.addr
        }

        fn shutdown(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::socket_pair;
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_dial_io_roundtrip() {
        let (a, b) = socket_pair(addr("10.0.0.1:1000"), addr("10.0.0.2:2000"), None);
        let dial_a = DialIo::new(Arc::new(a.clone()), addr("10.0.0.2:2000"), None);
        let dial_b = DialIo::new(Arc::new(b.clone()), addr("10.0.0.1:1000"), None);

        dial_a.send_packet(b"over the link").unwrap();
        let mut buf = [0u8; 64];
        let n = dial_b.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over the link");
    }

    #[tokio::test]
    async fn test_dial_io_cipher_roundtrip() {
        let key = vec![5u8; 32];
        let (a, b) = socket_pair(addr("10.0.0.1:1000"), addr("10.0.0.2:2000"), None);
        let dial_a = DialIo::new(
            Arc::new(a.clone()),
            addr("10.0.0.2:2000"),
            PacketCipher::new(&key).unwrap(),
        );
        let dial_b = DialIo::new(
            Arc::new(b.clone()),
            addr("10.0.0.1:1000"),
            PacketCipher::new(&key).unwrap(),
        );

        dial_a.send_packet(b"sealed").unwrap();
        let mut buf = [0u8; 64];
        let n = dial_b.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"sealed");
    }

    #[tokio::test]
    async fn test_demux_routes_by_source() {
        let (srv, client) = socket_pair(addr("10.0.0.9:443"), addr("10.0.0.5:1111"), None);
        let demux = Demux::new(Arc::new(srv.clone()), None);

        client.send_to(b"first", addr("10.0.0.9:443")).unwrap();
        let peer = demux.accept().await.unwrap();
        assert_eq!(peer.addr, addr("10.0.0.5:1111"));

        let io = demux.peer_io(peer);
        let mut buf = [0u8; 64];
        let n = io.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");

        // More packets from the same source do not announce a new peer.
        client.send_to(b"second", addr("10.0.0.9:443")).unwrap();
        let n = io.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[tokio::test]
    async fn test_demux_drops_garbage_with_cipher() {
        let key = vec![1u8; 32];
        let (srv, client) = socket_pair(addr("10.0.0.9:443"), addr("10.0.0.5:1111"), None);
        let demux = Demux::new(
            Arc::new(srv.clone()),
            PacketCipher::new(&key).unwrap().map(Arc::new),
        );

        // Garbage never creates a peer.
        client.send_to(b"not encrypted", addr("10.0.0.9:443")).unwrap();

        // A validly sealed packet does.
        let cipher = PacketCipher::new(&key).unwrap().unwrap();
        let sealed = cipher.seal(b"real").unwrap();
        client.send_to(&sealed, addr("10.0.0.9:443")).unwrap();

        let peer = demux.accept().await.unwrap();
        let io = demux.peer_io(peer);
        let mut buf = [0u8; 64];
        let n = io.recv_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"real");
    }
}
