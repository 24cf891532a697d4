//! Stream multiplexer
//!
//! Multiplexes ordered reliable streams over one byte-chunk substrate. The
//! KCP transport runs it over the ARQ session; the UDP transport runs it
//! directly over sealed datagrams (where a lost packet costs the affected
//! stream, exactly like the mux it replaces).
//!
//! Wire format per frame: `cmd(1) | stream id(4, BE) | length(2, BE) |
//! payload`. Commands: SYN opens a stream, PSH carries data, FIN closes,
//! NOP is the keepalive.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use super::Strm;

const CMD_SYN: u8 = 0x01;
const CMD_PSH: u8 = 0x02;
const CMD_FIN: u8 = 0x03;
const CMD_NOP: u8 = 0x04;

/// Frame header length.
pub const HEADER_LEN: usize = 7;
/// Largest payload one frame can carry.
pub const MAX_FRAME: usize = 65535;

/// Byte-chunk substrate a mux session runs over.
#[async_trait]
pub trait SessionIo: Send + Sync + 'static {
    /// Read the next chunk. Zero means EOF.
    async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one chunk. For datagram substrates, one chunk is one packet.
    async fn write_chunk(&self, buf: &[u8]) -> io::Result<()>;

    /// Tear down the substrate.
    fn close(&self);

    /// Local address, for logging and `Conn` plumbing.
    fn local_addr(&self) -> SocketAddr;

    /// Peer address, when there is a single peer.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Mux session tuning.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Keepalive send interval
    pub keepalive_interval: Duration,
    /// Session dies when nothing arrives for this long
    pub keepalive_timeout: Duration,
    /// Largest frame payload; datagram substrates set this below their MTU
    pub max_frame: usize,
    /// Per-stream receive buffer, bytes
    pub stream_buf: usize,
    /// Session write queue, bytes
    pub session_buf: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            keepalive_interval: Duration::from_secs(1),
            keepalive_timeout: Duration::from_secs(5),
            max_frame: MAX_FRAME,
            stream_buf: 4 * 1024 * 1024,
            session_buf: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct MuxFrame {
    cmd: u8,
    sid: u32,
    data: Bytes,
}

impl MuxFrame {
    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.data.len());
        buf.extend_from_slice(&[self.cmd]);
        buf.extend_from_slice(&self.sid.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }
}

struct Shared {
    write_tx: mpsc::Sender<MuxFrame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    last_recv: Mutex<tokio::time::Instant>,
    cancel: CancellationToken,
    stream_chan_cap: usize,
    max_frame: usize,
}

impl Shared {
    fn register(&self, sid: u32) -> Option<mpsc::Receiver<Bytes>> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&sid) {
            return None;
        }
        let (tx, rx) = mpsc::channel(self.stream_chan_cap);
        streams.insert(sid, tx);
        Some(rx)
    }

    fn unregister(&self, sid: u32) {
        self.streams.lock().remove(&sid);
    }
}

/// A multiplexed session over one substrate.
pub struct MuxSession {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_sid: AtomicU32,
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
}

impl MuxSession {
    /// Start a session over `io`. Clients allocate odd stream ids, servers
    /// even ones, so simultaneous opens cannot collide.
    pub fn new(io: Arc<dyn SessionIo>, cfg: MuxConfig, is_client: bool) -> Self {
        let write_cap = (cfg.session_buf / cfg.max_frame.max(1)).max(16);
        let (write_tx, write_rx) = mpsc::channel(write_cap);
        let (accept_tx, accept_rx) = mpsc::channel(64);

        let shared = Arc::new(Shared {
            write_tx,
            streams: Mutex::new(HashMap::new()),
            last_recv: Mutex::new(tokio::time::Instant::now()),
            cancel: CancellationToken::new(),
            stream_chan_cap: (cfg.stream_buf / cfg.max_frame.max(1)).max(4),
            max_frame: cfg.max_frame,
        });

        let local_addr = io.local_addr();
        let peer_addr = io.peer_addr();

        tokio::spawn(reader_task(io.clone(), shared.clone(), accept_tx));
        tokio::spawn(writer_task(io, shared.clone(), write_rx, cfg));

        MuxSession {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_sid: AtomicU32::new(if is_client { 1 } else { 2 }),
            local_addr,
            peer_addr,
        }
    }

    /// Open a new outbound stream.
    pub async fn open_strm(&self) -> io::Result<MuxStream> {
        if self.shared.cancel.is_cancelled() {
            return Err(session_closed());
        }
        let sid = self.next_sid.fetch_add(2, Ordering::Relaxed);
        let rx = self
            .shared
            .register(sid)
            .ok_or_else(|| io::Error::other("stream id collision"))?;

        let syn = MuxFrame {
            cmd: CMD_SYN,
            sid,
            data: Bytes::new(),
        };
        if self.shared.write_tx.send(syn).await.is_err() {
            self.shared.unregister(sid);
            return Err(session_closed());
        }
        Ok(MuxStream::new(sid, rx, self.shared.clone()))
    }

    /// Accept the next inbound stream.
    pub async fn accept_strm(&self) -> io::Result<MuxStream> {
        let mut accept_rx = self.accept_rx.lock().await;
        accept_rx.recv().await.ok_or_else(session_closed)
    }

    /// Whether the session has died.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Kill the session; all streams observe EOF.
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Local substrate address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Peer substrate address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "mux session closed")
}

async fn reader_task(
    io: Arc<dyn SessionIo>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut pending = BytesMut::new();

    'outer: loop {
        let n = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            res = io.read_chunk(&mut buf) => match res {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("mux substrate read ended: {}", e);
                    break;
                }
            },
        };
        *shared.last_recv.lock() = tokio::time::Instant::now();
        pending.extend_from_slice(&buf[..n]);

        while pending.len() >= HEADER_LEN {
            let len = u16::from_be_bytes([pending[5], pending[6]]) as usize;
            if pending.len() < HEADER_LEN + len {
                break;
            }
            let cmd = pending[0];
            let sid = u32::from_be_bytes([pending[1], pending[2], pending[3], pending[4]]);
            pending.advance(HEADER_LEN);
            let data = pending.split_to(len).freeze();

            match cmd {
                CMD_SYN => {
                    if let Some(rx) = shared.register(sid) {
                        let stream = MuxStream::new(sid, rx, shared.clone());
                        if accept_tx.send(stream).await.is_err() {
                            break 'outer;
                        }
                    }
                }
                CMD_PSH => {
                    let tx = shared.streams.lock().get(&sid).cloned();
                    if let Some(tx) = tx {
                        // Backpressure: a full stream buffer stalls the
                        // whole session, like any single-pipe mux.
                        let _ = tx.send(data).await;
                    }
                }
                CMD_FIN => {
                    shared.unregister(sid);
                }
                CMD_NOP => {}
                other => {
                    tracing::debug!("mux: unknown command 0x{:02x}, killing session", other);
                    break 'outer;
                }
            }
        }
    }

    shared.cancel.cancel();
    // Dropping the senders gives every stream reader EOF.
    shared.streams.lock().clear();
}

async fn writer_task(
    io: Arc<dyn SessionIo>,
    shared: Arc<Shared>,
    mut write_rx: mpsc::Receiver<MuxFrame>,
    cfg: MuxConfig,
) {
    let mut keepalive = tokio::time::interval(cfg.keepalive_interval);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = keepalive.tick() => {
                if shared.last_recv.lock().elapsed() > cfg.keepalive_timeout {
                    tracing::debug!("mux: peer silent for {:?}, killing session", cfg.keepalive_timeout);
                    break;
                }
                let nop = MuxFrame { cmd: CMD_NOP, sid: 0, data: Bytes::new() };
                if io.write_chunk(&nop.encode()).await.is_err() {
                    break;
                }
            }
            frame = write_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = io.write_chunk(&frame.encode()).await {
                        tracing::debug!("mux substrate write ended: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    shared.cancel.cancel();
    shared.streams.lock().clear();
    io.close();
}

/// One multiplexed stream.
pub struct MuxStream {
    sid: u32,
    recv: mpsc::Receiver<Bytes>,
    leftover: Bytes,
    writer: PollSender<MuxFrame>,
    shared: Arc<Shared>,
    eof: bool,
    fin_sent: bool,
}

impl MuxStream {
    fn new(sid: u32, recv: mpsc::Receiver<Bytes>, shared: Arc<Shared>) -> Self {
        MuxStream {
            sid,
            recv,
            leftover: Bytes::new(),
            writer: PollSender::new(shared.write_tx.clone()),
            shared,
            eof: false,
            fin_sent: false,
        }
    }
}

impl Strm for MuxStream {
    fn sid(&self) -> u64 {
        self.sid as u64
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.remaining());
                buf.put_slice(&self.leftover[..n]);
                self.leftover.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.eof {
                return Poll::Ready(Ok(()));
            }
            match self.recv.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    self.leftover = data;
                }
                Poll::Ready(None) => {
                    self.eof = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.shared.cancel.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len().min(self.shared.max_frame);
                let frame = MuxFrame {
                    cmd: CMD_PSH,
                    sid: self.sid,
                    data: Bytes::copy_from_slice(&buf[..n]),
                };
                if self.writer.send_item(frame).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are written out by the session writer task as they queue.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fin_sent {
            return Poll::Ready(Ok(()));
        }
        match self.writer.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let fin = MuxFrame {
                    cmd: CMD_FIN,
                    sid: self.sid,
                    data: Bytes::new(),
                };
                let _ = self.writer.send_item(fin);
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            // Session already gone; there is no peer left to notify.
            Poll::Ready(Err(_)) => {
                self.fin_sent = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.unregister(self.sid);
        if !self.fin_sent {
            let fin = MuxFrame {
                cmd: CMD_FIN,
                sid: self.sid,
                data: Bytes::new(),
            };
            let _ = self.shared.write_tx.try_send(fin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    // A duplex-pipe substrate for session tests.
    struct PipeIo {
        read: tokio::sync::Mutex<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        write: tokio::sync::Mutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl SessionIo for PipeIo {
        async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.read.lock().await.read(buf).await
        }

        async fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
            let mut w = self.write.lock().await;
            w.write_all(buf).await?;
            w.flush().await
        }

        fn close(&self) {}

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:0".parse().unwrap()
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn pipe_pair() -> (Arc<PipeIo>, Arc<PipeIo>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Arc::new(PipeIo {
                read: tokio::sync::Mutex::new(ar),
                write: tokio::sync::Mutex::new(aw),
            }),
            Arc::new(PipeIo {
                read: tokio::sync::Mutex::new(br),
                write: tokio::sync::Mutex::new(bw),
            }),
        )
    }

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = pipe_pair();
        (
            MuxSession::new(a, MuxConfig::default(), true),
            MuxSession::new(b, MuxConfig::default(), false),
        )
    }

    #[tokio::test]
    async fn test_open_accept_roundtrip() {
        let (client, server) = session_pair();

        let mut cs = client.open_strm().await.unwrap();
        cs.write_all(b"hello mux").await.unwrap();

        let mut ss = server.accept_strm().await.unwrap();
        assert_eq!(ss.sid(), cs.sid());

        let mut got = [0u8; 9];
        ss.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello mux");
    }

    #[tokio::test]
    async fn test_bidirectional_data() {
        let (client, server) = session_pair();

        let mut cs = client.open_strm().await.unwrap();
        cs.write_all(b"ping?").await.unwrap();

        let mut ss = server.accept_strm().await.unwrap();
        let mut buf = [0u8; 5];
        ss.read_exact(&mut buf).await.unwrap();
        ss.write_all(b"pong!").await.unwrap();

        cs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");
    }

    #[tokio::test]
    async fn test_interleaved_streams_keep_order() {
        let (client, server) = session_pair();

        let mut s1 = client.open_strm().await.unwrap();
        let mut s2 = client.open_strm().await.unwrap();
        assert_ne!(s1.sid(), s2.sid());

        for i in 0u8..50 {
            s1.write_all(&[1, i]).await.unwrap();
            s2.write_all(&[2, i]).await.unwrap();
        }

        let mut a1 = server.accept_strm().await.unwrap();
        let mut a2 = server.accept_strm().await.unwrap();
        if a1.sid() != s1.sid() {
            std::mem::swap(&mut a1, &mut a2);
        }

        let mut buf = [0u8; 2];
        for i in 0u8..50 {
            a1.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [1, i]);
            a2.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [2, i]);
        }
    }

    #[tokio::test]
    async fn test_fin_gives_eof() {
        let (client, server) = session_pair();

        let mut cs = client.open_strm().await.unwrap();
        cs.write_all(b"bye").await.unwrap();
        cs.shutdown().await.unwrap();

        let mut ss = server.accept_strm().await.unwrap();
        let mut got = Vec::new();
        ss.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"bye");
    }

    #[tokio::test]
    async fn test_large_transfer() {
        let (client, server) = session_pair();

        let data: Vec<u8> = (0..200_000u32).map(|i| i as u8).collect();
        let mut cs = client.open_strm().await.unwrap();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            cs.write_all(&data).await.unwrap();
            cs.shutdown().await.unwrap();
            cs
        });

        let mut ss = server.accept_strm().await.unwrap();
        let mut got = Vec::new();
        ss.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_session_close_fails_new_streams() {
        let (client, _server) = session_pair();
        client.close();
        assert!(client.is_closed());
        assert!(client.open_strm().await.is_err());
    }

    #[tokio::test]
    async fn test_odd_even_sid_split() {
        let (client, server) = session_pair();
        let cs = client.open_strm().await.unwrap();
        assert_eq!(cs.sid() % 2, 1);

        let ss = server.open_strm().await.unwrap();
        assert_eq!(ss.sid() % 2, 0);
    }
}
