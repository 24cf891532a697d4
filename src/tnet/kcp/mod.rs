//! KCP transport adapter
//!
//! ARQ session plus the stream mux, riding the packet endpoint. The
//! conversation id is chosen by the dialing client; the listener learns it
//! from the first datagram of every new peer. When a block cipher is
//! configured every datagram is sealed beneath the ARQ layer.

mod core;
mod session;

pub use self::core::{Kcp, KcpError, OVERHEAD};
pub use session::KcpSession;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::KcpConfig;
use crate::error::PaqetError;
use crate::tnet::cipher::PacketCipher;
use crate::tnet::io::{Demux, DialIo};
use crate::tnet::mux::{MuxConfig, MuxSession};
use crate::tnet::{BoxConn, BoxListener, BoxStrm, Conn, DatagramSocket, Listener};

fn mux_config(cfg: &KcpConfig) -> MuxConfig {
    MuxConfig {
        stream_buf: cfg.streambuf,
        session_buf: cfg.smuxbuf,
        ..Default::default()
    }
}

fn packet_cipher(cfg: &KcpConfig) -> Result<Option<PacketCipher>, PaqetError> {
    match cfg.packet_key() {
        Some(key) => PacketCipher::new(&key),
        None => Ok(None),
    }
}

/// Dial a KCP connection over the given endpoint.
pub async fn dial(
    addr: SocketAddr,
    cfg: &KcpConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxConn, PaqetError> {
    let cipher = packet_cipher(cfg)?;
    let io = Arc::new(DialIo::new(sock, addr, cipher));
    let conv: u32 = rand::random();

    let session = KcpSession::new(conv, cfg, io, None)?;
    let mux = MuxSession::new(session.clone(), mux_config(cfg), true);

    tracing::debug!("KCP connection established to {} (conv {})", addr, conv);
    Ok(Box::new(KcpConn { mux, session }))
}

/// Listen for KCP connections on the given endpoint.
pub fn listen(
    cfg: &KcpConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxListener, PaqetError> {
    let cipher = packet_cipher(cfg)?.map(Arc::new);
    let demux = Demux::new(sock, cipher);
    tracing::debug!("KCP listener started with packet demuxing");
    Ok(Box::new(KcpListener {
        demux,
        cfg: cfg.clone(),
    }))
}

struct KcpConn {
    mux: MuxSession,
    session: Arc<KcpSession>,
}

#[async_trait]
impl Conn for KcpConn {
    async fn open_strm(&self) -> Result<BoxStrm, PaqetError> {
        let strm = self.mux.open_strm().await?;
        Ok(Box::new(strm))
    }

    async fn accept_strm(&self) -> Result<BoxStrm, PaqetError> {
        let strm = self.mux.accept_strm().await?;
        Ok(Box::new(strm))
    }

    async fn close(&self) {
        self.mux.close();
        self.session.shutdown();
    }

    fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.mux.peer_addr()
    }
}

struct KcpListener {
    demux: Arc<Demux>,
    cfg: KcpConfig,
}

#[async_trait]
impl Listener for KcpListener {
    async fn accept(&self) -> Result<BoxConn, PaqetError> {
        loop {
            let mut peer = self.demux.accept().await?;

            // The first datagram names the conversation.
            let Some(first) = peer.queue.recv().await else {
                continue;
            };
            let Some(conv) = Kcp::peek_conv(&first) else {
                continue;
            };

            let addr = peer.addr;
            let io = Arc::new(self.demux.peer_io(peer));
            let session = match KcpSession::new(conv, &self.cfg, io, Some(first.as_ref())) {
                Ok(session) => session,
                Err(e) => {
                    tracing::debug!("rejecting KCP peer {}: {}", addr, e);
                    continue;
                }
            };
            let mux = MuxSession::new(session.clone(), mux_config(&self.cfg), false);

            tracing::debug!("accepted KCP peer {} (conv {})", addr, conv);
            return Ok(Box::new(KcpConn { mux, session }));
        }
    }

    async fn close(&self) {
        self.demux.close();
    }

    fn local_addr(&self) -> SocketAddr {
        self.demux.local_addr()
    }
}
