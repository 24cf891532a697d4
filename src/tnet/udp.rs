//! UDP-mux transport adapter
//!
//! The lightest transport: the stream mux rides sealed datagrams directly,
//! with no retransmission layer. A lost packet costs the affected stream
//! whatever bytes it carried; reliability-sensitive traffic belongs on KCP
//! or QUIC. The server demultiplexes peers by source address; packets that
//! fail decryption are dropped before they can create peer state.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::UdpConfig;
use crate::error::PaqetError;
use crate::tnet::cipher::{PacketCipher, OVERHEAD};
use crate::tnet::io::{Demux, DialIo, PacketIo};
use crate::tnet::mux::{MuxConfig, MuxSession, SessionIo, HEADER_LEN};
use crate::tnet::{BoxConn, BoxListener, BoxStrm, Conn, DatagramSocket, Listener};

// One mux frame must fit one crafted packet: endpoint MTU minus the seal
// and the mux header.
const UDP_MAX_FRAME: usize = 1400 - OVERHEAD - HEADER_LEN;

fn mux_config(cfg: &UdpConfig) -> MuxConfig {
    MuxConfig {
        max_frame: UDP_MAX_FRAME,
        stream_buf: cfg.streambuf,
        session_buf: cfg.smuxbuf,
        ..Default::default()
    }
}

fn packet_cipher(cfg: &UdpConfig) -> Result<Option<PacketCipher>, PaqetError> {
    match cfg.packet_key() {
        Some(key) => PacketCipher::new(&key),
        None => Ok(None),
    }
}

// Adapts single-peer packet IO to the mux substrate: one chunk, one
// datagram.
struct DatagramChunks {
    io: Box<dyn PacketIo>,
}

#[async_trait]
impl SessionIo for DatagramChunks {
    async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.recv_packet(buf).await
    }

    async fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
        self.io.send_packet(buf)
    }

    fn close(&self) {
        self.io.close();
    }

    fn local_addr(&self) -> SocketAddr {
        self.io.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.io.peer_addr())
    }
}

/// Dial a UDP-mux connection over the given endpoint.
pub async fn dial(
    addr: SocketAddr,
    cfg: &UdpConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxConn, PaqetError> {
    let cipher = packet_cipher(cfg)?;
    let io = DatagramChunks {
        io: Box::new(DialIo::new(sock, addr, cipher)),
    };
    let mux = MuxSession::new(Arc::new(io), mux_config(cfg), true);

    tracing::debug!("UDP connection established to {} with mux", addr);
    Ok(Box::new(UdpConn { mux }))
}

/// Listen for UDP-mux connections on the given endpoint.
pub fn listen(
    cfg: &UdpConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxListener, PaqetError> {
    let cipher = packet_cipher(cfg)?.map(Arc::new);
    let demux = Demux::new(sock, cipher);
    tracing::debug!("UDP listener started with packet demuxing");
    Ok(Box::new(UdpListener {
        demux,
        cfg: cfg.clone(),
    }))
}

struct UdpConn {
    mux: MuxSession,
}

#[async_trait]
impl Conn for UdpConn {
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
    }

    fn local_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.mux.peer_addr()
    }
}

struct UdpListener {
    demux: Arc<Demux>,
    cfg: UdpConfig,
}

#[async_trait]
impl Listener for UdpListener {
    async fn accept(&self) -> Result<BoxConn, PaqetError> {
        let peer = self.demux.accept().await?;
        let addr = peer.addr;
        let io = DatagramChunks {
            io: Box::new(self.demux.peer_io(peer)),
        };
        let mux = MuxSession::new(Arc::new(io), mux_config(&self.cfg), false);

        tracing::debug!("accepted UDP peer {}", addr);
        Ok(Box::new(UdpConn { mux }))
    }

    async fn close(&self) {
        self.demux.close();
    }

    fn local_addr(&self) -> SocketAddr {
        self.demux.local_addr()
    }
}
