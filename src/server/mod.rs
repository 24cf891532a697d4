//! Server session core
//!
//! Accepts transport connections (all configured transports in auto mode,
//! demultiplexed by the tag byte), reads exactly one protocol frame per
//! stream, and dispatches: TCP targets get dialed and piped, UDP targets
//! attach to the shared egress pool (DNS excepted), pings are answered,
//! fingerprint advertisements feed the packet crafting state.

mod udp;

pub(crate) use udp::SharedUdpPool;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::PaqetError;
use crate::protocol::Frame;
use crate::socket::PacketConn;
use crate::tnet::{BoxListener, BoxStrm, Conn, DatagramSocket, Strm};
use crate::transport;

/// Deadline for dialing a TCP target.
const TCP_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the first protocol frame on an accepted stream.
const FRAME_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// The server session.
pub struct Server {
    pconn: Arc<PacketConn>,
    udp_pool: SharedUdpPool,
    cancel: CancellationToken,
}

/// Run the server role until shutdown.
pub async fn run(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    let pconn = PacketConn::new(&cfg.network).context("opening packet endpoint")?;
    let sock: Arc<dyn DatagramSocket> = Arc::new(pconn.clone());

    let listeners =
        transport::listen(&cfg.transport, sock).context("starting transport listeners")?;

    let server = Arc::new(Server {
        pconn: pconn.clone(),
        udp_pool: SharedUdpPool::new(),
        cancel: shutdown.clone(),
    });

    tracing::info!(
        "Server started on {} port {} (protocol: {}, {} listener(s))",
        cfg.network.interface,
        pconn.port(),
        cfg.transport.protocol.name(),
        listeners.len()
    );

    for listener in listeners {
        tokio::spawn(accept_loop(server.clone(), listener));
    }

    shutdown.cancelled().await;
    pconn.close().await;
    tracing::info!("server shutdown complete");
    Ok(())
}

async fn accept_loop(server: Arc<Server>, listener: BoxListener) {
    loop {
        let conn = tokio::select! {
            _ = server.cancel.cancelled() => {
                listener.close().await;
                return;
            }
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!("listener closed: {}", e);
                    return;
                }
            },
        };
        let conn: Arc<dyn Conn> = Arc::from(conn);
        tracing::info!(
            "accepted connection from {}",
            conn.remote_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "<unknown>".into())
        );
        tokio::spawn(conn_loop(server.clone(), conn));
    }
}

async fn conn_loop(server: Arc<Server>, conn: Arc<dyn Conn>) {
    loop {
        let strm = tokio::select! {
            _ = server.cancel.cancelled() => {
                conn.close().await;
                return;
            }
            res = conn.accept_strm() => match res {
                Ok(strm) => strm,
                Err(e) => {
                    tracing::debug!("connection ended: {}", e);
                    return;
                }
            },
        };
        tokio::spawn(handle_strm(server.clone(), conn.clone(), strm));
    }
}

// One protocol frame decides what the stream carries; protocol errors
// close the stream and nothing else.
async fn handle_strm(server: Arc<Server>, conn: Arc<dyn Conn>, mut strm: BoxStrm) {
    let frame = match tokio::time::timeout(FRAME_READ_TIMEOUT, Frame::read(&mut strm)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            tracing::debug!("bad protocol frame: {}", e);
            let _ = strm.shutdown().await;
            return;
        }
        Err(_) => {
            tracing::debug!("timed out waiting for protocol frame");
            let _ = strm.shutdown().await;
            return;
        }
    };

    let result = match frame {
        Frame::Ping => handle_ping(strm).await,
        Frame::Pong => Ok(()),
        Frame::Tcpf(flags) => {
            if let Some(peer) = conn.remote_addr() {
                tracing::debug!("recording {} flag profiles for {}", flags.len(), peer);
                server.pconn.set_client_tcpf(peer, flags);
            }
            Ok(())
        }
        Frame::Tcp(addr) => {
            let sid = strm.sid();
            tracing::info!("accepted TCP stream {}: -> {}", sid, addr);
            handle_tcp(strm, &addr.to_string(), sid).await
        }
        Frame::Udp(addr) => {
            let sid = strm.sid();
            tracing::info!("accepted UDP stream {}: -> {}", sid, addr);
            if addr.port == 53 {
                udp::handle_direct(strm, &addr.to_string(), sid).await
            } else {
                udp::handle_shared(&server.udp_pool, strm, &addr.to_string(), sid).await
            }
        }
    };

    if let Err(e) = result {
        tracing::debug!("stream handler ended: {}", e);
    }
}

async fn handle_ping(mut strm: BoxStrm) -> Result<(), PaqetError> {
    Frame::Pong.write(&mut strm).await?;
    let _ = strm.shutdown().await;
    Ok(())
}

// Pipe the stream to a freshly dialed TCP socket until either side EOFs.
async fn handle_tcp(mut strm: BoxStrm, addr: &str, sid: u64) -> Result<(), PaqetError> {
    let mut sock = match tokio::time::timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(sock)) => sock,
        Ok(Err(e)) => {
            tracing::debug!("TCP dial {} for stream {} failed: {}", addr, sid, e);
            let _ = strm.shutdown().await;
            return Err(PaqetError::Io(e));
        }
        Err(_) => {
            tracing::debug!("TCP dial {} for stream {} timed out", addr, sid);
            let _ = strm.shutdown().await;
            return Err(PaqetError::Timeout(format!("dial {}", addr)));
        }
    };
    let _ = sock.set_nodelay(true);

    match tokio::io::copy_bidirectional(&mut strm, &mut sock).await {
        Ok((up, down)) => {
            tracing::debug!("TCP stream {} done: {} up, {} down", sid, up, down);
        }
        Err(e) => {
            tracing::debug!("TCP stream {} pipe ended: {}", sid, e);
        }
    }
    let _ = strm.shutdown().await;
    Ok(())
}
