//! Transport network layer
//!
//! Defines the transport abstraction every tunnel protocol implements: a
//! [`Conn`] multiplexes ordered reliable [`Strm`]s over one packet
//! endpoint, and a [`Listener`] accepts those connections on the server.
//! The concrete adapters (KCP, QUIC, UDP mux) live in submodules.

mod addr;
pub mod cipher;
pub(crate) mod io;
pub mod kcp;
pub mod mux;
pub mod quic;
pub mod udp;

pub use addr::Addr;

use std::io as stdio;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::PaqetError;
use crate::protocol::Frame;
use crate::socket::PacketConn;

/// How long a waited ping may take before the connection is considered
/// unhealthy.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A multiplexed tunnel stream: ordered, reliable bytes plus an id.
pub trait Strm: AsyncRead + AsyncWrite + Send + Unpin {
    /// Numeric stream id, unique within its connection.
    fn sid(&self) -> u64;
}

/// Boxed stream handed across the transport boundary.
pub type BoxStrm = Box<dyn Strm>;

/// A transport connection: a multiplexed session over one packet endpoint.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Open a new outbound stream.
    async fn open_strm(&self) -> Result<BoxStrm, PaqetError>;

    /// Accept the next inbound stream.
    async fn accept_strm(&self) -> Result<BoxStrm, PaqetError>;

    /// Close the connection and its endpoint.
    async fn close(&self);

    /// Local endpoint address.
    fn local_addr(&self) -> SocketAddr;

    /// Peer address, when the connection has a single peer.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Liveness probe.
    ///
    /// Opens a stream and writes a `Ping` frame. With `wait` the probe
    /// also requires a `Pong` back within [`PING_TIMEOUT`]; without it,
    /// a successful write is proof enough that the session accepts
    /// streams.
    async fn ping(&self, wait: bool) -> Result<(), PaqetError> {
        let mut strm = self.open_strm().await?;
        Frame::Ping.write(&mut strm).await?;
        if wait {
            let reply = tokio::time::timeout(PING_TIMEOUT, Frame::read(&mut strm))
                .await
                .map_err(|_| PaqetError::Timeout("ping timed out".into()))??;
            if reply != Frame::Pong {
                return Err(PaqetError::Connection(
                    "unexpected ping response type".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether this connection can carry unreliable datagrams.
    fn supports_datagrams(&self) -> bool {
        false
    }

    /// Send an unreliable datagram, when supported.
    async fn send_datagram(&self, _data: bytes::Bytes) -> Result<(), PaqetError> {
        Err(PaqetError::Transport("datagrams not supported".into()))
    }

    /// Receive an unreliable datagram, when supported.
    async fn recv_datagram(&self) -> Result<bytes::Bytes, PaqetError> {
        Err(PaqetError::Transport("datagrams not supported".into()))
    }
}

/// Boxed connection handed across the transport boundary.
pub type BoxConn = Box<dyn Conn>;

/// A transport listener accepting connections on the server side.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accept the next transport connection.
    async fn accept(&self) -> Result<BoxConn, PaqetError>;

    /// Stop listening and release the endpoint.
    async fn close(&self);

    /// Local endpoint address.
    fn local_addr(&self) -> SocketAddr;
}

/// Boxed listener.
pub type BoxListener = Box<dyn Listener>;

/// Datagram substrate the transports ride on.
///
/// Implemented by the raw [`PacketConn`] and by the auto-mode wrappers
/// that add or strip the protocol tag byte.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Poll for the next datagram.
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<stdio::Result<(usize, SocketAddr)>>;

    /// Send one datagram.
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> stdio::Result<usize>;

    /// Local address.
    fn local_addr(&self) -> SocketAddr;

    /// Tear down the socket. Must be idempotent.
    fn shutdown(&self);
}

/// Await the next datagram from a [`DatagramSocket`].
pub async fn recv_from(
    sock: &dyn DatagramSocket,
    buf: &mut [u8],
) -> stdio::Result<(usize, SocketAddr)> {
    std::future::poll_fn(|cx| sock.poll_recv_from(cx, buf)).await
}

#[cfg(test)]
pub(crate) mod strm_testing {
    //! In-memory streams for session-layer tests.

    use super::Strm;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    /// A duplex-backed stream with an id, standing in for a tunnel stream.
    pub(crate) struct DuplexStrm {
        inner: DuplexStream,
        sid: u64,
    }

    /// A connected pair of test streams sharing a stream id.
    pub(crate) fn strm_pair(sid: u64) -> (DuplexStrm, DuplexStrm) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        (
            DuplexStrm { inner: a, sid },
            DuplexStrm { inner: b, sid },
        )
    }

    impl Strm for DuplexStrm {
        fn sid(&self) -> u64 {
            self.sid
        }
    }

    impl AsyncRead for DuplexStrm {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for DuplexStrm {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }
}

impl DatagramSocket for std::sync::Arc<PacketConn> {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<stdio::Result<(usize, SocketAddr)>> {
        PacketConn::poll_recv_from(self, cx, buf)
    }

    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> stdio::Result<usize> {
        PacketConn::send_to(self, buf, dst)
    }

    fn local_addr(&self) -> SocketAddr {
        PacketConn::local_addr(self)
    }

    fn shutdown(&self) {
        let conn = self.clone();
        tokio::spawn(async move { conn.close().await });
    }
}
