//! Test utilities shared across integration tests

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use paqet::tnet::mux::{MuxConfig, MuxSession, SessionIo};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// Create a pair of connected duplex streams.
pub fn create_mock_stream_pair() -> (DuplexStream, DuplexStream) {
    duplex(256 * 1024)
}

/// A mux substrate over an in-memory duplex pipe.
pub struct DuplexIo {
    read: tokio::sync::Mutex<ReadHalf<DuplexStream>>,
    write: tokio::sync::Mutex<WriteHalf<DuplexStream>>,
}

impl DuplexIo {
    pub fn new(stream: DuplexStream) -> Arc<Self> {
        let (read, write) = tokio::io::split(stream);
        Arc::new(DuplexIo {
            read: tokio::sync::Mutex::new(read),
            write: tokio::sync::Mutex::new(write),
        })
    }
}

#[async_trait]
impl SessionIo for DuplexIo {
    async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read.lock().await.read(buf).await
    }

    async fn write_chunk(&self, buf: &[u8]) -> io::Result<()> {
        let mut write = self.write.lock().await;
        write.write_all(buf).await?;
        write.flush().await
    }

    fn close(&self) {}

    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A connected pair of mux sessions over an in-memory pipe.
pub fn mux_session_pair() -> (MuxSession, MuxSession) {
    let (a, b) = create_mock_stream_pair();
    (
        MuxSession::new(DuplexIo::new(a), MuxConfig::default(), true),
        MuxSession::new(DuplexIo::new(b), MuxConfig::default(), false),
    )
}

/// Minimal valid client configuration document.
pub fn client_yaml(protocol: &str) -> String {
    format!(
        r#"
role: client
server:
  addr: "203.0.113.10:443"
network:
  interface: eth0
  ipv4:
    addr: "192.0.2.5:0"
    router_mac: "aa:bb:cc:dd:ee:ff"
transport:
  protocol: {protocol}
  {protocol}:
    key: "integration-test"
"#
    )
}
