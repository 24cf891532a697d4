//! Client UDP stream API and pool
//!
//! Flows that benefit from reuse (TUN, SOCKS) get one cached tunnel stream
//! per `(local, target)` pair; the forwarder opens uncached parallel
//! streams instead. Concurrent opens for the same key race through a
//! load-or-store: exactly one stream survives, the loser closes its own.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::buffer;
use crate::error::PaqetError;
use crate::protocol::Frame;
use crate::tnet::{Addr, BoxStrm, Strm};

use super::Client;

/// Pool key for a `(local, target)` flow.
pub fn flow_key(local: &str, target: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    local.hash(&mut hasher);
    target.hash(&mut hasher);
    hasher.finish()
}

/// A pooled UDP tunnel stream, shareable across tasks.
#[derive(Clone)]
pub struct UdpStrm {
    key: u64,
    sid: u64,
    strm: Arc<Mutex<BoxStrm>>,
}

impl UdpStrm {
    fn new(key: u64, strm: BoxStrm) -> Self {
        UdpStrm {
            key,
            sid: strm.sid(),
            strm: Arc::new(Mutex::new(strm)),
        }
    }

    /// The pool key this stream is cached under.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// The underlying stream id.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Whether two handles refer to the same pooled stream.
    pub fn same_as(&self, other: &UdpStrm) -> bool {
        Arc::ptr_eq(&self.strm, &other.strm)
    }

    /// Write one datagram as a length-prefixed frame.
    pub async fn write_frame(&self, data: &[u8]) -> io::Result<()> {
        let mut strm = self.strm.lock().await;
        buffer::write_udp_frame(&mut *strm, data).await
    }

    /// Read one length-prefixed datagram.
    pub async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut strm = self.strm.lock().await;
        buffer::read_udp_frame(&mut *strm, buf).await
    }

    async fn shutdown(&self) {
        let mut strm = self.strm.lock().await;
        let _ = strm.shutdown().await;
    }
}

/// Pool of cached UDP streams keyed by flow.
pub(crate) struct UdpPool {
    strms: DashMap<u64, UdpStrm>,
}

impl UdpPool {
    pub(crate) fn new() -> Self {
        UdpPool {
            strms: DashMap::new(),
        }
    }

    fn get(&self, key: u64) -> Option<UdpStrm> {
        self.strms.get(&key).map(|e| e.clone())
    }

    // Load-or-store: the returned stream is the pool's; when it is not
    // `ours`, the caller lost the race.
    fn load_or_store(&self, key: u64, ours: UdpStrm) -> UdpStrm {
        self.strms.entry(key).or_insert(ours).clone()
    }

    fn remove(&self, key: u64) -> Option<UdpStrm> {
        self.strms.remove(&key).map(|(_, s)| s)
    }

    pub(crate) fn invalidate_all(&self) {
        let keys: Vec<u64> = self.strms.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some(strm) = self.remove(key) {
                tokio::spawn(async move { strm.shutdown().await });
            }
        }
        tracing::debug!("UDP stream pool invalidated");
    }
}

impl Client {
    /// A cached UDP stream for the `(local, target)` flow.
    ///
    /// Returns the stream, whether this call created it, and its pool key.
    /// Concurrent calls with the same arguments all end up on the same
    /// stream.
    pub async fn udp(
        &self,
        local: &str,
        target: &Addr,
    ) -> Result<(UdpStrm, bool), PaqetError> {
        let key = flow_key(local, &target.to_string());
        if let Some(strm) = self.udp_pool.get(key) {
            tracing::debug!(
                "reusing UDP stream {} for {} -> {}",
                strm.sid(),
                local,
                target
            );
            return Ok((strm, false));
        }

        let strm = self.udp_new(target).await?;
        let ours = UdpStrm::new(key, strm);

        let winner = self.udp_pool.load_or_store(key, ours.clone());
        if !winner.same_as(&ours) {
            // Lost the race: close our stream, use the existing one.
            ours.shutdown().await;
            tracing::debug!(
                "reusing UDP stream {} for {} -> {} (concurrent insert)",
                winner.sid(),
                local,
                target
            );
            return Ok((winner, false));
        }

        tracing::debug!(
            "established UDP stream {} for {} -> {}",
            ours.sid(),
            local,
            target
        );
        Ok((ours, true))
    }

    /// A fresh, uncached UDP stream to `target`. The forwarder uses these
    /// for parallel streams per flow.
    pub async fn udp_new(&self, target: &Addr) -> Result<BoxStrm, PaqetError> {
        let mut strm = self.new_strm().await?;
        if let Err(e) = Frame::Udp(target.clone()).write(&mut strm).await {
            let _ = strm.shutdown().await;
            return Err(e.into());
        }
        Ok(strm)
    }

    /// Close and forget the cached stream under `key`.
    pub async fn close_udp(&self, key: u64) {
        if let Some(strm) = self.udp_pool.remove(key) {
            tracing::debug!("closing UDP session stream {}", strm.sid());
            strm.shutdown().await;
        } else {
            tracing::debug!("UDP session key {} not found for close", key);
        }
    }

    /// Close an uncached stream from [`udp_new`](Client::udp_new).
    pub async fn close_udp_strm(&self, mut strm: BoxStrm) {
        let _ = strm.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tnet::strm_testing::strm_pair;

    #[test]
    fn test_flow_key_stable_and_distinct() {
        let a = flow_key("10.0.0.1:500", "1.1.1.1:53");
        assert_eq!(a, flow_key("10.0.0.1:500", "1.1.1.1:53"));
        assert_ne!(a, flow_key("10.0.0.1:501", "1.1.1.1:53"));
        assert_ne!(a, flow_key("10.0.0.1:500", "1.1.1.1:54"));
    }

    fn pooled(key: u64, sid: u64) -> UdpStrm {
        let (ours, _theirs) = strm_pair(sid);
        UdpStrm::new(key, Box::new(ours))
    }

    #[tokio::test]
    async fn test_pool_load_or_store_single_winner() {
        let pool = UdpPool::new();
        let key = flow_key("10.0.0.1:500", "10.0.0.9:4789");

        let a = pooled(key, 1);
        let b = pooled(key, 2);

        let first = pool.load_or_store(key, a.clone());
        let second = pool.load_or_store(key, b.clone());

        // Exactly one stream survives and every caller sees it.
        assert!(first.same_as(&a));
        assert!(second.same_as(&a));
        assert!(!second.same_as(&b));
        assert_eq!(pool.strms.len(), 1);
    }

    #[tokio::test]
    async fn test_pool_remove_and_invalidate() {
        let pool = UdpPool::new();
        let k1 = flow_key("a", "b");
        let k2 = flow_key("c", "d");
        pool.load_or_store(k1, pooled(k1, 1));
        pool.load_or_store(k2, pooled(k2, 2));
        assert_eq!(pool.strms.len(), 2);

        assert!(pool.remove(k1).is_some());
        assert!(pool.remove(k1).is_none());
        assert_eq!(pool.strms.len(), 1);

        pool.invalidate_all();
        assert_eq!(pool.strms.len(), 0);
    }

    #[tokio::test]
    async fn test_pooled_frames_roundtrip() {
        let (ours, mut theirs) = strm_pair(5);
        let strm = UdpStrm::new(7, Box::new(ours));
        assert_eq!(strm.key(), 7);
        assert_eq!(strm.sid(), 5);

        strm.write_frame(b"through the pool").await.unwrap();
        let mut buf = vec![0u8; 64];
        let n = crate::buffer::read_udp_frame(&mut theirs, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"through the pool");
    }
}
