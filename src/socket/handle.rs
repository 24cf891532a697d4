//! Raw capture/inject handle abstraction
//!
//! A handle is split into a reader half, which owns the capture cursor and
//! is moved into the endpoint's blocking reader task, and an inject half,
//! which is cheaply cloneable and safe to call from any task. Dropping the
//! reader releases the capture resources (for the AF_PACKET backend this
//! unmaps the ring), so the endpoint keeps the reader alive until its
//! reader task has observed shutdown.

use std::io;
use std::sync::Arc;

use crate::config::{NetworkConfig, PcapBackend};
use crate::error::PaqetError;

/// Poll timeout for capture reads. Bounds how long shutdown can take.
pub const POLL_TIMEOUT_MS: i32 = 200;

/// Which captured directions the reader yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only frames arriving from the wire
    In,
    /// Only frames we sent
    Out,
    /// Everything
    InOut,
}

/// Reader half of a raw handle.
pub trait RawRead: Send {
    /// Read the next frame matching the installed filter.
    ///
    /// Returns `Ok(None)` when the poll timeout expires with no frame; the
    /// caller treats that as "try again" and re-checks cancellation. The
    /// returned slice is only valid until the next call.
    fn read(&mut self) -> io::Result<Option<&[u8]>>;
}

/// Inject half of a raw handle.
pub trait RawInject: Send + Sync {
    /// Inject exactly the supplied bytes as one frame.
    fn inject(&self, frame: &[u8]) -> io::Result<()>;
}

/// An opened raw handle: reader, injector, and the interface MAC.
pub struct RawHandle {
    /// Reader half; moved into the endpoint reader task
    pub reader: Box<dyn RawRead>,
    /// Inject half
    pub injector: Arc<dyn RawInject>,
    /// MAC address of the capture interface
    pub iface_mac: [u8; 6],
}

/// Open a raw handle on the configured interface with a capture filter.
///
/// Backend `auto` prefers AF_PACKET (no libpcap dependency) and falls back
/// to the capture library when compiled in.
pub fn open(cfg: &NetworkConfig, filter: &str, dir: Direction) -> Result<RawHandle, PaqetError> {
    match cfg.pcap.backend {
        PcapBackend::Afpacket => {
            tracing::debug!("using AF_PACKET backend (explicit)");
            open_afpacket(cfg, filter, dir)
        }
        PcapBackend::Pcap => {
            tracing::debug!("using pcap backend (explicit)");
            open_pcap(cfg, filter, dir)
        }
        PcapBackend::Auto => match open_afpacket(cfg, filter, dir) {
            Ok(handle) => {
                tracing::debug!("using AF_PACKET backend (auto-selected)");
                Ok(handle)
            }
            Err(e) => {
                tracing::debug!("AF_PACKET unavailable ({}), falling back to pcap", e);
                open_pcap(cfg, filter, dir)
            }
        },
    }
}

#[cfg(target_os = "linux")]
fn open_afpacket(
    cfg: &NetworkConfig,
    filter: &str,
    dir: Direction,
) -> Result<RawHandle, PaqetError> {
    super::afpacket::open(cfg, filter, dir)
}

#[cfg(not(target_os = "linux"))]
fn open_afpacket(
    _cfg: &NetworkConfig,
    _filter: &str,
    _dir: Direction,
) -> Result<RawHandle, PaqetError> {
    Err(PaqetError::Socket(
        "AF_PACKET backend is only available on Linux".into(),
    ))
}

#[cfg(feature = "pcap")]
fn open_pcap(cfg: &NetworkConfig, filter: &str, dir: Direction) -> Result<RawHandle, PaqetError> {
    super::pcap::open(cfg, filter, dir)
}

#[cfg(not(feature = "pcap"))]
fn open_pcap(
    _cfg: &NetworkConfig,
    _filter: &str,
    _dir: Direction,
) -> Result<RawHandle, PaqetError> {
    Err(PaqetError::Socket(
        "pcap backend not compiled in (enable the 'pcap' feature)".into(),
    ))
}
