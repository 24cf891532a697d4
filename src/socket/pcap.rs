//! libpcap raw handle (portable capture backend)
//!
//! Compiled in behind the `pcap` cargo feature. Uses two libpcap handles on
//! the same interface: one for capture (filtered, promiscuous, immediate
//! mode) and one for injection, so reads and writes never contend on a
//! single handle.

#![cfg(feature = "pcap")]

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use pcap::{Active, Capture};

use super::handle::{Direction, RawHandle, RawInject, RawRead, POLL_TIMEOUT_MS};
use crate::config::NetworkConfig;
use crate::error::PaqetError;

const SNAP_LEN: i32 = 65536;

/// Open a libpcap handle pair on the configured interface.
pub fn open(cfg: &NetworkConfig, filter: &str, dir: Direction) -> Result<RawHandle, PaqetError> {
    let iface_mac = lookup_mac(&cfg.interface)?;

    let mut rx = Capture::from_device(cfg.interface.as_str())
        .map_err(|e| PaqetError::Socket(format!("pcap open {}: {}", cfg.interface, e)))?
        .promisc(true)
        .snaplen(SNAP_LEN)
        .buffer_size(cfg.pcap.sockbuf as i32)
        .immediate_mode(true)
        .timeout(POLL_TIMEOUT_MS)
        .open()
        .map_err(|e| PaqetError::Socket(format!("pcap activate {}: {}", cfg.interface, e)))?;

    rx.filter(filter, true)
        .map_err(|e| PaqetError::Socket(format!("pcap filter '{}': {}", filter, e)))?;
    let pcap_dir = match dir {
        Direction::In => pcap::Direction::In,
        Direction::Out => pcap::Direction::Out,
        Direction::InOut => pcap::Direction::InOut,
    };
    if let Err(e) = rx.direction(pcap_dir) {
        // Not supported everywhere (Npcap); the BPF filter already narrows
        // the capture, so this is not fatal.
        tracing::warn!("pcap set direction failed: {}", e);
    }

    let tx = Capture::from_device(cfg.interface.as_str())
        .map_err(|e| PaqetError::Socket(format!("pcap open {}: {}", cfg.interface, e)))?
        .snaplen(SNAP_LEN)
        .open()
        .map_err(|e| PaqetError::Socket(format!("pcap activate {}: {}", cfg.interface, e)))?;

    Ok(RawHandle {
        reader: Box::new(PcapReader { cap: rx }),
        injector: Arc::new(PcapInjector { cap: Mutex::new(tx) }),
        iface_mac,
    })
}

fn lookup_mac(interface: &str) -> Result<[u8; 6], PaqetError> {
    // libpcap does not expose link-layer addresses portably; read it from
    // sysfs on Linux and fall back to all-zero elsewhere (the user-space
    // direction filter then passes everything through, which only costs
    // duplicate frames already excluded by the port filter).
    #[cfg(target_os = "linux")]
    {
        let path = format!("/sys/class/net/{}/address", interface);
        if let Ok(text) = std::fs::read_to_string(&path) {
            if let Some(mac) = crate::config::parse_mac(text.trim()) {
                return Ok(mac);
            }
        }
    }
    let _ = interface;
    Ok([0u8; 6])
}

struct PcapReader {
    cap: Capture<Active>,
}

impl RawRead for PcapReader {
    fn read(&mut self) -> io::Result<Option<&[u8]>> {
        match self.cap.next_packet() {
            Ok(packet) => Ok(Some(packet.data)),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

struct PcapInjector {
    cap: Mutex<Capture<Active>>,
}

impl RawInject for PcapInjector {
    fn inject(&self, frame: &[u8]) -> io::Result<()> {
        self.cap
            .lock()
            .sendpacket(frame)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}
