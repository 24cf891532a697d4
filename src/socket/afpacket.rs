//! AF_PACKET raw handle (Linux)
//!
//! Captures through a TPACKET_V2 memory-mapped RX ring and injects through
//! plain `send()` on the same socket. No libpcap dependency, which matters
//! for minimal containers. The ring is sized from `pcap.sockbuf`: 512 KiB
//! blocks of 4 KiB frames, clamped to 2-128 blocks.
//!
//! AF_PACKET has no native direction filtering; incoming-only capture is
//! implemented by comparing each frame's source MAC against the interface
//! MAC.

#![cfg(target_os = "linux")]

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use super::bpf;
use super::handle::{Direction, RawHandle, RawInject, RawRead, POLL_TIMEOUT_MS};
use crate::config::NetworkConfig;
use crate::error::PaqetError;

const FRAME_SIZE: usize = 4096;
const BLOCK_SIZE: usize = 512 * 1024;

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// Open an AF_PACKET handle on the configured interface.
pub fn open(cfg: &NetworkConfig, filter: &str, dir: Direction) -> Result<RawHandle, PaqetError> {
    let prog = bpf::compile(filter)?;

    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW,
            (libc::ETH_P_ALL as u16).to_be() as i32,
        )
    };
    if fd < 0 {
        return Err(PaqetError::Socket(format!(
            "failed to create AF_PACKET socket: {}",
            last_err()
        )));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let ifname = CString::new(cfg.interface.as_str())
        .map_err(|_| PaqetError::Config("interface name contains NUL".into()))?;
    let ifindex = unsafe { libc::if_nametoindex(ifname.as_ptr()) };
    if ifindex == 0 {
        return Err(PaqetError::Socket(format!(
            "failed to find network interface {}: {}",
            cfg.interface,
            last_err()
        )));
    }

    let iface_mac = interface_mac(&fd, &ifname)?;

    // Filter before bind so unfiltered frames never reach the ring.
    attach_filter(&fd, &prog)?;

    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
    sll.sll_ifindex = ifindex as i32;
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PaqetError::Socket(format!(
            "failed to bind AF_PACKET socket to {}: {}",
            cfg.interface,
            last_err()
        )));
    }

    set_promiscuous(&fd, ifindex)?;

    let ring = Ring::map(&fd, cfg.pcap.sockbuf)?;
    tracing::info!(
        "AF_PACKET: ring on {} with {} blocks ({} MB buffer)",
        cfg.interface,
        ring.block_count,
        (ring.block_count * BLOCK_SIZE) / (1024 * 1024)
    );

    let fd = Arc::new(fd);
    let reader = RingReader {
        fd: fd.clone(),
        ring,
        frame_idx: 0,
        pending_release: false,
        dir,
        iface_mac,
    };
    let injector = Injector { fd };

    Ok(RawHandle {
        reader: Box::new(reader),
        injector: Arc::new(injector),
        iface_mac,
    })
}

fn interface_mac(fd: &OwnedFd, ifname: &CString) -> Result<[u8; 6], PaqetError> {
    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = ifname.as_bytes_with_nul();
    for (dst, src) in req.ifr_name.iter_mut().zip(name_bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFHWADDR, &mut req) };
    if rc < 0 {
        return Err(PaqetError::Socket(format!(
            "failed to read interface MAC: {}",
            last_err()
        )));
    }
    let sa = unsafe { req.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().enumerate() {
        *byte = sa.sa_data[i] as u8;
    }
    Ok(mac)
}

fn attach_filter(fd: &OwnedFd, prog: &[bpf::Instruction]) -> Result<(), PaqetError> {
    // bpf::Instruction is layout-compatible with struct sock_filter.
    let fprog = libc::sock_fprog {
        len: prog.len() as u16,
        filter: prog.as_ptr() as *mut libc::sock_filter,
    };
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const libc::sock_fprog as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PaqetError::Socket(format!(
            "failed to attach BPF filter: {}",
            last_err()
        )));
    }
    Ok(())
}

fn set_promiscuous(fd: &OwnedFd, ifindex: libc::c_uint) -> Result<(), PaqetError> {
    let mreq = libc::packet_mreq {
        mr_ifindex: ifindex as i32,
        mr_type: libc::PACKET_MR_PROMISC as u16,
        mr_alen: 0,
        mr_address: [0; 8],
    };
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq as *const libc::packet_mreq as *const libc::c_void,
            std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(PaqetError::Socket(format!(
            "failed to enable promiscuous mode: {}",
            last_err()
        )));
    }
    Ok(())
}

struct Ring {
    base: *mut u8,
    len: usize,
    block_count: usize,
    frame_count: usize,
}

// The mapping is only touched from the reader task.
unsafe impl Send for Ring {}

impl Ring {
    fn map(fd: &OwnedFd, sockbuf: usize) -> Result<Ring, PaqetError> {
        let block_count = (sockbuf / BLOCK_SIZE).clamp(2, 128);
        let frames_per_block = BLOCK_SIZE / FRAME_SIZE;
        let frame_count = block_count * frames_per_block;

        let version = libc::tpacket_versions::TPACKET_V2 as u32;
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_VERSION,
                &version as *const _ as *const libc::c_void,
                std::mem::size_of_val(&version) as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(PaqetError::Socket(format!(
                "failed to set TPACKET_V2: {}",
                last_err()
            )));
        }

        let req = libc::tpacket_req {
            tp_block_size: BLOCK_SIZE as u32,
            tp_block_nr: block_count as u32,
            tp_frame_size: FRAME_SIZE as u32,
            tp_frame_nr: frame_count as u32,
        };
        let rc = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_RX_RING,
                &req as *const libc::tpacket_req as *const libc::c_void,
                std::mem::size_of::<libc::tpacket_req>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(PaqetError::Socket(format!(
                "failed to set up RX ring: {}",
                last_err()
            )));
        }

        let len = BLOCK_SIZE * block_count;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(PaqetError::Socket(format!(
                "failed to mmap RX ring: {}",
                last_err()
            )));
        }

        Ok(Ring {
            base: base as *mut u8,
            len,
            block_count,
            frame_count,
        })
    }

    unsafe fn frame_header(&self, idx: usize) -> *mut libc::tpacket2_hdr {
        self.base.add(idx * FRAME_SIZE) as *mut libc::tpacket2_hdr
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

struct RingReader {
    fd: Arc<OwnedFd>,
    ring: Ring,
    frame_idx: usize,
    pending_release: bool,
    dir: Direction,
    iface_mac: [u8; 6],
}

impl RingReader {
    // Hand the previously returned frame back to the kernel and advance.
    fn release_pending(&mut self) {
        if !self.pending_release {
            return;
        }
        unsafe {
            let hdr = self.ring.frame_header(self.frame_idx);
            std::ptr::write_volatile(&mut (*hdr).tp_status, libc::TP_STATUS_KERNEL as u32);
        }
        self.frame_idx = (self.frame_idx + 1) % self.ring.frame_count;
        self.pending_release = false;
    }

    fn poll_readable(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, POLL_TIMEOUT_MS) };
        if rc < 0 {
            let err = last_err();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        if rc > 0 && pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            return Err(io::Error::other("poll error on AF_PACKET socket"));
        }
        Ok(rc > 0)
    }

    fn wanted(&self, frame: &[u8]) -> bool {
        if self.dir == Direction::InOut || frame.len() < 14 {
            return true;
        }
        let outgoing = frame[6..12] == self.iface_mac;
        match self.dir {
            Direction::In => !outgoing,
            Direction::Out => outgoing,
            Direction::InOut => true,
        }
    }
}

impl RawRead for RingReader {
    fn read(&mut self) -> io::Result<Option<&[u8]>> {
        loop {
            self.release_pending();

            let (status, mac_off, snap_len) = unsafe {
                let hdr = self.ring.frame_header(self.frame_idx);
                (
                    std::ptr::read_volatile(&(*hdr).tp_status),
                    (*hdr).tp_mac as usize,
                    (*hdr).tp_snaplen as usize,
                )
            };

            if status & libc::TP_STATUS_USER as u32 == 0 {
                if !self.poll_readable()? {
                    return Ok(None);
                }
                continue;
            }

            let start = self.frame_idx * FRAME_SIZE + mac_off;
            if mac_off == 0 || start + snap_len > self.ring.len {
                // Malformed frame slot; release and move on.
                self.pending_release = true;
                continue;
            }
            self.pending_release = true;

            let frame =
                unsafe { std::slice::from_raw_parts(self.ring.base.add(start), snap_len) };
            if !self.wanted(frame) {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

struct Injector {
    fd: Arc<OwnedFd>,
}

impl RawInject for Injector {
    fn inject(&self, frame: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(last_err());
        }
        if rc as usize != frame.len() {
            return Err(io::Error::other("short write on AF_PACKET socket"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count_clamp() {
        // Mirrors the sizing arithmetic in Ring::map without a socket.
        let clamp = |sockbuf: usize| (sockbuf / BLOCK_SIZE).clamp(2, 128);
        assert_eq!(clamp(1024), 2);
        assert_eq!(clamp(8 * 1024 * 1024), 16);
        assert_eq!(clamp(16 * 1024 * 1024), 32);
        assert_eq!(clamp(100 * 1024 * 1024), 128);
    }

    #[test]
    fn test_instruction_matches_sock_filter_layout() {
        assert_eq!(
            std::mem::size_of::<bpf::Instruction>(),
            std::mem::size_of::<libc::sock_filter>()
        );
        assert_eq!(
            std::mem::align_of::<bpf::Instruction>(),
            std::mem::align_of::<libc::sock_filter>()
        );
    }
}
