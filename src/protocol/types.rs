//! In-band protocol frame types
//!
//! The first bytes written on every tunnel stream form exactly one protocol
//! frame selecting what the stream carries. After the frame, the initiator
//! switches to raw application bytes (TCP) or length-prefixed datagrams
//! (UDP).

use serde::{Deserialize, Serialize};

use crate::tnet::Addr;

/// Frame type byte for a ping request
pub const P_PING: u8 = 0x01;
/// Frame type byte for a ping reply
pub const P_PONG: u8 = 0x02;
/// Frame type byte for a TCP flag-profile advertisement
pub const P_TCPF: u8 = 0x03;
/// Frame type byte for a TCP target
pub const P_TCP: u8 = 0x04;
/// Frame type byte for a UDP target
pub const P_UDP: u8 = 0x05;

/// A single TCP header flag profile used for one crafted packet.
///
/// A cycle of profiles is advertised per flow with a `Tcpf` frame; the
/// receiving side echoes the cycle on its egress to that peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpFlags {
    /// FIN flag
    pub fin: bool,
    /// SYN flag
    pub syn: bool,
    /// RST flag
    pub rst: bool,
    /// PSH flag
    pub psh: bool,
    /// ACK flag
    pub ack: bool,
    /// URG flag
    pub urg: bool,
    /// ECE flag
    pub ece: bool,
    /// CWR flag
    pub cwr: bool,
    /// NS flag (ECN nonce, RFC 3540)
    pub ns: bool,
}

impl TcpFlags {
    /// PSH+ACK, the shape of an ordinary data-bearing segment
    pub fn psh_ack() -> Self {
        TcpFlags {
            psh: true,
            ack: true,
            ..Default::default()
        }
    }

    /// Bare ACK
    pub fn ack_only() -> Self {
        TcpFlags {
            ack: true,
            ..Default::default()
        }
    }

    /// Pack into the 2-byte wire form: byte 0 bits 0..7 carry
    /// FIN,SYN,RST,PSH,ACK,URG,ECE,CWR; byte 1 bit 0 carries NS.
    pub fn pack(&self) -> [u8; 2] {
        let mut b = [0u8; 2];
        if self.fin {
            b[0] |= 1 << 0;
        }
        if self.syn {
            b[0] |= 1 << 1;
        }
        if self.rst {
            b[0] |= 1 << 2;
        }
        if self.psh {
            b[0] |= 1 << 3;
        }
        if self.ack {
            b[0] |= 1 << 4;
        }
        if self.urg {
            b[0] |= 1 << 5;
        }
        if self.ece {
            b[0] |= 1 << 6;
        }
        if self.cwr {
            b[0] |= 1 << 7;
        }
        if self.ns {
            b[1] |= 1 << 0;
        }
        b
    }

    /// Unpack from the 2-byte wire form.
    pub fn unpack(b: [u8; 2]) -> Self {
        TcpFlags {
            fin: b[0] & (1 << 0) != 0,
            syn: b[0] & (1 << 1) != 0,
            rst: b[0] & (1 << 2) != 0,
            psh: b[0] & (1 << 3) != 0,
            ack: b[0] & (1 << 4) != 0,
            urg: b[0] & (1 << 5) != 0,
            ece: b[0] & (1 << 6) != 0,
            cwr: b[0] & (1 << 7) != 0,
            ns: b[1] & (1 << 0) != 0,
        }
    }
}

/// An in-band protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Ping request; the peer answers with `Pong` on the same stream
    Ping,
    /// Ping reply
    Pong,
    /// TCP flag-profile cycle advertisement
    Tcpf(Vec<TcpFlags>),
    /// Open a TCP relay to the given target
    Tcp(Addr),
    /// Open a UDP relay to the given target
    Udp(Addr),
}

impl Frame {
    /// The wire type byte for this frame.
    pub fn type_byte(&self) -> u8 {
        match self {
            Frame::Ping => P_PING,
            Frame::Pong => P_PONG,
            Frame::Tcpf(_) => P_TCPF,
            Frame::Tcp(_) => P_TCP,
            Frame::Udp(_) => P_UDP,
        }
    }
}
