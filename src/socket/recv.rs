//! Packet decoding engine
//!
//! Decodes captured frames as Ethernet -> IPv4|IPv6 -> TCP and extracts the
//! transport payload plus the sender's apparent address. Unsupported or
//! malformed layers are tolerated: the frame is simply dropped. Because the
//! capture filter binds the endpoint port, every frame that reaches us was
//! addressed to this endpoint.

use std::net::{IpAddr, SocketAddr};

use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, Ipv6Packet, TcpPacket,
};

/// Decode one captured frame.
///
/// Returns the TCP payload and the source address, or `None` when the frame
/// is not an intact TCP packet. Zero-length payloads (keepalive-shaped
/// segments) come back as empty slices; the caller drops them.
pub fn decode(frame: &[u8]) -> Option<(&[u8], SocketAddr)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;

    let (src_ip, tcp_bytes): (IpAddr, &[u8]) = match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            (IpAddr::V4(ip.src_addr()), ip.payload())
        }
        EthernetProtocol::Ipv6 => {
            let ip = Ipv6Packet::new_checked(eth.payload()).ok()?;
            if ip.next_header() != IpProtocol::Tcp {
                return None;
            }
            (IpAddr::V6(ip.src_addr()), ip.payload())
        }
        _ => return None,
    };

    let tcp = TcpPacket::new_checked(tcp_bytes).ok()?;
    let src = SocketAddr::new(src_ip, tcp.src_port());
    let header_len = tcp.header_len() as usize;
    if header_len > tcp_bytes.len() {
        return None;
    }
    Some((&tcp_bytes[header_len..], src))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TcpFlags;
    use crate::socket::fingerprint::PacketFingerprint;
    use crate::socket::send;

    fn fp() -> PacketFingerprint {
        PacketFingerprint {
            seq: 1,
            ack: 2,
            window: 65000,
            ttl: 64,
            tos: 0,
            flags: TcpFlags::psh_ack(),
            ts_val: 100,
            ts_ecr: 50,
            ip_id: 7,
        }
    }

    #[test]
    fn test_craft_then_decode_v4() {
        let payload = b"round trip payload";
        let frame = send::craft_v4(
            [1; 6],
            [2; 6],
            "192.0.2.1".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
            40000,
            443,
            &fp(),
            payload,
        );

        let (got, src) = decode(&frame).expect("frame should decode");
        assert_eq!(got, payload);
        assert_eq!(src, "192.0.2.1:40000".parse().unwrap());
    }

    #[test]
    fn test_craft_then_decode_v6() {
        let payload = b"v6 payload";
        let frame = send::craft_v6(
            [1; 6],
            [2; 6],
            "2001:db8::1".parse().unwrap(),
            "2001:db8::2".parse().unwrap(),
            50000,
            8443,
            &fp(),
            payload,
        );

        let (got, src) = decode(&frame).expect("frame should decode");
        assert_eq!(got, payload);
        assert_eq!(src, "[2001:db8::1]:50000".parse().unwrap());
    }

    #[test]
    fn test_empty_payload_decodes_empty() {
        let frame = send::craft_v4(
            [1; 6],
            [2; 6],
            "192.0.2.1".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
            1,
            2,
            &fp(),
            b"",
        );
        let (got, _) = decode(&frame).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_non_tcp_dropped() {
        // A minimal IPv4 UDP frame.
        let mut frame = vec![0u8; 14 + 20 + 8];
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame[14] = 0x45;
        frame[17] = 28; // total length
        frame[23] = 17; // UDP
        assert!(decode(&frame).is_none());
    }

    #[test]
    fn test_garbage_dropped() {
        assert!(decode(b"").is_none());
        assert!(decode(&[0u8; 10]).is_none());
        let mut arp = vec![0u8; 60];
        arp[12] = 0x08;
        arp[13] = 0x06;
        assert!(decode(&arp).is_none());
    }

    #[test]
    fn test_truncated_tcp_dropped() {
        let frame = send::craft_v4(
            [1; 6],
            [2; 6],
            "192.0.2.1".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
            1,
            2,
            &fp(),
            b"data",
        );
        // Cut into the TCP header.
        assert!(decode(&frame[..40]).is_none());
    }
}
