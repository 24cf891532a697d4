//! Protocol frame encoding and decoding
//!
//! Reads and writes the in-band stream header frames. All integers are
//! big-endian. Addresses use a compact binary form: one type byte
//! (0x01 IPv4, 0x02 IPv6, 0x03 hostname+length), the address bytes, then a
//! two-byte port.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{Frame, TcpFlags, P_PING, P_PONG, P_TCP, P_TCPF, P_UDP};
use crate::error::ProtocolError;
use crate::tnet::Addr;

const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_IPV6: u8 = 0x02;
const ADDR_TYPE_HOSTNAME: u8 = 0x03;

impl Frame {
    /// Read one protocol frame from the stream.
    pub async fn read<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Frame, ProtocolError> {
        let typ = r.read_u8().await?;
        match typ {
            P_PING => Ok(Frame::Ping),
            P_PONG => Ok(Frame::Pong),
            P_TCPF => Ok(Frame::Tcpf(read_tcpf(r).await?)),
            P_TCP => Ok(Frame::Tcp(read_addr(r).await?)),
            P_UDP => Ok(Frame::Udp(read_addr(r).await?)),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }

    /// Write this frame to the stream and flush it.
    pub async fn write<W: AsyncWrite + Unpin + ?Sized>(
        &self,
        w: &mut W,
    ) -> Result<(), ProtocolError> {
        let mut buf = Vec::with_capacity(8);
        self.encode(&mut buf)?;
        w.write_all(&buf).await?;
        w.flush().await?;
        Ok(())
    }

    /// Encode this frame into a byte buffer.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.push(self.type_byte());
        match self {
            Frame::Ping | Frame::Pong => {}
            Frame::Tcpf(flags) => {
                buf.extend_from_slice(&(flags.len() as u16).to_be_bytes());
                for f in flags {
                    buf.extend_from_slice(&f.pack());
                }
            }
            Frame::Tcp(addr) | Frame::Udp(addr) => encode_addr(addr, buf)?,
        }
        Ok(())
    }
}

async fn read_tcpf<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
) -> Result<Vec<TcpFlags>, ProtocolError> {
    let count = r.read_u16().await? as usize;
    let mut flags = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let mut packed = [0u8; 2];
        r.read_exact(&mut packed).await?;
        flags.push(TcpFlags::unpack(packed));
    }
    Ok(flags)
}

async fn read_addr<R: AsyncRead + Unpin + ?Sized>(r: &mut R) -> Result<Addr, ProtocolError> {
    let typ = r.read_u8().await?;
    let host = match typ {
        ADDR_TYPE_IPV4 => {
            let mut ip = [0u8; 4];
            r.read_exact(&mut ip).await?;
            IpAddr::from(ip).to_string()
        }
        ADDR_TYPE_IPV6 => {
            let mut ip = [0u8; 16];
            r.read_exact(&mut ip).await?;
            IpAddr::from(ip).to_string()
        }
        ADDR_TYPE_HOSTNAME => {
            let len = r.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            r.read_exact(&mut host).await?;
            String::from_utf8_lossy(&host).into_owned()
        }
        other => return Err(ProtocolError::UnknownAddrType(other)),
    };
    let port = r.read_u16().await?;
    Ok(Addr { host, port })
}

// Binary address form saves well over half the bytes of a textual encoding
// for IP targets.
fn encode_addr(addr: &Addr, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
    match addr.ip() {
        Some(IpAddr::V4(ip)) => {
            buf.push(ADDR_TYPE_IPV4);
            buf.extend_from_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            buf.push(ADDR_TYPE_IPV6);
            buf.extend_from_slice(&ip.octets());
        }
        None => {
            let host = addr.host.as_bytes();
            if host.is_empty() {
                return Err(ProtocolError::NilAddr);
            }
            if host.len() > 255 {
                return Err(ProtocolError::HostnameTooLong(host.len()));
            }
            buf.push(ADDR_TYPE_HOSTNAME);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host);
        }
    }
    buf.extend_from_slice(&addr.port.to_be_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        Frame::read(&mut Cursor::new(buf)).await.unwrap()
    }

    #[tokio::test]
    async fn test_ping_pong_roundtrip() {
        for frame in [Frame::Ping, Frame::Pong] {
            let mut buf = Vec::new();
            frame.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), 1, "ping/pong frames are a single byte");
            assert_eq!(roundtrip(&frame).await, frame);
        }
    }

    #[tokio::test]
    async fn test_tcp_ipv4_roundtrip() {
        let frame = Frame::Tcp(Addr::parse("93.184.216.34:443").unwrap());
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        // type + addr-type + 4 ip + 2 port
        assert_eq!(buf.len(), 8);
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_tcp_ipv6_roundtrip() {
        let frame = Frame::Tcp(Addr::parse("[2606:2800:220:1::1]:80").unwrap());
        let mut buf = Vec::new();
        frame.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_udp_hostname_roundtrip() {
        let frame = Frame::Udp(Addr {
            host: "example.invalid".into(),
            port: 65535,
        });
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_tcpf_roundtrip() {
        let frame = Frame::Tcpf(vec![
            TcpFlags::psh_ack(),
            TcpFlags::ack_only(),
            TcpFlags {
                ece: true,
                cwr: true,
                ns: true,
                ..Default::default()
            },
        ]);
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_tcpf_empty_roundtrip() {
        let frame = Frame::Tcpf(vec![]);
        assert_eq!(roundtrip(&frame).await, frame);
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let err = Frame::read(&mut Cursor::new(vec![0xff])).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(0xff)));
    }

    #[tokio::test]
    async fn test_unknown_addr_type_rejected() {
        let err = Frame::read(&mut Cursor::new(vec![P_TCP, 0x09]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAddrType(0x09)));
    }

    #[tokio::test]
    async fn test_truncated_frame_errors() {
        // PTCP with IPv4 marker but only two address bytes.
        let err = Frame::read(&mut Cursor::new(vec![P_TCP, ADDR_TYPE_IPV4, 1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[tokio::test]
    async fn test_empty_host_rejected() {
        let frame = Frame::Tcp(Addr {
            host: String::new(),
            port: 1,
        });
        let mut buf = Vec::new();
        assert!(matches!(
            frame.encode(&mut buf).unwrap_err(),
            ProtocolError::NilAddr
        ));
    }

    #[tokio::test]
    async fn test_long_hostname_rejected() {
        let frame = Frame::Tcp(Addr {
            host: "x".repeat(300),
            port: 1,
        });
        let mut buf = Vec::new();
        assert!(matches!(
            frame.encode(&mut buf).unwrap_err(),
            ProtocolError::HostnameTooLong(300)
        ));
    }

    #[tokio::test]
    async fn test_write_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::Udp(Addr::parse("10.0.0.1:4789").unwrap());
        frame.write(&mut client).await.unwrap();

        let received = Frame::read(&mut server).await.unwrap();
        assert_eq!(received, frame);
    }
}
