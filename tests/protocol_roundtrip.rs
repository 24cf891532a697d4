//! In-band protocol and framing round-trips

mod common;

use paqet::buffer::{read_udp_frame, write_udp_frame};
use paqet::protocol::{Frame, TcpFlags};
use paqet::tnet::Addr;
use rand::Rng;
use std::io::Cursor;

async fn roundtrip(frame: &Frame) -> Frame {
    let mut buf = Vec::new();
    frame.encode(&mut buf).unwrap();
    Frame::read(&mut Cursor::new(buf)).await.unwrap()
}

#[tokio::test]
async fn test_every_frame_kind_roundtrips() {
    let frames = vec![
        Frame::Ping,
        Frame::Pong,
        Frame::Tcpf(vec![TcpFlags::psh_ack(), TcpFlags::ack_only()]),
        Frame::Tcp(Addr::parse("93.184.216.34:443").unwrap()),
        Frame::Tcp(Addr::parse("[2606:2800:220:1::1]:80").unwrap()),
        Frame::Tcp(Addr {
            host: "example.invalid".into(),
            port: 65535,
        }),
        Frame::Udp(Addr::parse("10.0.0.1:4789").unwrap()),
        Frame::Udp(Addr {
            host: "dns.example".into(),
            port: 53,
        }),
    ];
    for frame in frames {
        assert_eq!(roundtrip(&frame).await, frame);
    }
}

#[tokio::test]
async fn test_random_tcpf_roundtrips() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let count = rng.gen_range(1..=5);
        let flags: Vec<TcpFlags> = (0..count)
            .map(|_| {
                TcpFlags::unpack([rng.gen::<u8>(), rng.gen::<u8>() & 0x01])
            })
            .collect();
        let frame = Frame::Tcpf(flags);
        assert_eq!(roundtrip(&frame).await, frame);
    }
}

#[tokio::test]
async fn test_frame_over_stream() {
    let (mut client, mut server) = common::create_mock_stream_pair();

    let frame = Frame::Tcp(Addr::parse("127.0.0.1:9").unwrap());
    frame.write(&mut client).await.unwrap();
    assert_eq!(Frame::read(&mut server).await.unwrap(), frame);
}

#[tokio::test]
async fn test_udp_framing_boundaries() {
    let (mut client, mut server) = common::create_mock_stream_pair();

    // Zero-length and maximum-length datagrams round-trip.
    write_udp_frame(&mut client, b"").await.unwrap();
    let max = vec![7u8; 65535];
    let writer = {
        let max = max.clone();
        tokio::spawn(async move {
            write_udp_frame(&mut client, &max).await.unwrap();
            client
        })
    };

    let mut buf = vec![0u8; 70000];
    assert_eq!(read_udp_frame(&mut server, &mut buf).await.unwrap(), 0);
    let n = read_udp_frame(&mut server, &mut buf).await.unwrap();
    assert_eq!(n, 65535);
    assert_eq!(&buf[..n], &max[..]);

    // One past the maximum is rejected before any write.
    let mut client = writer.await.unwrap();
    let err = write_udp_frame(&mut client, &vec![0u8; 65536])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}
