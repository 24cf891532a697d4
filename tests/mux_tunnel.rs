//! Stream mux behaviour over an in-memory tunnel
//!
//! Exercises the loopback echo shape end-to-end at the stream layer: a
//! protocol header followed by a megabyte of payload, echoed back intact.

mod common;

use paqet::protocol::Frame;
use paqet::tnet::Addr;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_loopback_echo_one_megabyte() {
    let (client, server) = common::mux_session_pair();

    // Echo server: accept the stream, read the target header, echo bytes.
    let echo = tokio::spawn(async move {
        let mut strm = server.accept_strm().await.unwrap();
        let frame = Frame::read(&mut strm).await.unwrap();
        assert_eq!(frame, Frame::Tcp(Addr::parse("127.0.0.1:9").unwrap()));

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = strm.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            strm.write_all(&buf[..n]).await.unwrap();
        }
        server
    });

    let mut payload = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let mut strm = client.open_strm().await.unwrap();
    Frame::Tcp(Addr::parse("127.0.0.1:9").unwrap())
        .write(&mut strm)
        .await
        .unwrap();

    let expected = payload.clone();
    let (mut rd, mut wr) = tokio::io::split(strm);
    let writer = tokio::spawn(async move {
        wr.write_all(&payload).await.unwrap();
        wr.shutdown().await.unwrap();
        wr
    });

    let mut got = vec![0u8; expected.len()];
    rd.read_exact(&mut got).await.unwrap();
    assert_eq!(got, expected);

    drop(writer.await.unwrap());
    drop(echo.await.unwrap());
}

#[tokio::test]
async fn test_ping_pong_exchange() {
    let (client, server) = common::mux_session_pair();

    let responder = tokio::spawn(async move {
        let mut strm = server.accept_strm().await.unwrap();
        if Frame::read(&mut strm).await.unwrap() == Frame::Ping {
            Frame::Pong.write(&mut strm).await.unwrap();
        }
        server
    });

    let mut strm = client.open_strm().await.unwrap();
    Frame::Ping.write(&mut strm).await.unwrap();
    assert_eq!(Frame::read(&mut strm).await.unwrap(), Frame::Pong);

    drop(responder.await.unwrap());
}

#[tokio::test]
async fn test_many_concurrent_streams() {
    let (client, server) = common::mux_session_pair();

    let acceptor = tokio::spawn(async move {
        let mut handles = Vec::new();
        for _ in 0..16 {
            let mut strm = server.accept_strm().await.unwrap();
            handles.push(tokio::spawn(async move {
                let mut buf = [0u8; 8];
                strm.read_exact(&mut buf).await.unwrap();
                strm.write_all(&buf).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        server
    });

    let mut tasks = Vec::new();
    for i in 0u64..16 {
        let mut strm = client.open_strm().await.unwrap();
        tasks.push(tokio::spawn(async move {
            let msg = i.to_be_bytes();
            strm.write_all(&msg).await.unwrap();
            let mut back = [0u8; 8];
            strm.read_exact(&mut back).await.unwrap();
            assert_eq!(back, msg);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    drop(acceptor.await.unwrap());
}
