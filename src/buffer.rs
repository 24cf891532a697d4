//! Length-prefixed UDP-over-stream framing
//!
//! UDP datagrams are carried over reliable streams as a 2-byte big-endian
//! length followed by the payload. This preserves datagram boundaries
//! end-to-end across QUIC streams and mux streams alike.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffer size used by UDP copy loops. Large enough for any single frame.
pub const UDP_BUF_SIZE: usize = 64 * 1024;

/// Buffer size used by TCP pipe loops.
pub const TCP_BUF_SIZE: usize = 128 * 1024;

/// Write a UDP datagram with a 2-byte big-endian length prefix.
///
/// Payloads larger than 65535 bytes are rejected before any bytes are
/// written, so a failed call never leaves a partial frame on the stream.
pub async fn write_udp_frame<W: AsyncWrite + Unpin + ?Sized>(
    w: &mut W,
    data: &[u8],
) -> io::Result<()> {
    if data.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("datagram too large: {} bytes", data.len()),
        ));
    }
    let header = (data.len() as u16).to_be_bytes();

    // Vectored write puts header and payload on the wire in one syscall
    // where the writer supports it; partial writes fall back to write_all.
    let slices = [io::IoSlice::new(&header), io::IoSlice::new(data)];
    let n = w.write_vectored(&slices).await?;
    if n < header.len() {
        w.write_all(&header[n..]).await?;
        w.write_all(data).await?;
    } else if n < header.len() + data.len() {
        w.write_all(&data[n - header.len()..]).await?;
    }
    Ok(())
}

/// Read a length-prefixed UDP datagram from a stream into `buf`.
///
/// Returns the payload length. `buf` must be large enough for the incoming
/// frame; an oversized frame yields `ErrorKind::InvalidData` without
/// consuming the payload.
pub async fn read_udp_frame<R: AsyncRead + Unpin + ?Sized>(
    r: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut header = [0u8; 2];
    r.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;
    if len > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds buffer of {}", len, buf.len()),
        ));
    }
    r.read_exact(&mut buf[..len]).await?;
    Ok(len)
}
