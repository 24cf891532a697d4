//! QUIC transport adapter
//!
//! A standard QUIC-TLS 1.3 session carried over the packet endpoint via
//! quinn's abstract socket interface. Identity comes either from a
//! cert/key pair on disk or is derived deterministically from the shared
//! key: both ends compute the identical self-signed Ed25519 certificate
//! (Ed25519 signing is deterministic, so the DER matches byte for byte)
//! and the client accepts exactly that certificate.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, TokioRuntime, UdpPoller, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::config::{derive_key, QuicConfig};
use crate::error::PaqetError;
use crate::tnet::{BoxConn, BoxListener, BoxStrm, Conn, DatagramSocket, Listener, Strm};

/// SNI both sides agree on when the identity is key-derived.
const SERVER_NAME: &str = "paqet";

// PKCS#8 v1 prefix for an Ed25519 private key; the 32-byte seed follows.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

fn transport_err(e: impl fmt::Display) -> PaqetError {
    PaqetError::Transport(e.to_string())
}

/// The deterministic identity: certificate plus private key, both derived
/// from the shared key.
fn derive_identity(
    key: &str,
) -> Result<(CertificateDer<'static>, PrivatePkcs8KeyDer<'static>), PaqetError> {
    let seed = derive_key(key);
    let mut pkcs8 = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + seed.len());
    pkcs8.extend_from_slice(&ED25519_PKCS8_PREFIX);
    pkcs8.extend_from_slice(&seed);
    let key_der = PrivatePkcs8KeyDer::from(pkcs8);

    let key_pair = rcgen::KeyPair::from_pkcs8_der_and_sign_algo(&key_der, &rcgen::PKCS_ED25519)
        .map_err(transport_err)?;

    let mut params =
        rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()]).map_err(transport_err)?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, SERVER_NAME);
    // Every field is fixed so both sides serialize the same DER.
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2124, 1, 1);
    params.serial_number = Some(rcgen::SerialNumber::from_slice(&seed[..16]));

    let cert = params.self_signed(&key_pair).map_err(transport_err)?;
    Ok((cert.der().clone(), key_der))
}

/// Load an identity from PEM files.
fn load_identity(
    cert_file: &str,
    key_file: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), PaqetError> {
    let cert_pem = std::fs::read(cert_file)
        .map_err(|e| PaqetError::Config(format!("reading {}: {}", cert_file, e)))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| PaqetError::Config(format!("parsing {}: {}", cert_file, e)))?;
    if certs.is_empty() {
        return Err(PaqetError::Config(format!("{}: no certificates", cert_file)));
    }

    let key_pem = std::fs::read(key_file)
        .map_err(|e| PaqetError::Config(format!("reading {}: {}", key_file, e)))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| PaqetError::Config(format!("parsing {}: {}", key_file, e)))?
        .ok_or_else(|| PaqetError::Config(format!("{}: no private key", key_file)))?;

    Ok((certs, key))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// Accepts exactly one certificate, by DER byte equality. Authentication is
// the shared key: only a peer that knows it can derive this certificate
// and its private key.
#[derive(Debug)]
struct PinnedVerifier {
    expected: CertificateDer<'static>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn transport_config(cfg: &QuicConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_concurrent_bidi_streams(VarInt::from_u32(cfg.max_streams));
    let idle = VarInt::from_u64(cfg.idle_timeout * 1000).unwrap_or(VarInt::from_u32(30_000));
    transport.max_idle_timeout(Some(idle.into()));
    transport.keep_alive_interval(Some(Duration::from_secs(10)));
    // Flow control: generous windows keep long fat tunnels busy.
    transport.stream_receive_window(clamp_varint(cfg.max_stream_window));
    transport.receive_window(clamp_varint(cfg.max_conn_window));
    transport.send_window(cfg.initial_conn_window);
    transport
}

fn clamp_varint(v: u64) -> VarInt {
    VarInt::from_u64(v).unwrap_or(VarInt::MAX)
}

fn server_crypto(cfg: &QuicConfig) -> Result<rustls::ServerConfig, PaqetError> {
    let (certs, key) = if !cfg.cert_file.is_empty() {
        load_identity(&cfg.cert_file, &cfg.key_file)?
    } else {
        let (cert, key) = derive_identity(&cfg.key)?;
        (vec![cert], PrivateKeyDer::Pkcs8(key))
    };

    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(transport_err)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(transport_err)?;
    crypto.alpn_protocols = vec![cfg.alpn.as_bytes().to_vec()];
    Ok(crypto)
}

fn client_crypto(cfg: &QuicConfig) -> Result<rustls::ClientConfig, PaqetError> {
    let expected = if !cfg.cert_file.is_empty() {
        let (certs, _) = load_identity(&cfg.cert_file, &cfg.key_file)?;
        certs.into_iter().next().unwrap()
    } else {
        derive_identity(&cfg.key)?.0
    };

    let provider = provider();
    let mut crypto = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(transport_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedVerifier { expected, provider }))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![cfg.alpn.as_bytes().to_vec()];
    Ok(crypto)
}

// quinn's view of the packet endpoint.
struct EndpointSocket {
    sock: Arc<dyn DatagramSocket>,
}

impl fmt::Debug for EndpointSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointSocket")
            .field("local_addr", &self.sock.local_addr())
            .finish()
    }
}

impl AsyncUdpSocket for EndpointSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        // Injection never blocks: packets go straight to the raw handle.
        Box::pin(AlwaysWritable)
    }

    fn try_send(&self, transmit: &Transmit<'_>) -> io::Result<()> {
        match transmit.segment_size {
            None => {
                self.sock.send_to(transmit.contents, transmit.destination)?;
            }
            Some(seg) => {
                for chunk in transmit.contents.chunks(seg) {
                    self.sock.send_to(chunk, transmit.destination)?;
                }
            }
        }
        Ok(())
    }

    fn poll_recv(
        &self,
        cx: &mut Context<'_>,
        bufs: &mut [io::IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());
        let buf: &mut [u8] = &mut bufs[0];
        match self.sock.poll_recv_from(cx, buf) {
            Poll::Ready(Ok((n, addr))) => {
                meta[0] = RecvMeta {
                    addr,
                    len: n,
                    stride: n,
                    ecn: None,
                    dst_ip: None,
                };
                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.sock.local_addr())
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct AlwaysWritable;

impl UdpPoller for AlwaysWritable {
    fn poll_writable(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn make_endpoint(
    sock: Arc<dyn DatagramSocket>,
    server: Option<quinn::ServerConfig>,
) -> Result<Endpoint, PaqetError> {
    Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        server,
        Arc::new(EndpointSocket { sock }),
        Arc::new(TokioRuntime),
    )
    .map_err(|e| PaqetError::Transport(format!("QUIC endpoint: {}", e)))
}

/// Dial a QUIC connection over the given endpoint.
pub async fn dial(
    addr: SocketAddr,
    cfg: &QuicConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxConn, PaqetError> {
    let crypto = client_crypto(cfg)?;
    let quic_crypto: QuicClientConfig = crypto
        .try_into()
        .map_err(|e| PaqetError::Transport(format!("QUIC TLS config: {:?}", e)))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(Arc::new(transport_config(cfg)));

    let endpoint = make_endpoint(sock.clone(), None)?;
    let conn = endpoint
        .connect_with(client_config, addr, SERVER_NAME)
        .map_err(|e| PaqetError::Transport(format!("QUIC connect: {}", e)))?
        .await
        .map_err(|e| PaqetError::Transport(format!("QUIC dial failed: {}", e)))?;

    tracing::debug!("QUIC connection established to {}", addr);
    Ok(Box::new(QuicConn {
        endpoint,
        conn,
        sock,
    }))
}

/// Listen for QUIC connections on the given endpoint.
pub fn listen(
    cfg: &QuicConfig,
    sock: Arc<dyn DatagramSocket>,
) -> Result<BoxListener, PaqetError> {
    let crypto = server_crypto(cfg)?;
    let quic_crypto: QuicServerConfig = crypto
        .try_into()
        .map_err(|e| PaqetError::Transport(format!("QUIC TLS config: {:?}", e)))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(Arc::new(transport_config(cfg)));

    let endpoint = make_endpoint(sock.clone(), Some(server_config))?;
    tracing::debug!("QUIC listener started");
    Ok(Box::new(QuicListener { endpoint, sock }))
}

struct QuicConn {
    endpoint: Endpoint,
    conn: quinn::Connection,
    sock: Arc<dyn DatagramSocket>,
}

#[async_trait]
impl Conn for QuicConn {
    async fn open_strm(&self) -> Result<BoxStrm, PaqetError> {
        let (send, recv) = self
            .conn
            .open_bi()
            .await
            .map_err(|e| PaqetError::Connection(format!("open stream: {}", e)))?;
        Ok(Box::new(QuicStrm { send, recv }))
    }

    async fn accept_strm(&self) -> Result<BoxStrm, PaqetError> {
        let (send, recv) = self
            .conn
            .accept_bi()
            .await
            .map_err(|e| PaqetError::Connection(format!("accept stream: {}", e)))?;
        Ok(Box::new(QuicStrm { send, recv }))
    }

    async fn close(&self) {
        self.conn.close(VarInt::from_u32(0), b"close");
        self.endpoint.close(VarInt::from_u32(0), b"close");
        self.sock.shutdown();
    }

    fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.conn.remote_address())
    }

    fn supports_datagrams(&self) -> bool {
        self.conn.max_datagram_size().is_some()
    }

    async fn send_datagram(&self, data: Bytes) -> Result<(), PaqetError> {
        self.conn
            .send_datagram(data)
            .map_err(|e| PaqetError::Transport(format!("datagram send: {}", e)))
    }

    async fn recv_datagram(&self) -> Result<Bytes, PaqetError> {
        self.conn
            .read_datagram()
            .await
            .map_err(|e| PaqetError::Transport(format!("datagram recv: {}", e)))
    }
}

struct QuicListener {
    endpoint: Endpoint,
    sock: Arc<dyn DatagramSocket>,
}

#[async_trait]
impl Listener for QuicListener {
    async fn accept(&self) -> Result<BoxConn, PaqetError> {
        loop {
            let incoming = self
                .endpoint
                .accept()
                .await
                .ok_or_else(|| PaqetError::Connection("QUIC endpoint closed".into()))?;
            match incoming.await {
                Ok(conn) => {
                    tracing::debug!("accepted QUIC peer {}", conn.remote_address());
                    return Ok(Box::new(QuicConn {
                        endpoint: self.endpoint.clone(),
                        conn,
                        sock: self.sock.clone(),
                    }));
                }
                Err(e) => {
                    // A failed handshake only burns that attempt.
                    tracing::debug!("QUIC handshake failed: {}", e);
                }
            }
        }
    }

    async fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"close");
        self.sock.shutdown();
    }

    fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }
}

struct QuicStrm {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl Strm for QuicStrm {
    fn sid(&self) -> u64 {
        self.send.id().index()
    }
}

impl AsyncRead for QuicStrm {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStrm {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Frame;
    use crate::tnet::io::testing::socket_pair;
    use crate::tnet::Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn cfg() -> QuicConfig {
        let mut cfg = QuicConfig {
            key: "quic-transport-test".into(),
            ..Default::default()
        };
        cfg.set_defaults();
        cfg
    }

    #[test]
    fn test_identity_is_deterministic() {
        let (cert_a, key_a) = derive_identity("shared-secret").unwrap();
        let (cert_b, key_b) = derive_identity("shared-secret").unwrap();
        assert_eq!(cert_a.as_ref(), cert_b.as_ref());
        assert_eq!(key_a.secret_pkcs8_der(), key_b.secret_pkcs8_der());

        let (cert_c, _) = derive_identity("another-secret").unwrap();
        assert_ne!(cert_a.as_ref(), cert_c.as_ref());
    }

    #[tokio::test]
    async fn test_dial_accept_stream_echo() {
        let server_addr = "10.0.0.9:443".parse().unwrap();
        let client_addr = "10.0.0.5:42000".parse().unwrap();
        let (ssock, csock) = socket_pair(server_addr, client_addr, None);
        let cfg = cfg();

        let listener = listen(&cfg, Arc::new(ssock)).unwrap();
        let accept = tokio::spawn(async move {
            let conn = listener.accept().await.unwrap();
            let mut strm = conn.accept_strm().await.unwrap();
            let frame = Frame::read(&mut strm).await.unwrap();
            assert_eq!(frame, Frame::Tcp(Addr::parse("127.0.0.1:9").unwrap()));
            let mut buf = [0u8; 5];
            strm.read_exact(&mut buf).await.unwrap();
            strm.write_all(&buf).await.unwrap();
            strm.flush().await.unwrap();
            conn
        });

        let client = dial(server_addr, &cfg, Arc::new(csock)).await.unwrap();
        let mut strm = client.open_strm().await.unwrap();
        Frame::Tcp(Addr::parse("127.0.0.1:9").unwrap())
            .write(&mut strm)
            .await
            .unwrap();
        strm.write_all(b"hello").await.unwrap();
        strm.flush().await.unwrap();

        let mut back = [0u8; 5];
        strm.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"hello");

        let _server_conn = accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_key_fails_handshake() {
        let server_addr = "10.0.0.9:443".parse().unwrap();
        let client_addr = "10.0.0.5:42001".parse().unwrap();
        let (ssock, csock) = socket_pair(server_addr, client_addr, None);

        let server_cfg = cfg();
        let mut client_cfg = cfg();
        client_cfg.key = "the wrong key".into();

        let _listener = listen(&server_cfg, Arc::new(ssock)).unwrap();
        let res = tokio::time::timeout(
            Duration::from_secs(10),
            dial(server_addr, &client_cfg, Arc::new(csock)),
        )
        .await;
        match res {
            Ok(Ok(_)) => panic!("handshake must not succeed across keys"),
            Ok(Err(_)) | Err(_) => {}
        }
    }
}
