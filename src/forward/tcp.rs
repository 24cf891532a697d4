//! TCP port forwarder
//!
//! Accepts local TCP connections and pipes each one through its own
//! tunnel stream opened with a TCP target header.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::tnet::Addr;

pub(crate) async fn run(
    client: Arc<Client>,
    listen: SocketAddr,
    target: Addr,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind TCP socket on {}: {}", listen, e);
            return;
        }
    };
    tracing::info!("TCP forwarder listening on {} -> {}", listen, target);

    loop {
        let (sock, caddr) = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => match res {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("TCP accept error on {}: {}", listen, e);
                    continue;
                }
            },
        };
        let client = client.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = pipe(client, sock, &target).await {
                tracing::debug!("TCP forward for {} ended: {}", caddr, e);
            }
        });
    }
}

async fn pipe(client: Arc<Client>, mut sock: TcpStream, target: &Addr) -> anyhow::Result<()> {
    let _ = sock.set_nodelay(true);
    let mut strm = client.open_tcp(target).await?;

    let (up, down) = tokio::io::copy_bidirectional(&mut sock, &mut strm).await?;
    tracing::debug!("TCP forward to {} done: {} up, {} down", target, up, down);
    let _ = strm.shutdown().await;
    Ok(())
}
