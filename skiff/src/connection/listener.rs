//! TLS listen loop: one task per configured listen address.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;

use crate::identity::NodeId;

use super::Handshaked;

/// How long an accepted socket gets to finish its TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop. Handshakes run concurrently; completed connections
/// flow into the registrar's fan-in channel. Binding failures are
/// fatal for this address; accept failures are transient.
pub async fn run(
    addr: String,
    tls: Arc<ServerConfig>,
    sink: mpsc::Sender<Handshaked>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Listening for peers");
    let acceptor = TlsAcceptor::from(tls);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(%addr, "Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let tls_stream = match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    tracing::debug!(addr = %remote_addr, "TLS handshake failed: {e}");
                    return;
                }
                Err(_) => {
                    tracing::debug!(addr = %remote_addr, "TLS handshake timed out");
                    return;
                }
            };

            let peer = match tls_stream.get_ref().1.peer_certificates() {
                Some([leaf, ..]) => NodeId::from_der(leaf.as_ref()),
                _ => {
                    tracing::debug!(addr = %remote_addr, "Peer presented no certificate");
                    return;
                }
            };

            let _ = sink
                .send(Handshaked {
                    peer,
                    stream: tls_stream.into(),
                    incoming: true,
                    remote_addr,
                })
                .await;
        });
    }
}
