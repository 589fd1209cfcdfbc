//! Outbound dial loop.
//!
//! Every reconnect interval, walk the configured peers: skip
//! ourselves and anyone already connected, gather candidate addresses
//! (static config entries, plus discovery when the entry is the
//! literal `dynamic`), and dial in order — the first address that
//! handshakes and proves the expected identity wins.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::config::{Config, DYNAMIC_ADDR, with_default_port};
use crate::discovery::Discovery;
use crate::identity::NodeId;
use crate::model::Model;

use super::Handshaked;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(
    model: Arc<Model>,
    cfg: Arc<Config>,
    tls: Arc<ClientConfig>,
    discovery: Arc<dyn Discovery>,
    sink: mpsc::Sender<Handshaked>,
) {
    let interval = Duration::from_secs(cfg.options.reconnect_interval_s.max(1));
    let connector = TlsConnector::from(tls);

    loop {
        for peer in &cfg.peers {
            if peer.id == model.id || model.connected_to(&peer.id) {
                continue;
            }

            let addrs: Vec<String> = peer
                .addresses
                .iter()
                .flat_map(|a| {
                    if a == DYNAMIC_ADDR {
                        discovery.lookup(&peer.id)
                    } else {
                        vec![a.clone()]
                    }
                })
                .map(|a| with_default_port(&a))
                .collect();

            for addr in addrs {
                match dial(&connector, &addr, &peer.id).await {
                    Ok(conn) => {
                        tracing::debug!(peer = %peer.id, %addr, "Dial succeeded");
                        let _ = sink.send(conn).await;
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer.id, %addr, "Dial failed: {e:#}");
                    }
                }
            }
        }
        // Jitter keeps a fleet of nodes from dialing in lockstep.
        let jitter = Duration::from_millis(rand::random::<u64>() % 500);
        tokio::time::sleep(interval + jitter).await;
    }
}

/// Connect, handshake, and verify that the presented certificate
/// hashes to the peer we meant to reach.
async fn dial(
    connector: &TlsConnector,
    addr: &str,
    expected: &NodeId,
) -> anyhow::Result<Handshaked> {
    let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .context("connect timed out")??;
    let remote_addr = tcp.peer_addr()?;

    let server_name = ServerName::try_from("skiff").expect("static name is valid");
    let stream = timeout(DIAL_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .context("handshake timed out")??;

    let peer = match stream.get_ref().1.peer_certificates() {
        Some([leaf, ..]) => NodeId::from_der(leaf.as_ref()),
        _ => anyhow::bail!("peer presented no certificate"),
    };
    if peer != *expected {
        anyhow::bail!("identity mismatch: expected {expected}, got {peer}");
    }

    Ok(Handshaked {
        peer,
        stream: stream.into(),
        incoming: false,
        remote_addr,
    })
}
