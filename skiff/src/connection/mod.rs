//! Per-connection tasks and the registration fan-in.
//!
//! Listener accepts and dialer successes both produce a [`Handshaked`]
//! stream into one bounded channel; a single registrar task validates
//! the peer and registers it with the model. Each registered
//! connection then runs three tasks:
//!
//! - a reader that decodes frames and dispatches them,
//! - a writer that exclusively owns the socket's write half and drains
//!   the peer's outbound queue (through the send limiter when one is
//!   configured),
//! - a keepalive pinger.
//!
//! Whichever task dies first tears the whole connection down and
//! unregisters it; outstanding block requests resolve as transient.

pub mod dialer;
pub mod listener;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsStream;

use crate::identity::NodeId;
use crate::limiter::Limiter;
use crate::model::{Model, PeerHandle, ServeError};
use crate::proto::{self, Message, ProtoError};

/// Keepalive send interval.
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// A connection with nothing readable for this long is dead.
const RECV_TIMEOUT: Duration = Duration::from_secs(300);

/// Outbound queue depth per connection. Senders block when it fills;
/// the reader task never sends directly, so this cannot deadlock.
const SEND_QUEUE: usize = 256;

/// A TLS stream that finished its handshake, with the peer identity
/// taken from the leaf certificate hash.
pub struct Handshaked {
    pub peer: NodeId,
    pub stream: TlsStream<TcpStream>,
    pub incoming: bool,
    pub remote_addr: SocketAddr,
}

/// Validate and register handshaked connections, one at a time.
///
/// `known` is the set of configured peers; anything else is turned
/// away here, after the handshake, because the certificate itself
/// carries no authority.
pub async fn run_registrar(
    model: Arc<Model>,
    known: HashSet<NodeId>,
    mut rx: mpsc::Receiver<Handshaked>,
    limiter: Option<Arc<Limiter>>,
) {
    while let Some(conn) = rx.recv().await {
        if conn.peer == model.id {
            tracing::warn!(addr = %conn.remote_addr, "Rejecting connection to myself");
            continue;
        }
        if !known.contains(&conn.peer) {
            tracing::warn!(
                peer = %conn.peer, addr = %conn.remote_addr,
                "Rejecting connection from unknown peer"
            );
            continue;
        }

        let (tx, outbound) = mpsc::channel(SEND_QUEUE);
        match model.add_connection(conn.peer, conn.incoming, tx).await {
            Ok(handle) => {
                tokio::spawn(run_connection(model.clone(), handle, conn, outbound, limiter.clone()));
            }
            Err(refused) => {
                tracing::info!(peer = %conn.peer, addr = %conn.remote_addr, "Connection refused: {refused}");
            }
        }
    }
}

/// Drive one registered connection until something ends it.
async fn run_connection(
    model: Arc<Model>,
    handle: Arc<PeerHandle>,
    conn: Handshaked,
    outbound: mpsc::Receiver<Message>,
    limiter: Option<Arc<Limiter>>,
) {
    let peer = handle.id;
    let generation = handle.generation;
    tracing::info!(peer = %peer, addr = %conn.remote_addr, incoming = conn.incoming, "Connection up");

    let (read_half, write_half) = tokio::io::split(conn.stream);
    let mut reader = tokio::spawn(read_loop(read_half, model.clone(), handle.clone()));
    let mut writer = tokio::spawn(write_loop(write_half, outbound, limiter));
    let pinger = tokio::spawn(ping_loop(handle.clone()));

    let reason = tokio::select! {
        r = &mut reader => r.unwrap_or_else(|_| "reader task failed".to_string()),
        w = &mut writer => w.unwrap_or_else(|_| "writer task failed".to_string()),
        _ = handle.wait_closed() => "dropped by model".to_string(),
    };

    reader.abort();
    writer.abort();
    pinger.abort();
    model.drop_connection(&peer, generation, &reason);
}

/// Decode and dispatch inbound frames. Returns the teardown reason.
async fn read_loop(
    mut stream: ReadHalf<TlsStream<TcpStream>>,
    model: Arc<Model>,
    handle: Arc<PeerHandle>,
) -> String {
    let peer = handle.id;
    loop {
        let msg = match timeout(RECV_TIMEOUT, proto::read_message(&mut stream)).await {
            Err(_) => return "receive timeout".to_string(),
            Ok(Err(ProtoError::Io(e))) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return "closed by peer".to_string();
            }
            Ok(Err(ProtoError::Io(e))) => return format!("read error: {e}"),
            Ok(Err(e)) => return format!("protocol error: {e}"),
            Ok(Ok(msg)) => msg,
        };

        match msg {
            Message::ClusterConfig {
                client_name,
                client_version,
                repos,
            } => {
                tracing::info!(
                    peer = %peer,
                    client = %format!("{client_name} {client_version}"),
                    repos = repos.len(),
                    "Peer cluster config"
                );
                model.handle_cluster_config(&peer, repos);
            }
            Message::Index { repo, records } => {
                if let Err(e) = model.handle_index(&peer, &repo, records, true) {
                    return format!("protocol error: {e}");
                }
            }
            Message::IndexUpdate { repo, records } => {
                if let Err(e) = model.handle_index(&peer, &repo, records, false) {
                    return format!("protocol error: {e}");
                }
            }
            Message::Request {
                id,
                repo,
                name,
                offset,
                size,
            } => {
                // Served off the reader task so a full outbound queue
                // can never wedge inbound processing.
                let model = model.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    serve_one(&model, &handle, id, repo, name, offset, size).await;
                });
            }
            Message::Response { id, data, error } => {
                let result = match error {
                    None => Ok(data),
                    Some(msg) => Err(crate::model::RequestError::Remote(msg)),
                };
                handle.resolve(id, result);
            }
            Message::Ping => {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle.send(Message::Pong).await;
                });
            }
            Message::Pong => handle.pong_received(),
            Message::Close { reason } => {
                return format!("closed by peer: {reason}");
            }
        }
    }
}

/// Answer one block request. Violations cost the peer its connection;
/// everything else becomes an error response.
async fn serve_one(
    model: &Arc<Model>,
    handle: &Arc<PeerHandle>,
    id: u64,
    repo: String,
    name: String,
    offset: u64,
    size: u32,
) {
    let response = match model
        .request_block(&handle.id, &repo, &name, offset, size)
        .await
    {
        Ok(data) => Message::Response {
            id,
            data,
            error: None,
        },
        Err(ServeError::Violation(v)) => {
            tracing::warn!(peer = %handle.id, repo = %repo, "Dropping peer: {v}");
            model.drop_peer(&handle.id, &v.to_string());
            return;
        }
        Err(e) => {
            tracing::debug!(peer = %handle.id, repo = %repo, name = %name, "Request failed: {e}");
            Message::Response {
                id,
                data: Vec::new(),
                error: Some(e.to_string()),
            }
        }
    };
    let _ = handle.send(response).await;
}

/// Exclusive owner of the write half: drains the outbound queue,
/// paced by the global send limiter when configured.
async fn write_loop(
    mut stream: WriteHalf<TlsStream<TcpStream>>,
    mut outbound: mpsc::Receiver<Message>,
    limiter: Option<Arc<Limiter>>,
) -> String {
    while let Some(msg) = outbound.recv().await {
        let frame = match proto::encode_frame(&msg) {
            Ok(frame) => frame,
            Err(e) => return format!("encode error: {e}"),
        };
        if let Some(limiter) = &limiter {
            limiter.consume(frame.len()).await;
        }
        if let Err(e) = stream.write_all(&frame).await {
            return format!("write error: {e}");
        }
        if let Err(e) = stream.flush().await {
            return format!("flush error: {e}");
        }
    }
    let _ = stream.shutdown().await;
    "writer queue closed".to_string()
}

/// Keepalive, doubling as the index acknowledgment probe: frames are
/// delivered in order, so the pong answering a ping confirms receipt
/// of every index record queued before it.
async fn ping_loop(handle: Arc<PeerHandle>) {
    loop {
        tokio::time::sleep(PING_INTERVAL).await;
        handle.ping_sent();
        if handle.send(Message::Ping).await.is_err() {
            return;
        }
    }
}
