//! The model: the single source of truth for reconciliation state.
//!
//! Owns the per-repository file-sets, the per-peer connection handles,
//! and the derived pull queues. All mutation flows through the
//! operations here; connection readers, scanners, and pull workers
//! hold an `Arc<Model>` and never touch each other's state directly.
//!
//! The model talks to connections purely through per-peer mpsc senders
//! (the writer task owns the socket half), which breaks the
//! model ↔ connection ownership cycle: dropping a peer's sender is what
//! ends its writer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Notify, mpsc, oneshot};
use unicode_normalization::UnicodeNormalization;

use crate::files::{FileRecord, FileSet, LocalUpdate};
use crate::identity::NodeId;
use crate::index_store;
use crate::proto::{Message, RepoAnnouncement};

/// How long a block request may stay outstanding before the worker
/// retries elsewhere.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Quiet interval for coalescing outbound index updates.
pub const FANOUT_QUIET: Duration = Duration::from_secs(1);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Peer behavior that costs it the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("reference to unknown repository {0}")]
    UnknownRepo(String),
    #[error("repository {0} is not shared with this peer")]
    Unauthorized(String),
    #[error("invalid name {0:?}")]
    BadName(String),
    #[error("block hash mismatch for {0}")]
    HashMismatch(String),
}

/// Failure answering a peer's block request. `Violation` drops the
/// connection; the rest become error responses and leave local state
/// untouched.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Violation(#[from] ProtocolViolation),
    #[error("no such file")]
    UnknownFile,
    #[error("no matching block")]
    NoSuchBlock,
    #[error("content changed on disk")]
    Changed,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Failure of an outstanding request from our side.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// Connection lost; another peer may hold the block.
    #[error("peer disconnected")]
    Transient,
    #[error("request timed out")]
    Timeout,
    /// The peer answered with an error message.
    #[error("peer replied: {0}")]
    Remote(String),
}

/// Why [`Model::add_connection`] turned a connection away.
#[derive(Debug, thiserror::Error)]
pub enum Refused {
    #[error("connection to self")]
    SelfConnection,
    #[error("already connected")]
    Duplicate,
}

/// Resolve a record name under a repository root. Rejects absolute
/// names and any traversal components.
pub fn name_to_path(root: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.starts_with('/') {
        return None;
    }
    let mut path = root.to_path_buf();
    for part in name.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return None;
        }
        path.push(part);
    }
    Some(path)
}

/// Open the file behind a record. Record names are NFC, but some
/// filesystems (macOS) store names decomposed; when the composed path
/// is missing, the decomposed rendering is tried before giving up.
async fn open_record_file(
    root: &Path,
    name: &str,
    path: &Path,
) -> Result<tokio::fs::File, io::Error> {
    match tokio::fs::File::open(path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let decomposed: String = name.nfd().collect();
            match name_to_path(root, &decomposed) {
                Some(alt) if decomposed != name => tokio::fs::File::open(&alt).await,
                _ => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

/// A pull job: one name, with its retry count.
#[derive(Debug, Clone)]
pub struct Job {
    pub name: String,
    pub attempts: u32,
}

/// FIFO queue of names to pull, with duplicate suppression and an
/// in-flight set so two workers never target the same name.
pub struct PullQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    queue: VecDeque<Job>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
}

impl PullQueue {
    pub fn new() -> Self {
        PullQueue {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Enqueue unless the name is already queued or being pulled.
    pub fn push(&self, name: String, attempts: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.queued.contains(&name) || inner.in_flight.contains(&name) {
                return;
            }
            inner.queued.insert(name.clone());
            inner.queue.push_back(Job { name, attempts });
        }
        self.notify.notify_one();
    }

    /// Take the next job, marking its name in-flight.
    pub async fn pop(&self) -> Job {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(job) = inner.queue.pop_front() {
                    inner.queued.remove(&job.name);
                    inner.in_flight.insert(job.name.clone());
                    return job;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release the in-flight claim once a job ends, whichever way.
    pub fn done(&self, name: &str) {
        self.inner.lock().in_flight.remove(name);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PullQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// One registered repository.
pub struct Repo {
    pub id: String,
    pub root: PathBuf,
    pub read_only: bool,
    /// Peers allowed to sync this repository.
    pub allowed: Vec<NodeId>,
    pub set: Mutex<FileSet>,
    pub queue: PullQueue,
}

/// Per-repo index-replication watermarks for one connection.
#[derive(Debug, Clone, Copy, Default)]
struct Watermarks {
    /// Highest `local_version` handed to this connection's writer.
    sent: u64,
    /// Highest `local_version` the peer has confirmed receiving.
    acked: u64,
}

/// Model-side handle to a live connection: the writer queue, the
/// outstanding-request table, and per-repo sent/acked watermarks.
pub struct PeerHandle {
    pub id: NodeId,
    pub generation: u64,
    tx: mpsc::Sender<Message>,
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, RequestError>>>>,
    watermarks: Mutex<HashMap<String, Watermarks>>,
    /// Sent marks captured when a keepalive ping went out; the pong
    /// promotes them to acked. Frames arrive in order, so the pong
    /// proves the peer processed everything queued before the ping.
    pending_ack: Mutex<Option<HashMap<String, u64>>>,
    /// Signalled when the model discards this connection, so its I/O
    /// tasks can tear the stream down.
    closed: Notify,
}

impl PeerHandle {
    /// Queue a message for the writer task. Fails once the writer is
    /// gone.
    pub async fn send(&self, msg: Message) -> Result<(), ()> {
        self.tx.send(msg).await.map_err(|_| ())
    }

    /// Issue a block request and await the (possibly out-of-order)
    /// response.
    pub async fn request(
        &self,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(id, reply_tx);

        let msg = Message::Request {
            id,
            repo: repo.to_string(),
            name: name.to_string(),
            offset,
            size,
        };
        if self.tx.send(msg).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(RequestError::Transient);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Transient),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Route an incoming response to its waiter. Unknown ids are
    /// stale (timed out) and dropped quietly.
    pub fn resolve(&self, id: u64, result: Result<Vec<u8>, RequestError>) {
        if let Some(waiter) = self.pending.lock().remove(&id) {
            let _ = waiter.send(result);
        } else {
            tracing::debug!(peer = %self.id, request = id, "Response for unknown request id");
        }
    }

    fn fail_all_pending(&self) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(RequestError::Transient));
        }
    }

    /// Resolves once the model has discarded this connection.
    pub async fn wait_closed(&self) {
        self.closed.notified().await;
    }

    /// Highest `local_version` sent to this peer for a repository.
    pub fn sent_watermark(&self, repo: &str) -> u64 {
        self.watermarks.lock().get(repo).map(|w| w.sent).unwrap_or(0)
    }

    /// Highest `local_version` the peer has acknowledged back for a
    /// repository.
    pub fn acked_watermark(&self, repo: &str) -> u64 {
        self.watermarks
            .lock()
            .get(repo)
            .map(|w| w.acked)
            .unwrap_or(0)
    }

    fn set_sent_watermark(&self, repo: &str, value: u64) {
        let mut marks = self.watermarks.lock();
        let entry = marks.entry(repo.to_string()).or_default();
        if value > entry.sent {
            entry.sent = value;
        }
    }

    /// Called when a keepalive ping is queued. Snapshots the current
    /// sent marks; an outstanding unanswered ping keeps its older
    /// snapshot so a late pong never over-acknowledges.
    pub fn ping_sent(&self) {
        let mut pending = self.pending_ack.lock();
        if pending.is_none() {
            let snapshot = self
                .watermarks
                .lock()
                .iter()
                .map(|(repo, w)| (repo.clone(), w.sent))
                .collect();
            *pending = Some(snapshot);
        }
    }

    /// Called when a pong arrives: everything sent before the
    /// matching ping has now been seen by the peer.
    pub fn pong_received(&self) {
        let Some(snapshot) = self.pending_ack.lock().take() else {
            return;
        };
        let mut marks = self.watermarks.lock();
        for (repo, sent) in snapshot {
            let entry = marks.entry(repo).or_default();
            if sent > entry.acked {
                entry.acked = sent;
            }
        }
    }
}

pub struct Model {
    pub id: NodeId,
    home: PathBuf,
    repos: RwLock<HashMap<String, Arc<Repo>>>,
    peers: Mutex<HashMap<NodeId, Arc<PeerHandle>>>,
    conn_generation: AtomicU64,
    dirty: Mutex<HashSet<String>>,
    dirty_notify: Notify,
}

impl Model {
    pub fn new(id: NodeId, home: PathBuf) -> Arc<Model> {
        Arc::new(Model {
            id,
            home,
            repos: RwLock::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            conn_generation: AtomicU64::new(0),
            dirty: Mutex::new(HashSet::new()),
            dirty_notify: Notify::new(),
        })
    }

    /// Register a repository. Idempotent: an existing registration
    /// with the same id is returned untouched.
    pub fn add_repo(
        &self,
        id: &str,
        root: &Path,
        read_only: bool,
        allowed: Vec<NodeId>,
    ) -> Arc<Repo> {
        let mut repos = self.repos.write();
        repos
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Repo {
                    id: id.to_string(),
                    root: root.to_path_buf(),
                    read_only,
                    allowed,
                    set: Mutex::new(FileSet::new(self.id)),
                    queue: PullQueue::new(),
                })
            })
            .clone()
    }

    pub fn repo(&self, id: &str) -> Option<Arc<Repo>> {
        self.repos.read().get(id).cloned()
    }

    pub fn repos(&self) -> Vec<Arc<Repo>> {
        self.repos.read().values().cloned().collect()
    }

    /// Seed a repository's local view from its persisted index. Must
    /// run before any connection is accepted.
    pub fn seed_repo(&self, id: &str, records: Vec<FileRecord>) {
        if let Some(repo) = self.repo(id) {
            repo.set.lock().seed_local(records);
        }
    }

    /// Merge a completed scan into the local view. Returns how many
    /// records actually changed content.
    pub fn scan_result(&self, repo_id: &str, records: Vec<FileRecord>) -> usize {
        let Some(repo) = self.repo(repo_id) else {
            return 0;
        };
        let mut changed = 0;
        {
            let mut set = repo.set.lock();
            for rec in records {
                if set.update_local(rec, now_ns()) == LocalUpdate::Changed {
                    changed += 1;
                }
            }
        }
        if changed > 0 {
            tracing::info!(repo = %repo_id, changed, "Scan produced changes");
            self.mark_dirty(repo_id);
        }
        changed
    }

    /// Merge a peer's `Index` (initial) or `IndexUpdate` into its view
    /// and enqueue whatever we now need.
    pub fn handle_index(
        &self,
        peer: &NodeId,
        repo_id: &str,
        records: Vec<FileRecord>,
        initial: bool,
    ) -> Result<(), ProtocolViolation> {
        let repo = self
            .repo(repo_id)
            .ok_or_else(|| ProtocolViolation::UnknownRepo(repo_id.to_string()))?;
        if !repo.allowed.contains(peer) {
            return Err(ProtocolViolation::Unauthorized(repo_id.to_string()));
        }
        for rec in &records {
            if name_to_path(Path::new("."), &rec.name).is_none()
                || !unicode_normalization::is_nfc(&rec.name)
            {
                return Err(ProtocolViolation::BadName(rec.name.clone()));
            }
        }

        let count = records.len();
        let mut jobs = Vec::new();
        {
            let mut set = repo.set.lock();
            let touched = if initial {
                set.replace_view(*peer, records)
            } else {
                set.merge_view(*peer, records)
            };
            for name in touched {
                if let Some(rec) = set.needs(&name) {
                    jobs.push((name, rec));
                }
            }
        }
        tracing::debug!(
            peer = %peer, repo = %repo_id, records = count, needed = jobs.len(), initial,
            "Merged index"
        );

        if repo.read_only {
            return Ok(());
        }

        // Directories land before the files inside them, deletions go
        // last with children before parents; files apply in version
        // order.
        let class = |r: &FileRecord| {
            if r.is_deleted() {
                2u8
            } else if r.is_directory() {
                0
            } else {
                1
            }
        };
        jobs.sort_by(|(an, a), (bn, b)| {
            class(a).cmp(&class(b)).then_with(|| match class(a) {
                0 => an.len().cmp(&bn.len()),
                2 => bn.len().cmp(&an.len()),
                _ => a.version.cmp(&b.version),
            })
        });
        for (name, _) in jobs {
            repo.queue.push(name, 0);
        }
        Ok(())
    }

    /// First message bookkeeping: log what the peer serves and warn
    /// about labels we do not share.
    pub fn handle_cluster_config(&self, peer: &NodeId, repos: Vec<RepoAnnouncement>) {
        for ann in repos {
            match self.repo(&ann.id) {
                Some(repo) if repo.allowed.contains(peer) => {
                    tracing::debug!(peer = %peer, repo = %ann.id, "Peer serves shared repository");
                }
                _ => {
                    tracing::warn!(peer = %peer, repo = %ann.id, "Peer announced repository we do not share with it");
                }
            }
        }
    }

    /// Serve one block to a peer, verified against the current local
    /// record before any bytes leave the disk.
    pub async fn request_block(
        &self,
        peer: &NodeId,
        repo_id: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, ServeError> {
        let repo = self
            .repo(repo_id)
            .ok_or_else(|| ProtocolViolation::UnknownRepo(repo_id.to_string()))?;
        if !repo.allowed.contains(peer) {
            return Err(ProtocolViolation::Unauthorized(repo_id.to_string()).into());
        }
        let path = name_to_path(&repo.root, name)
            .ok_or_else(|| ProtocolViolation::BadName(name.to_string()))?;

        let block = {
            let set = repo.set.lock();
            let rec = set.local(name).ok_or(ServeError::UnknownFile)?;
            if rec.is_deleted() || rec.is_directory() {
                return Err(ServeError::UnknownFile);
            }
            rec.blocks
                .iter()
                .find(|b| b.offset == offset && b.size == size)
                .cloned()
                .ok_or(ServeError::NoSuchBlock)?
        };

        let mut file = open_record_file(&repo.root, name, &path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; size as usize];
        file.read_exact(&mut data).await?;

        let digest: [u8; 32] = Sha256::digest(&data).into();
        if digest != block.hash {
            return Err(ServeError::Changed);
        }
        Ok(data)
    }

    /// Fetch one block from a connected peer (pull worker path).
    pub async fn fetch_block(
        &self,
        peer: &NodeId,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, RequestError> {
        let handle = self
            .peers
            .lock()
            .get(peer)
            .cloned()
            .ok_or(RequestError::Transient)?;
        handle.request(repo, name, offset, size).await
    }

    pub fn connected_to(&self, peer: &NodeId) -> bool {
        self.peers.lock().contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.peers.lock().keys().copied().collect()
    }

    pub fn peer_handle(&self, peer: &NodeId) -> Option<Arc<PeerHandle>> {
        self.peers.lock().get(peer).cloned()
    }

    /// Register a handshaked connection. On success the model sends
    /// the initial `ClusterConfig` and per-repo `Index`, and re-queues
    /// anything this peer's view says we still need.
    ///
    /// Duplicate handling is deterministic so a mutual dial leaves
    /// exactly one connection: when both ends race, the node with the
    /// lexicographically lower ID keeps its outgoing attempt.
    pub async fn add_connection(
        &self,
        peer: NodeId,
        incoming: bool,
        tx: mpsc::Sender<Message>,
    ) -> Result<Arc<PeerHandle>, Refused> {
        if peer == self.id {
            return Err(Refused::SelfConnection);
        }

        let handle = {
            let mut peers = self.peers.lock();
            if let Some(existing) = peers.get(&peer) {
                if incoming == (self.id < peer) {
                    return Err(Refused::Duplicate);
                }
                tracing::info!(
                    peer = %peer, generation = existing.generation,
                    "Replacing connection after simultaneous connect"
                );
                existing.fail_all_pending();
                existing.closed.notify_one();
                peers.remove(&peer);
            }
            let handle = Arc::new(PeerHandle {
                id: peer,
                generation: self.conn_generation.fetch_add(1, Ordering::Relaxed),
                tx,
                next_request: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                watermarks: Mutex::new(HashMap::new()),
                pending_ack: Mutex::new(None),
                closed: Notify::new(),
            });
            peers.insert(peer, handle.clone());
            handle
        };
        tracing::info!(peer = %peer, incoming, generation = handle.generation, "Connection registered");

        // First message each way: what we serve, and to whom.
        let shared: Vec<Arc<Repo>> = self
            .repos()
            .into_iter()
            .filter(|r| r.allowed.contains(&peer))
            .collect();
        let cluster = Message::ClusterConfig {
            client_name: crate::CLIENT_NAME.to_string(),
            client_version: crate::CLIENT_VERSION.to_string(),
            repos: shared
                .iter()
                .map(|r| RepoAnnouncement {
                    id: r.id.clone(),
                    peers: r.allowed.clone(),
                })
                .collect(),
        };
        if handle.send(cluster).await.is_err() {
            self.drop_connection(&peer, handle.generation, "writer gone during handshake");
            return Err(Refused::Duplicate);
        }

        for repo in &shared {
            let (records, high) = {
                let set = repo.set.lock();
                (set.local_records(), set.max_local_version())
            };
            let msg = Message::Index {
                repo: repo.id.clone(),
                records,
            };
            if handle.send(msg).await.is_err() {
                self.drop_connection(&peer, handle.generation, "writer gone during handshake");
                return Err(Refused::Duplicate);
            }
            handle.set_sent_watermark(&repo.id, high);

            // The peer's view survives disconnects; anything still
            // needed becomes fetchable again now.
            if !repo.read_only {
                let needed: Vec<String> = {
                    let set = repo.set.lock();
                    set.names()
                        .into_iter()
                        .filter(|n| set.needs(n).is_some())
                        .collect()
                };
                for name in needed {
                    repo.queue.push(name, 0);
                }
            }
        }

        Ok(handle)
    }

    /// Remove a connection. The generation guards a replaced
    /// connection's cleanup from removing its successor. Every pending
    /// request on the connection resolves to `Transient`.
    pub fn drop_connection(&self, peer: &NodeId, generation: u64, reason: &str) {
        let removed = {
            let mut peers = self.peers.lock();
            match peers.get(peer) {
                Some(handle) if handle.generation == generation => peers.remove(peer),
                _ => None,
            }
        };
        if let Some(handle) = removed {
            handle.fail_all_pending();
            handle.closed.notify_one();
            tracing::info!(peer = %peer, generation, reason, "Connection dropped");
        }
    }

    /// Drop whatever connection the peer currently has, for failures
    /// discovered away from the connection tasks (a block that fails
    /// verification, a protocol violation seen by the model).
    pub fn drop_peer(&self, peer: &NodeId, reason: &str) {
        let generation = match self.peers.lock().get(peer) {
            Some(handle) => handle.generation,
            None => return,
        };
        self.drop_connection(peer, generation, reason);
    }

    /// Adopt a pulled record into the local view (called by the pull
    /// engine after a successful rename) and schedule its fan-out.
    pub fn pull_complete(&self, repo_id: &str, rec: FileRecord) {
        if let Some(repo) = self.repo(repo_id) {
            repo.set.lock().adopt_local(rec);
            self.mark_dirty(repo_id);
        }
    }

    fn mark_dirty(&self, repo_id: &str) {
        self.dirty.lock().insert(repo_id.to_string());
        self.dirty_notify.notify_one();
    }

    /// Coalescing index fan-out: wait for a change, let a quiet
    /// interval pass, then send every connected, authorized peer the
    /// records past its watermark.
    pub async fn run_fanout(self: Arc<Self>) {
        loop {
            self.dirty_notify.notified().await;
            tokio::time::sleep(FANOUT_QUIET).await;
            let dirty: Vec<String> = self.dirty.lock().drain().collect();
            for repo_id in dirty {
                self.flush_repo(&repo_id).await;
            }
        }
    }

    /// Send one repository's pending updates to all eligible peers.
    pub async fn flush_repo(&self, repo_id: &str) {
        let Some(repo) = self.repo(repo_id) else {
            return;
        };
        let peers: Vec<Arc<PeerHandle>> = self.peers.lock().values().cloned().collect();
        for handle in peers {
            if !repo.allowed.contains(&handle.id) {
                continue;
            }
            let records = {
                let set = repo.set.lock();
                set.local_since(handle.sent_watermark(&repo.id))
            };
            let Some(high) = records.iter().map(|r| r.local_version).max() else {
                continue;
            };
            let msg = Message::IndexUpdate {
                repo: repo.id.clone(),
                records,
            };
            if handle.send(msg).await.is_ok() {
                handle.set_sent_watermark(&repo.id, high);
            }
        }
    }

    /// Persist one repository's local view.
    pub fn save_index(&self, repo_id: &str) -> io::Result<()> {
        let Some(repo) = self.repo(repo_id) else {
            return Ok(());
        };
        let records = repo.set.lock().local_records();
        index_store::save(&self.home, repo_id, &records)
    }

    /// Persist every repository, logging failures instead of
    /// propagating them.
    pub fn save_all_indexes(&self) {
        for repo in self.repos() {
            if let Err(e) = self.save_index(&repo.id) {
                tracing::warn!(repo = %repo.id, "Failed to persist index: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{BlockInfo, flags};

    fn test_model() -> Arc<Model> {
        Model::new(NodeId::from_der(b"self"), std::env::temp_dir())
    }

    fn rec(name: &str, seed: u8, version: u64) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            flags: 0o644,
            modified: 1_000,
            version,
            local_version: 0,
            blocks: vec![BlockInfo {
                offset: 0,
                size: 4,
                hash: [seed; 32],
            }],
        }
    }

    #[test]
    fn add_repo_is_idempotent() {
        let model = test_model();
        let a = model.add_repo("r", Path::new("/tmp/r"), false, vec![]);
        let b = model.add_repo("r", Path::new("/elsewhere"), true, vec![]);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.root, PathBuf::from("/tmp/r"));
    }

    #[test]
    fn scan_result_bumps_only_on_content_change() {
        let model = test_model();
        model.add_repo("r", Path::new("/tmp/r"), false, vec![]);

        assert_eq!(model.scan_result("r", vec![rec("a", 1, 0)]), 1);
        assert_eq!(model.scan_result("r", vec![rec("a", 1, 0)]), 0);
        assert_eq!(model.scan_result("r", vec![rec("a", 2, 0)]), 1);
    }

    #[test]
    fn handle_index_enqueues_needed_names() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let repo = model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);

        model
            .handle_index(&peer, "r", vec![rec("a", 1, 10)], true)
            .unwrap();
        assert_eq!(repo.queue.len(), 1);

        // Applying the same update again changes nothing.
        model
            .handle_index(&peer, "r", vec![rec("a", 1, 10)], false)
            .unwrap();
        assert_eq!(repo.queue.len(), 1);
    }

    #[test]
    fn handle_index_rejects_unknown_and_unauthorized() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        model.add_repo("r", Path::new("/tmp/r"), false, vec![]);

        assert!(matches!(
            model.handle_index(&peer, "nope", vec![], true),
            Err(ProtocolViolation::UnknownRepo(_))
        ));
        assert!(matches!(
            model.handle_index(&peer, "r", vec![], true),
            Err(ProtocolViolation::Unauthorized(_))
        ));
        let allowed = model.add_repo("r2", Path::new("/tmp/r2"), false, vec![peer]);
        assert!(matches!(
            model.handle_index(&peer, "r2", vec![rec("../evil", 1, 1)], true),
            Err(ProtocolViolation::BadName(_))
        ));
        assert_eq!(allowed.queue.len(), 0);
    }

    #[test]
    fn read_only_repo_never_queues_pulls() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let repo = model.add_repo("r", Path::new("/tmp/r"), true, vec![peer]);

        model
            .handle_index(&peer, "r", vec![rec("a", 1, 10)], true)
            .unwrap();
        assert_eq!(repo.queue.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_connections_resolve_deterministically() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let we_are_lower = model.id < peer;

        let (tx1, _rx1) = mpsc::channel(16);
        model.add_connection(peer, false, tx1).await.unwrap();
        assert!(model.connected_to(&peer));

        // Second, incoming connection from the same peer.
        let (tx2, _rx2) = mpsc::channel(16);
        let result = model.add_connection(peer, true, tx2).await;
        if we_are_lower {
            assert!(matches!(result, Err(Refused::Duplicate)));
        } else {
            assert!(result.is_ok());
        }
        assert!(model.connected_to(&peer));
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let model = test_model();
        let (tx, _rx) = mpsc::channel(16);
        assert!(matches!(
            model.add_connection(model.id, true, tx).await,
            Err(Refused::SelfConnection)
        ));
    }

    #[tokio::test]
    async fn drop_connection_fails_pending_with_transient() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let (tx, mut rx) = mpsc::channel(16);
        let handle = model.add_connection(peer, false, tx).await.unwrap();

        let fetch = {
            let model = model.clone();
            tokio::spawn(async move { model.fetch_block(&peer, "r", "a", 0, 4).await })
        };
        // Wait until the request message is queued, then cut the peer.
        loop {
            match rx.recv().await {
                Some(Message::Request { .. }) => break,
                Some(_) => continue,
                None => panic!("writer queue closed early"),
            }
        }
        model.drop_connection(&peer, handle.generation, "test");

        let result = fetch.await.unwrap();
        assert!(matches!(result, Err(RequestError::Transient)));
        assert!(!model.connected_to(&peer));
    }

    #[tokio::test]
    async fn initial_connection_sends_cluster_config_then_index() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);
        model.scan_result("r", vec![rec("a", 1, 0)]);

        let (tx, mut rx) = mpsc::channel(16);
        model.add_connection(peer, false, tx).await.unwrap();

        match rx.recv().await.unwrap() {
            Message::ClusterConfig { repos, .. } => {
                assert_eq!(repos.len(), 1);
                assert_eq!(repos[0].id, "r");
            }
            other => panic!("expected ClusterConfig, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Message::Index { repo, records } => {
                assert_eq!(repo, "r");
                assert_eq!(records.len(), 1);
            }
            other => panic!("expected Index, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_block_validates_against_local_record() {
        let dir = tempfile::tempdir().unwrap();
        let model = Model::new(NodeId::from_der(b"self"), dir.path().to_path_buf());
        let peer = NodeId::from_der(b"peer");
        model.add_repo("r", dir.path(), false, vec![peer]);

        let data = b"hunk";
        std::fs::write(dir.path().join("a"), data).unwrap();
        let digest: [u8; 32] = Sha256::digest(data).into();
        let mut record = rec("a", 0, 0);
        record.blocks[0].hash = digest;
        model.scan_result("r", vec![record]);

        let served = model.request_block(&peer, "r", "a", 0, 4).await.unwrap();
        assert_eq!(served, data);

        // Off-record offsets and sizes are refused, not served stale.
        assert!(matches!(
            model.request_block(&peer, "r", "a", 1, 4).await,
            Err(ServeError::NoSuchBlock)
        ));
        assert!(matches!(
            model.request_block(&peer, "r", "missing", 0, 4).await,
            Err(ServeError::UnknownFile)
        ));

        // Content changed under the record: error, never wrong bytes.
        std::fs::write(dir.path().join("a"), b"HUNK").unwrap();
        assert!(matches!(
            model.request_block(&peer, "r", "a", 0, 4).await,
            Err(ServeError::Changed)
        ));
    }

    #[tokio::test]
    async fn request_block_finds_decomposed_names_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let model = Model::new(NodeId::from_der(b"self"), dir.path().to_path_buf());
        let peer = NodeId::from_der(b"peer");
        model.add_repo("r", dir.path(), false, vec![peer]);

        // The file sits on disk under its decomposed name (as macOS
        // stores it); the record carries the composed form.
        let decomposed = "cafe\u{301}.txt";
        let composed = "caf\u{e9}.txt";
        let data = b"brew";
        std::fs::write(dir.path().join(decomposed), data).unwrap();
        let mut record = rec(composed, 0, 0);
        record.blocks[0].hash = Sha256::digest(data).into();
        model.scan_result("r", vec![record]);

        let served = model
            .request_block(&peer, "r", composed, 0, 4)
            .await
            .unwrap();
        assert_eq!(served, data);
    }

    #[test]
    fn handle_index_rejects_non_nfc_names() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let repo = model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);

        assert!(matches!(
            model.handle_index(&peer, "r", vec![rec("cafe\u{301}.txt", 1, 1)], true),
            Err(ProtocolViolation::BadName(_))
        ));
        model
            .handle_index(&peer, "r", vec![rec("caf\u{e9}.txt", 1, 1)], true)
            .unwrap();
        assert_eq!(repo.queue.len(), 1);
    }

    #[tokio::test]
    async fn keepalive_roundtrip_promotes_acked_watermarks() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);
        model.scan_result("r", vec![rec("a", 1, 0)]);

        let (tx, _rx) = mpsc::channel(16);
        let handle = model.add_connection(peer, false, tx).await.unwrap();
        let sent = handle.sent_watermark("r");
        assert!(sent > 0);
        assert_eq!(handle.acked_watermark("r"), 0);

        // A pong with no ping outstanding acknowledges nothing.
        handle.pong_received();
        assert_eq!(handle.acked_watermark("r"), 0);

        handle.ping_sent();
        // Records sent after the ping are outside its snapshot.
        handle.set_sent_watermark("r", sent + 10);
        handle.pong_received();
        assert_eq!(handle.acked_watermark("r"), sent);

        // The next round-trip picks up the rest.
        handle.ping_sent();
        handle.pong_received();
        assert_eq!(handle.acked_watermark("r"), sent + 10);
    }

    #[test]
    fn pull_complete_clears_need_and_marks_dirty() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let repo = model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);

        model
            .handle_index(&peer, "r", vec![rec("a", 3, 9)], true)
            .unwrap();
        let target = repo.set.lock().needs("a").unwrap();
        model.pull_complete("r", target);
        assert!(repo.set.lock().needs("a").is_none());
    }

    #[test]
    fn deleted_directory_records_keep_their_flags() {
        let model = test_model();
        let peer = NodeId::from_der(b"peer");
        let repo = model.add_repo("r", Path::new("/tmp/r"), false, vec![peer]);

        let mut dir_rec = rec("sub", 0, 5);
        dir_rec.flags = flags::DIRECTORY | 0o755;
        dir_rec.blocks.clear();
        model.handle_index(&peer, "r", vec![dir_rec], true).unwrap();

        let target = repo.set.lock().needs("sub").unwrap();
        assert!(target.is_directory());
        assert!(target.blocks.is_empty());
    }
}
