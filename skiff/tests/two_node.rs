//! End-to-end tests: two live nodes syncing over localhost TLS.
//!
//! Each node gets its own home (certificates, config, indexes) and
//! repository directory in tempdirs, real listeners on loopback
//! ports, and short reconnect/rescan intervals so tests settle in a
//! few seconds. Run with `--test-threads=1` if the machine is short
//! on ephemeral ports.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use skiff::config::{Config, Options, PeerConfig, RepoConfig};
use skiff::discovery::NoDiscovery;
use skiff::identity::{Identity, NodeId};
use skiff::server::Server;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Node {
    home: TempDir,
    repo_dir: TempDir,
    port: u16,
    id: NodeId,
}

fn prepare_node() -> Node {
    let home = TempDir::new().unwrap();
    let repo_dir = TempDir::new().unwrap();
    let id = Identity::load_or_generate(home.path()).unwrap().node_id;
    Node {
        home,
        repo_dir,
        port: free_port(),
        id,
    }
}

fn write_config(node: &Node, peer: &Node, read_only: bool) {
    let cfg = Config {
        repositories: vec![RepoConfig {
            id: "r".into(),
            directory: node.repo_dir.path().to_path_buf(),
            read_only,
            peers: vec![peer.id],
        }],
        peers: vec![PeerConfig {
            id: peer.id,
            addresses: vec![format!("127.0.0.1:{}", peer.port)],
            name: "other".into(),
        }],
        options: Options {
            listen_addresses: vec![format!("127.0.0.1:{}", node.port)],
            reconnect_interval_s: 1,
            rescan_interval_s: 1,
            ..Default::default()
        },
    };
    cfg.save(node.home.path()).unwrap();
}

async fn start(node: &Node) -> Server {
    let server = Server::new(node.home.path().to_path_buf()).unwrap();
    server.start(Arc::new(NoDiscovery)).await.unwrap();
    server
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..600 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn file_matches(path: &Path, expected: &[u8]) -> bool {
    fs::read(path).map(|d| d == expected).unwrap_or(false)
}

fn install_provider() {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn two_nodes_sync_files_both_ways() {
    install_provider();
    let a = prepare_node();
    let b = prepare_node();
    write_config(&a, &b, false);
    write_config(&b, &a, false);

    fs::write(a.repo_dir.path().join("a.txt"), b"hello").unwrap();

    let server_a = start(&a).await;
    let server_b = start(&b).await;

    // Initial sync: B materializes A's file.
    let b_file: PathBuf = b.repo_dir.path().join("a.txt");
    wait_until("a.txt to reach node B", || file_matches(&b_file, b"hello")).await;

    // The records converge on one version and block list — the
    // receiver adopts the winner's record, it does not invent its own.
    let local_record = |server: &Server| {
        let repo = server.model().repo("r").unwrap();
        let set = repo.set.lock();
        set.local("a.txt").cloned()
    };
    wait_until("records to converge", || {
        match (local_record(&server_a), local_record(&server_b)) {
            (Some(a), Some(b)) => {
                a.version == b.version && a.blocks == b.blocks && a.modified == b.modified
            }
            _ => false,
        }
    })
    .await;

    // A later change flows through the incremental update path.
    fs::write(b.repo_dir.path().join("reply.txt"), b"roger").unwrap();
    let a_file = a.repo_dir.path().join("reply.txt");
    wait_until("reply.txt to reach node A", || {
        file_matches(&a_file, b"roger")
    })
    .await;

    // A deletion converges too.
    fs::remove_file(a.repo_dir.path().join("a.txt")).unwrap();
    wait_until("deletion of a.txt to reach node B", || !b_file.exists()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn read_only_node_announces_but_never_writes() {
    install_provider();
    let a = prepare_node();
    let b = prepare_node();
    write_config(&a, &b, false);
    write_config(&b, &a, true);

    fs::write(a.repo_dir.path().join("a.txt"), b"payload").unwrap();

    let _server_a = start(&a).await;
    let server_b = start(&b).await;

    // B learns about the file...
    let model_b = server_b.model();
    wait_until("node B to receive the index", || {
        let repo = model_b.repo("r").unwrap();
        let set = repo.set.lock();
        set.global("a.txt").is_some()
    })
    .await;

    // ...but never touches its filesystem.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let entries: Vec<_> = fs::read_dir(b.repo_dir.path()).unwrap().collect();
    assert!(
        entries.is_empty(),
        "read-only repository was written to: {entries:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn read_only_node_still_serves_content() {
    install_provider();
    let a = prepare_node();
    let b = prepare_node();
    // A is read-only and holds the data; B pulls from it.
    write_config(&a, &b, true);
    write_config(&b, &a, false);

    fs::write(a.repo_dir.path().join("shared.txt"), b"served").unwrap();

    let _server_a = start(&a).await;
    let _server_b = start(&b).await;

    let b_file = b.repo_dir.path().join("shared.txt");
    wait_until("read-only node to serve its file", || {
        file_matches(&b_file, b"served")
    })
    .await;
}
