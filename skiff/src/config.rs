//! Daemon configuration: CLI flags and the on-disk config file.
//!
//! The config file is TOML at `<home>/config.toml`: the repositories
//! this node serves, the peers it syncs with, and tuning options.
//! Saves go through a temp file and rename. There is no process-wide
//! config state — the file is read once at startup and the snapshot is
//! threaded through construction.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::identity::NodeId;

pub const CONFIG_FILE: &str = "config.toml";

/// Default peer protocol port, applied to addresses without one.
pub const DEFAULT_PORT: u16 = 22000;

/// Address placeholder that resolves through discovery instead of DNS.
pub const DYNAMIC_ADDR: &str = "dynamic";

#[derive(Parser, Debug)]
#[command(name = "skiff", version, about = "Peer-to-peer file synchronization daemon")]
pub struct Args {
    /// Configuration directory (certificates, config, index snapshots).
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Move repository directories aside, delete index snapshots, exit.
    #[arg(long)]
    pub reset: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repositories: Vec<RepoConfig>,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Operator-assigned label; two nodes sharing it sync the tree.
    pub id: String,
    pub directory: PathBuf,
    /// Serve and announce only; never write to disk.
    #[serde(default)]
    pub read_only: bool,
    /// Peers allowed to sync this repository.
    #[serde(default)]
    pub peers: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    /// Static addresses, plus the literal `dynamic` for discovery.
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,
    /// Human-readable label, display only.
    #[serde(default)]
    pub name: String,
}

fn default_addresses() -> Vec<String> {
    vec![DYNAMIC_ADDR.to_string()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub listen_addresses: Vec<String>,
    pub reconnect_interval_s: u64,
    pub rescan_interval_s: u64,
    /// Global send ceiling in KiB/s; 0 is unlimited.
    pub max_send_kbps: u32,
    /// Scan hashing ceiling in KiB/s; 0 is unlimited.
    pub max_change_kbps: u32,
    /// Pull workers per writable repository.
    pub parallel_requests: usize,
    pub local_announce: bool,
    pub global_announce: bool,
    pub announce_server: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            listen_addresses: vec![format!("0.0.0.0:{DEFAULT_PORT}")],
            reconnect_interval_s: 60,
            rescan_interval_s: 60,
            max_send_kbps: 0,
            max_change_kbps: 0,
            parallel_requests: 16,
            local_announce: false,
            global_announce: false,
            announce_server: String::new(),
        }
    }
}

impl Config {
    /// Load from `<home>/config.toml`. A missing file is a fresh
    /// install and yields the default config; an unreadable or
    /// unparseable one is fatal.
    pub fn load(home: &Path) -> anyhow::Result<Config> {
        let path = home.join(CONFIG_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No config file, starting with defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(anyhow::anyhow!("reading {}: {e}", path.display()));
            }
        };
        let cfg = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        Ok(cfg)
    }

    /// Write to `<home>/config.toml` via temp file and rename.
    pub fn save(&self, home: &Path) -> io::Result<()> {
        let path = home.join(CONFIG_FILE);
        let tmp = home.join(format!("{CONFIG_FILE}.tmp"));
        let text = toml::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn repo(&self, id: &str) -> Option<&RepoConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn peer(&self, id: &NodeId) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == *id)
    }
}

/// The default configuration directory for this OS.
pub fn default_home() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("skiff"))
        .unwrap_or_else(|| PathBuf::from(".skiff"))
}

/// Append the default port to addresses that lack one. Understands
/// bracketed IPv6 literals; `dynamic` passes through untouched.
pub fn with_default_port(addr: &str) -> String {
    if addr == DYNAMIC_ADDR {
        return addr.to_string();
    }
    let has_port = if let Some(end) = addr.rfind(']') {
        addr[end..].contains(':')
    } else {
        addr.matches(':').count() == 1
    };
    if has_port {
        addr.to_string()
    } else if addr.contains(':') && !addr.starts_with('[') {
        // Bare IPv6 literal.
        format!("[{addr}]:{DEFAULT_PORT}")
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    }
}
