//! Composition root: wires identity, config, model, and the task
//! inventory together and runs until shutdown.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::{self, dialer, listener};
use crate::discovery::{Discovery, NoDiscovery};
use crate::identity::{Identity, NodeId};
use crate::limiter::Limiter;
use crate::model::Model;
use crate::{index_store, pull, scanner};

/// Interval between periodic index snapshots.
const PERSIST_INTERVAL: Duration = Duration::from_secs(300);

pub struct Server {
    home: PathBuf,
    config: Arc<Config>,
    identity: Identity,
    model: Arc<Model>,
}

impl Server {
    /// Load identity and config from `home`, creating both on first
    /// run. Failures here are fatal.
    pub fn new(home: PathBuf) -> Result<Server> {
        fs::create_dir_all(&home)
            .with_context(|| format!("creating home directory {}", home.display()))?;
        let identity =
            Identity::load_or_generate(&home).context("loading node certificate")?;
        tracing::info!(node = %identity.node_id, "Node identity");

        let first_run = !home.join(crate::config::CONFIG_FILE).exists();
        let config = Config::load(&home)?;
        if first_run {
            config
                .save(&home)
                .context("writing initial config file")?;
        }

        let model = Model::new(identity.node_id, home.clone());
        Ok(Server {
            home,
            config: Arc::new(config),
            identity,
            model,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id
    }

    /// The observability handle: read-only callers (a GUI, tests) get
    /// the model and use its query methods.
    pub fn model(&self) -> Arc<Model> {
        self.model.clone()
    }

    /// Start every task and block until a shutdown signal, then flush
    /// the index snapshots and return.
    pub async fn run(self) -> Result<()> {
        self.start(Arc::new(NoDiscovery)).await?;
        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        tracing::info!("Shutting down, persisting indexes");
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || model.save_all_indexes())
            .await
            .context("final index flush")?;
        Ok(())
    }

    /// Spawn the whole task inventory — listeners, dialer, registrar,
    /// fan-out, scanners, pull engines, persistence — and return once
    /// everything is running.
    pub async fn start(&self, discovery: Arc<dyn Discovery>) -> Result<()> {
        let options = &self.config.options;

        // Indexes load before any connection is accepted, so the first
        // peer sees a complete view.
        for repo_cfg in &self.config.repositories {
            self.model.add_repo(
                &repo_cfg.id,
                &repo_cfg.directory,
                repo_cfg.read_only,
                repo_cfg.peers.clone(),
            );
            match index_store::load(&self.home, &repo_cfg.id) {
                Ok(records) => {
                    tracing::info!(
                        repo = %repo_cfg.id, records = records.len(),
                        read_only = repo_cfg.read_only,
                        "Repository registered"
                    );
                    self.model.seed_repo(&repo_cfg.id, records);
                }
                Err(e) => {
                    tracing::warn!(
                        repo = %repo_cfg.id,
                        "Index snapshot unreadable, rescanning from scratch: {e}"
                    );
                }
            }
        }

        let send_limiter = Limiter::from_kbps(options.max_send_kbps);
        let scan_limiter = Limiter::from_kbps(options.max_change_kbps);
        if send_limiter.is_some() {
            tracing::info!(kbps = options.max_send_kbps, "Send rate limit enabled");
        }

        let server_tls = self
            .identity
            .server_config()
            .context("building TLS acceptor config")?;
        let client_tls = self
            .identity
            .client_config()
            .context("building TLS connector config")?;

        // Accepts and dial successes fan into one channel; a single
        // registrar validates and registers in arrival order.
        let (sink, fan_in) = mpsc::channel(16);
        let known: HashSet<NodeId> = self.config.peers.iter().map(|p| p.id).collect();
        tokio::spawn(connection::run_registrar(
            self.model.clone(),
            known,
            fan_in,
            send_limiter,
        ));

        for addr in &options.listen_addresses {
            let addr = addr.clone();
            let tls = server_tls.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                if let Err(e) = listener::run(addr.clone(), tls, sink).await {
                    tracing::error!(%addr, "Listener failed: {e}");
                }
            });
        }

        tokio::spawn(dialer::run(
            self.model.clone(),
            self.config.clone(),
            client_tls,
            discovery,
            sink,
        ));

        tokio::spawn(self.model.clone().run_fanout());

        let rescan = Duration::from_secs(options.rescan_interval_s.max(1));
        for repo in self.model.repos() {
            tokio::spawn(scanner::run(
                self.model.clone(),
                repo.clone(),
                rescan,
                scan_limiter.clone(),
            ));
            if !repo.read_only {
                tokio::spawn(pull::run(
                    self.model.clone(),
                    repo,
                    options.parallel_requests,
                ));
            }
        }

        // Periodic snapshots, so a hard kill loses at most a few
        // minutes of index state.
        {
            let model = self.model.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(PERSIST_INTERVAL).await;
                    let model = model.clone();
                    let _ = tokio::task::spawn_blocking(move || model.save_all_indexes()).await;
                }
            });
        }

        Ok(())
    }
}

/// `--reset`: move every repository directory aside and delete the
/// index snapshots, then return for the process to exit.
pub fn reset(home: &Path) -> Result<()> {
    let config = Config::load(home)?;
    let ns = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    for repo in &config.repositories {
        if repo.directory.exists() {
            let name = repo
                .directory
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| repo.id.clone());
            let target = repo
                .directory
                .with_file_name(format!("{name}.skiff-reset-{ns}"));
            fs::rename(&repo.directory, &target).with_context(|| {
                format!("moving {} aside", repo.directory.display())
            })?;
            tracing::info!(repo = %repo.id, to = %target.display(), "Repository directory moved aside");
        }
        index_store::remove(home, &repo.id)?;
    }
    tracing::info!("Reset complete");
    Ok(())
}
