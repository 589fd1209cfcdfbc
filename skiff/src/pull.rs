//! Pull engine: materializes the need set onto disk.
//!
//! Each writable repository runs a pool of workers over its FIFO need
//! queue. A worker resolves the current global record for its name,
//! fetches the blocks the local file cannot supply (block reuse),
//! verifies every block against its recorded hash, and assembles the
//! file in a dot-prefixed temp file that is fsynced, stamped, and
//! atomically renamed into place. Only after the rename does the local
//! record adopt the target — a crash leaves either the old file or the
//! new one, never a hybrid.
//!
//! Failures are per-name: the temp file is removed and the name is
//! requeued with exponential backoff. The engine never gives up on a
//! repository.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::files::{BlockInfo, FileRecord};
use crate::model::{Model, Repo, RequestError, name_to_path};

const TMP_PREFIX: &str = ".skiff.";
const TMP_SUFFIX: &str = ".tmp";

/// Longest backoff between retries of one name.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Temp file for an in-progress download, in the target's directory.
/// Dot-prefixed so the scanner's exclusion rules never index it.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let leaf = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{TMP_PREFIX}{leaf}{TMP_SUFFIX}"))
}

/// True for temp names produced by [`temp_path`].
pub fn is_temp_name(component: &str) -> bool {
    component.starts_with(TMP_PREFIX) && component.ends_with(TMP_SUFFIX)
}

fn backoff(attempts: u32) -> Duration {
    let secs = 1u64 << attempts.min(6);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

enum PullError {
    /// Transient: requeue after backoff.
    Retry(String),
}

impl From<io::Error> for PullError {
    fn from(e: io::Error) -> Self {
        PullError::Retry(format!("i/o: {e}"))
    }
}

/// Remove leftovers of downloads interrupted by a crash.
async fn clean_temp_files(root: &Path) {
    let shown = root.display().to_string();
    let root = root.to_path_buf();
    let removed = tokio::task::spawn_blocking(move || {
        let mut removed = 0usize;
        for entry in walkdir::WalkDir::new(&root).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file()
                && is_temp_name(&entry.file_name().to_string_lossy())
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
        removed
    })
    .await
    .unwrap_or(0);
    if removed > 0 {
        tracing::info!(path = %shown, removed, "Removed stale temp files");
    }
}

/// Start the pull engine for one writable repository.
pub async fn run(model: Arc<Model>, repo: Arc<Repo>, workers: usize) {
    clean_temp_files(&repo.root).await;
    let mut tasks = Vec::new();
    for _ in 0..workers.max(1) {
        let model = model.clone();
        let repo = repo.clone();
        tasks.push(tokio::spawn(worker(model, repo)));
    }
    for task in tasks {
        let _ = task.await;
    }
}

async fn worker(model: Arc<Model>, repo: Arc<Repo>) {
    loop {
        let job = repo.queue.pop().await;
        let result = pull_one(&model, &repo, &job.name).await;
        repo.queue.done(&job.name);
        if let Err(PullError::Retry(reason)) = result {
            let delay = backoff(job.attempts);
            tracing::debug!(
                repo = %repo.id, name = %job.name, attempts = job.attempts,
                delay_secs = delay.as_secs(),
                "Pull failed, backing off: {reason}"
            );
            let repo = repo.clone();
            let name = job.name.clone();
            let attempts = job.attempts;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                repo.queue.push(name, attempts + 1);
            });
        }
    }
}

/// Bring one name up to the current global record. A no-op when the
/// need has evaporated (the record changed again, or another worker's
/// finished pull already satisfied it).
async fn pull_one(model: &Arc<Model>, repo: &Arc<Repo>, name: &str) -> Result<(), PullError> {
    let Some(target) = repo.set.lock().needs(name) else {
        return Ok(());
    };
    let Some(path) = name_to_path(&repo.root, name) else {
        tracing::warn!(repo = %repo.id, name, "Refusing to pull unresolvable name");
        return Ok(());
    };

    if target.is_deleted() {
        apply_delete(&path, &target).await?;
        tracing::info!(repo = %repo.id, name, "Applied deletion");
        model.pull_complete(&repo.id, target);
        return Ok(());
    }

    if target.is_symlink() {
        tracing::warn!(repo = %repo.id, name, "Symlinks are not synchronized, skipping");
        return Ok(());
    }

    if target.is_directory() {
        tokio::fs::create_dir_all(&path).await?;
        set_permissions(&path, target.permissions()).await?;
        tracing::info!(repo = %repo.id, name, "Created directory");
        model.pull_complete(&repo.id, target);
        return Ok(());
    }

    pull_file(model, repo, name, &path, target).await
}

async fn apply_delete(path: &Path, target: &FileRecord) -> Result<(), PullError> {
    let result = if target.is_directory() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn pull_file(
    model: &Arc<Model>,
    repo: &Arc<Repo>,
    name: &str,
    path: &Path,
    target: FileRecord,
) -> Result<(), PullError> {
    // Blocks the current local copy can donate, by hash.
    let reuse: HashMap<[u8; 32], BlockInfo> = repo
        .set
        .lock()
        .local(name)
        .filter(|r| !r.is_deleted() && !r.is_directory())
        .map(|r| r.blocks.iter().map(|b| (b.hash, b.clone())).collect())
        .unwrap_or_default();

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(path);
    let result = assemble(model, repo, name, path, &temp, &target, &reuse).await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
        return result;
    }

    set_permissions(&temp, target.permissions()).await?;
    filetime::set_file_mtime(&temp, filetime::FileTime::from_unix_time(target.modified, 0))
        .map_err(PullError::from)?;
    tokio::fs::rename(&temp, path).await?;

    tracing::info!(
        repo = %repo.id, name,
        size = target.size(), blocks = target.blocks.len(),
        "Pull complete"
    );
    model.pull_complete(&repo.id, target);
    Ok(())
}

/// Write every target block into the temp file, reusing local blocks
/// where the hashes line up and fetching the rest from peers.
async fn assemble(
    model: &Arc<Model>,
    repo: &Arc<Repo>,
    name: &str,
    path: &Path,
    temp: &Path,
    target: &FileRecord,
    reuse: &HashMap<[u8; 32], BlockInfo>,
) -> Result<(), PullError> {
    let mut file = tokio::fs::File::create(temp).await?;
    file.set_len(target.size()).await?;

    let mut cursor = 0usize;
    for block in &target.blocks {
        if let Some(local) = reuse.get(&block.hash) {
            if local.size == block.size {
                match copy_local_block(path, local).await {
                    Ok(data) => {
                        file.seek(io::SeekFrom::Start(block.offset)).await?;
                        file.write_all(&data).await?;
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(
                            repo = %repo.id, name,
                            offset = block.offset,
                            "Local block reuse failed, fetching instead: {e}"
                        );
                    }
                }
            }
        }

        let data = fetch_block(model, repo, name, target, block, &mut cursor).await?;
        file.seek(io::SeekFrom::Start(block.offset)).await?;
        file.write_all(&data).await?;
    }

    file.sync_all().await?;
    Ok(())
}

/// Read one block out of the existing local file, verified by hash so
/// a file that changed under us never poisons the new copy.
async fn copy_local_block(path: &Path, block: &BlockInfo) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(io::SeekFrom::Start(block.offset)).await?;
    let mut data = vec![0u8; block.size as usize];
    file.read_exact(&mut data).await?;
    let digest: [u8; 32] = Sha256::digest(&data).into();
    if digest != block.hash {
        return Err(io::Error::other("local block content changed"));
    }
    Ok(data)
}

/// Fetch one block from some connected peer holding the target
/// record, round-robin across the eligible set. A peer that answers
/// with bytes that do not hash to the record loses its connection and
/// the next peer is tried.
async fn fetch_block(
    model: &Arc<Model>,
    repo: &Arc<Repo>,
    name: &str,
    target: &FileRecord,
    block: &BlockInfo,
    cursor: &mut usize,
) -> Result<Vec<u8>, PullError> {
    let eligible: Vec<_> = {
        let holders = repo.set.lock().holders(target);
        holders
            .into_iter()
            .filter(|p| model.connected_to(p))
            .collect()
    };
    if eligible.is_empty() {
        return Err(PullError::Retry(format!(
            "no connected peer holds {name}"
        )));
    }

    let mut tried = 0;
    while tried < eligible.len() {
        let peer = eligible[*cursor % eligible.len()];
        *cursor += 1;
        tried += 1;

        match model
            .fetch_block(&peer, &repo.id, name, block.offset, block.size)
            .await
        {
            Ok(data) => {
                let digest: [u8; 32] = Sha256::digest(&data).into();
                if data.len() == block.size as usize && digest == block.hash {
                    return Ok(data);
                }
                tracing::warn!(
                    peer = %peer, repo = %repo.id, name,
                    offset = block.offset,
                    want = %hex::encode(&block.hash[..8]),
                    got = %hex::encode(&digest[..8]),
                    "Block failed hash verification, dropping peer"
                );
                model.drop_peer(&peer, "block hash mismatch");
            }
            Err(RequestError::Remote(msg)) => {
                tracing::debug!(peer = %peer, repo = %repo.id, name, "Peer refused block: {msg}");
            }
            Err(e) => {
                tracing::debug!(peer = %peer, repo = %repo.id, name, "Block request failed: {e}");
            }
        }
    }
    Err(PullError::Retry(format!(
        "no peer could supply block at {} for {name}",
        block.offset
    )))
}

#[cfg(unix)]
async fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_names_are_hidden_and_recognizable() {
        let p = temp_path(Path::new("/repo/sub/a.txt"));
        assert_eq!(p, Path::new("/repo/sub/.skiff.a.txt.tmp"));
        assert!(is_temp_name(".skiff.a.txt.tmp"));
        assert!(crate::scanner::excluded(".skiff.a.txt.tmp"));
        assert!(!is_temp_name("a.txt"));
        assert!(!is_temp_name(".skiff.a.txt"));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(5), Duration::from_secs(32));
        assert_eq!(backoff(6), Duration::from_secs(60));
        assert_eq!(backoff(60), Duration::from_secs(60));
    }
}
