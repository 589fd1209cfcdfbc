//! Repository scanner: brings the local view into agreement with disk.
//!
//! A scan walks the repository root, compares what it finds against
//! the current local view, and returns the records that changed —
//! nothing is published until the walk finishes, so a failed scan
//! never leaks a partial result. Change detection for regular files is
//! `(size, mtime)`; matching entries keep their existing block lists
//! without re-reading. Hashing is throttled against the shared
//! `max_change_kbps` token bucket.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

use crate::files::{BLOCK_SIZE, BlockInfo, FileRecord, flags};
use crate::limiter::Limiter;
use crate::model::{Model, Repo};

/// Names that cannot exist as files on every platform we sync with;
/// skipped everywhere so shared trees stay portable.
const RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// True if a single path component is excluded from syncing.
pub fn excluded(component: &str) -> bool {
    if component.starts_with('.') {
        return true;
    }
    let stem = component.split('.').next().unwrap_or(component);
    RESERVED.iter().any(|r| stem.eq_ignore_ascii_case(r))
}

enum Entry {
    Dir {
        name: String,
        mode: u32,
        mtime: i64,
    },
    File {
        name: String,
        path: PathBuf,
        size: u64,
        mode: u32,
        mtime: i64,
    },
}

fn mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o666
    }
}

/// Blocking walk: collect every syncable entry under `root`. Fails if
/// the root itself is unreadable (the scan is abandoned); unreadable
/// children are skipped with a warning.
fn walk(root: &Path) -> io::Result<Vec<Entry>> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("repository root {} is not a directory", root.display()),
        ));
    }

    let mut entries = Vec::new();
    let mut it = WalkDir::new(root).follow_links(false).into_iter();
    loop {
        let entry = match it.next() {
            None => break,
            Some(Ok(e)) => e,
            Some(Err(e)) => {
                tracing::warn!("Scan skipping unreadable entry: {e}");
                continue;
            }
        };
        if entry.path() == root {
            continue;
        }
        let component = entry.file_name().to_string_lossy();
        if excluded(&component) {
            if entry.file_type().is_dir() {
                it.skip_current_dir();
            }
            continue;
        }

        let rel = match entry.path().strip_prefix(root) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let Some(name) = rel_name(rel) else {
            tracing::warn!(path = %entry.path().display(), "Scan skipping non-unicode name");
            continue;
        };

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), "Scan skipping entry: {e}");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            entries.push(Entry::Dir {
                name,
                mode: mode_bits(&meta),
                mtime: mtime_secs(&meta),
            });
        } else if entry.file_type().is_file() {
            entries.push(Entry::File {
                name,
                path: entry.path().to_path_buf(),
                size: meta.len(),
                mode: mode_bits(&meta),
                mtime: mtime_secs(&meta),
            });
        }
        // Symlinks and special files are not synchronized.
    }
    Ok(entries)
}

/// Record name for a relative path: UTF-8 components joined with `/`,
/// NFC-normalized so nodes on filesystems that store decomposed names
/// (macOS) agree with everyone else about what a name is.
fn rel_name(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        parts.push(comp.as_os_str().to_str()?.to_string());
    }
    Some(parts.join("/").nfc().collect())
}

/// Hash a file into fixed-size blocks, debiting the limiter as bytes
/// are read.
pub async fn hash_blocks(
    path: &Path,
    limiter: Option<&Limiter>,
) -> io::Result<Vec<BlockInfo>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut blocks = Vec::new();
    let mut offset = 0u64;
    let mut buf = vec![0u8; BLOCK_SIZE as usize];

    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        if let Some(limiter) = limiter {
            limiter.consume(filled).await;
        }
        blocks.push(BlockInfo {
            offset,
            size: filled as u32,
            hash: Sha256::digest(&buf[..filled]).into(),
        });
        offset += filled as u64;
        if filled < buf.len() {
            break;
        }
    }
    Ok(blocks)
}

/// Walk one repository and return the records that differ from the
/// local view. `version` and `local_version` are left at zero for the
/// model to assign.
pub async fn scan_repo(
    repo: &Repo,
    limiter: Option<&Limiter>,
) -> io::Result<Vec<FileRecord>> {
    let local: HashMap<String, FileRecord> = repo
        .set
        .lock()
        .local_records()
        .into_iter()
        .map(|r| (r.name.clone(), r))
        .collect();

    let root = repo.root.clone();
    let entries = tokio::task::spawn_blocking(move || walk(&root))
        .await
        .map_err(io::Error::other)??;

    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for entry in entries {
        match entry {
            Entry::Dir { name, mode, mtime } => {
                seen.insert(name.clone());
                let unchanged = local.get(&name).is_some_and(|r| {
                    r.is_directory() && !r.is_deleted() && r.permissions() == mode
                });
                if !unchanged {
                    out.push(FileRecord {
                        name,
                        flags: flags::DIRECTORY | mode,
                        modified: mtime,
                        version: 0,
                        local_version: 0,
                        blocks: Vec::new(),
                    });
                }
            }
            Entry::File {
                name,
                path,
                size,
                mode,
                mtime,
            } => {
                seen.insert(name.clone());
                let prev = local.get(&name).filter(|r| {
                    !r.is_deleted() && !r.is_directory() && !r.is_symlink()
                });

                if let Some(prev) = prev {
                    if prev.size() == size && prev.modified == mtime {
                        if prev.permissions() == mode {
                            continue;
                        }
                        // Permission-only change: keep the blocks.
                        out.push(FileRecord {
                            name,
                            flags: mode,
                            modified: mtime,
                            version: 0,
                            local_version: 0,
                            blocks: prev.blocks.clone(),
                        });
                        continue;
                    }
                }

                match hash_blocks(&path, limiter).await {
                    Ok(blocks) => out.push(FileRecord {
                        name,
                        flags: mode,
                        modified: mtime,
                        version: 0,
                        local_version: 0,
                        blocks,
                    }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "Scan could not hash file: {e}");
                    }
                }
            }
        }
    }

    // Anything we hold that the walk no longer saw is gone.
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    for (name, rec) in &local {
        if !rec.is_deleted() && !seen.contains(name) {
            out.push(FileRecord {
                name: name.clone(),
                flags: rec.flags | flags::DELETED,
                modified: now,
                version: 0,
                local_version: 0,
                blocks: Vec::new(),
            });
        }
    }

    Ok(out)
}

/// Periodic scan loop for one repository: scan, publish, persist,
/// sleep. A failed scan is abandoned without publishing anything.
pub async fn run(
    model: Arc<Model>,
    repo: Arc<Repo>,
    interval: std::time::Duration,
    limiter: Option<Arc<Limiter>>,
) {
    loop {
        match scan_repo(&repo, limiter.as_deref()).await {
            Ok(records) => {
                let changed = model.scan_result(&repo.id, records);
                if changed > 0 {
                    let save_model = model.clone();
                    let repo_id = repo.id.clone();
                    match tokio::task::spawn_blocking(move || save_model.save_index(&repo_id))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(repo = %repo.id, "Failed to persist index: {e}");
                        }
                        Err(e) => {
                            tracing::warn!(repo = %repo.id, "Index save task failed: {e}");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(repo = %repo.id, "Scan abandoned: {e}");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotfiles_and_reserved_names_are_excluded() {
        assert!(excluded(".git"));
        assert!(excluded(".skiff.a.txt.tmp"));
        assert!(excluded("CON"));
        assert!(excluded("con"));
        assert!(excluded("Nul.txt"));
        assert!(excluded("lpt5"));

        assert!(!excluded("a.txt"));
        assert!(!excluded("console.log"));
        assert!(!excluded("com"));
        assert!(!excluded("lpt10"));
    }
}
