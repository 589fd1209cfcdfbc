//! Compressed on-disk index snapshots.
//!
//! One file per repository under the home directory, `<repo>.idx.gz`:
//! a gzip stream of length-prefixed postcard records holding our own
//! view. Loaded fully at startup (before any connection is accepted)
//! and rewritten after scans, periodically, and at shutdown. Writes go
//! through a temp file and rename so a crash never leaves a torn
//! snapshot behind.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::files::FileRecord;

pub fn index_path(home: &Path, repo: &str) -> PathBuf {
    home.join(format!("{repo}.idx.gz"))
}

/// Persist the local view for one repository.
pub fn save(home: &Path, repo: &str, records: &[FileRecord]) -> io::Result<()> {
    let path = index_path(home, repo);
    let tmp = path.with_extension("gz.tmp");

    let file = File::create(&tmp)?;
    let mut enc = GzEncoder::new(file, Compression::default());
    for rec in records {
        let bytes = postcard::to_allocvec(rec).map_err(io::Error::other)?;
        enc.write_all(&(bytes.len() as u32).to_le_bytes())?;
        enc.write_all(&bytes)?;
    }
    let file = enc.finish()?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load the persisted view, or an empty list if no snapshot exists.
pub fn load(home: &Path, repo: &str) -> io::Result<Vec<FileRecord>> {
    let path = index_path(home, repo);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut dec = GzDecoder::new(file);
    let mut records = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match dec.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        dec.read_exact(&mut buf)?;
        let rec: FileRecord = postcard::from_bytes(&buf).map_err(io::Error::other)?;
        records.push(rec);
    }
    Ok(records)
}

/// Delete a repository's snapshot, ignoring a missing file.
pub fn remove(home: &Path, repo: &str) -> io::Result<()> {
    match fs::remove_file(index_path(home, repo)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
