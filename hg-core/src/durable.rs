//! Crash-safe file primitives
//!
//! The device loses power without warning, so every write that matters is
//! flushed and synced before the call returns. Replacing a whole file goes
//! through a temporary sibling and a rename, the only step assumed atomic.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::constants::limits;
use crate::error::{HelmgateError, Result};

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> HelmgateError + '_ {
    move |source| HelmgateError::FileWrite { path: path.to_path_buf(), source }
}

fn read_err(path: &Path) -> impl FnOnce(std::io::Error) -> HelmgateError + '_ {
    move |source| HelmgateError::FileRead { path: path.to_path_buf(), source }
}

/// Temporary sibling used while replacing `path`
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Append one line and force it to storage before returning
pub fn append_line_durable(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(write_err(path))?;
    file.write_all(line.as_bytes()).map_err(write_err(path))?;
    if !line.ends_with('\n') {
        file.write_all(b"\n").map_err(write_err(path))?;
    }
    file.flush().map_err(write_err(path))?;
    file.sync_all().map_err(write_err(path))?;
    Ok(())
}

/// Write `header` as the first line if the file is missing or empty.
///
/// Emptiness is decided by size, never by content. Returns true when the
/// header was written.
pub fn write_header_if_empty(path: &Path, header: &str) -> Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > 0 => return Ok(false),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(read_err(path)(e)),
    }
    let mut file = File::create(path).map_err(write_err(path))?;
    file.write_all(header.as_bytes()).map_err(write_err(path))?;
    file.write_all(b"\n").map_err(write_err(path))?;
    file.flush().map_err(write_err(path))?;
    file.sync_all().map_err(write_err(path))?;
    debug!(path = ?path, "Wrote header");
    Ok(true)
}

/// Create or truncate `path` with `contents` and sync it
pub fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(write_err(path))?;
    file.write_all(contents).map_err(write_err(path))?;
    file.sync_all().map_err(write_err(path))
}

/// Replace `path` with `contents` through a synced temporary file
pub fn atomic_replace(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = tmp_path(path);
    write_synced(&temp_path, contents)?;
    install_file(&temp_path, path)
}

/// Move an already-synced staging file over `dest`.
///
/// The old file is removed first (some storage backends refuse to rename over
/// an existing entry); a crash between the two steps leaves the staging file
/// in place for the next attempt.
pub fn install_file(staged: &Path, dest: &Path) -> Result<()> {
    match fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(write_err(dest)(e)),
    }
    if let Err(e) = fs::rename(staged, dest) {
        let _ = fs::remove_file(staged);
        return Err(write_err(dest)(e));
    }
    sync_parent_dir(dest);
    Ok(())
}

fn sync_parent_dir(path: &Path) {
    let Some(parent) = path.parent() else { return };
    let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
    match File::open(parent).and_then(|dir| dir.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!(dir = ?parent, error = %e, "Directory sync not supported"),
    }
}

/// Flush every pending write of the system to storage
pub fn sync_filesystem() {
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() };
}

/// Lowercase hex SHA-256 of a whole file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(read_err(path))?;
    let mut hasher = Sha256::new();
    let mut block = [0u8; limits::HASH_BLOCK];
    loop {
        let n = file.read(&mut block).map_err(read_err(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Lowercase hex SHA-256 of an in-memory buffer
pub fn sha256_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Read a whole file, refusing anything larger than `max_size`
pub fn read_limited(path: &Path, max_size: u64) -> Result<Vec<u8>> {
    let metadata = fs::metadata(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            HelmgateError::FileNotFound(path.to_path_buf())
        } else {
            read_err(path)(e)
        }
    })?;
    if metadata.len() > max_size {
        return Err(HelmgateError::FileTooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            max_size,
        });
    }
    fs::read(path).map_err(read_err(path))
}

/// Create a directory tree, logging instead of failing when it already exists
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| {
        warn!(dir = ?dir, error = %e, "Could not create directory");
        write_err(dir)(e)
    })
}
