//! Period manifest: record count and digest of a whole audit log file
//!
//! Always recomputed from the file and replaced atomically, never patched.

use std::fs::File;
use std::io::Read;

use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use hg_protocol::PeriodManifest;

use crate::clock::format_timestamp;
use crate::constants::limits;
use crate::durable;
use crate::error::{HelmgateError, Result};
use crate::journal::EventJournal;

/// Data lines and digest of a file, hashed in one streaming pass
fn count_and_hash(file: &mut File) -> std::io::Result<(u64, String)> {
    let mut hasher = Sha256::new();
    let mut block = [0u8; limits::HASH_BLOCK];
    let mut newlines = 0u64;
    let mut last = None;
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
        newlines += block[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last = Some(block[n - 1]);
    }
    let lines = match last {
        None => 0,
        Some(b'\n') => newlines,
        Some(_) => newlines + 1,
    };
    Ok((lines.saturating_sub(1), format!("{:x}", hasher.finalize())))
}

impl EventJournal {
    /// Recompute and atomically replace the manifest of `period`
    pub fn recompute_manifest(&self, period: &str, now: &NaiveDateTime) -> Result<PeriodManifest> {
        let csv = self.ensure_period_file(period)?;
        durable::sync_filesystem();

        let mut file = File::open(&csv).map_err(|source| HelmgateError::FileRead {
            path: csv.clone(),
            source,
        })?;
        let (count, sha256) = count_and_hash(&mut file).map_err(|source| HelmgateError::FileRead {
            path: csv.clone(),
            source,
        })?;

        let manifest = PeriodManifest {
            month: period.to_string(),
            csv: csv.display().to_string(),
            count,
            sha256,
            checkpoint: self.stamp.checkpoint.clone(),
            version: self.stamp.version,
            tz: self.stamp.tz.clone(),
            updated_at: format_timestamp(now),
        };

        let json = serde_json::to_vec_pretty(&manifest)?;
        durable::atomic_replace(&self.manifest_path(period), &json)?;
        info!(period, count, sha256 = %manifest.sha256, "Manifest updated");
        Ok(manifest)
    }

    /// Stored manifest of `period`, if any
    pub fn read_manifest(&self, period: &str) -> Result<Option<PeriodManifest>> {
        let path = self.manifest_path(period);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = durable::read_limited(&path, limits::MAX_STATE_SIZE)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Whether the stored manifest still describes the file on storage
    pub fn verify_manifest(&self, period: &str) -> Result<bool> {
        let Some(stored) = self.read_manifest(period)? else {
            return Ok(false);
        };
        let csv = self.csv_path(period);
        let mut file = match File::open(&csv) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(HelmgateError::FileRead { path: csv, source }),
        };
        let (count, sha256) =
            count_and_hash(&mut file).map_err(|source| HelmgateError::FileRead { path: csv, source })?;
        let ok = count == stored.count && sha256 == stored.sha256;
        if !ok {
            warn!(period, count, stored = stored.count, "Manifest does not match audit log");
        }
        Ok(ok)
    }
}
