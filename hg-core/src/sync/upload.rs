//! Audit log upload
//!
//! Best-effort and at-least-once: each attempt sends the whole period file and
//! its manifest, the server deduplicates. Attempts are spaced by a cooldown no
//! matter how many events happen; a failed attempt is simply superseded by the
//! next due one. The local audit log stays the source of truth.

use std::fs;

use tracing::{debug, info, warn};

use hg_protocol::{body_excerpt, events_csv_name, events_manifest_name, parse_tolerant, UploadResponse};

use crate::clock::elapsed_ms;
use crate::config::DeviceConfig;
use crate::journal::EventJournal;
use crate::sync::{Transport, UploadForm};

/// What happened to an upload request
#[derive(Debug, Clone)]
pub enum UploadOutcome {
    /// Inside the cooldown window, nothing attempted
    CoolingDown,
    /// No endpoint or shared secret configured
    NotConfigured,
    /// Local files absent; no request was made
    MissingFiles { csv: bool, manifest: bool },
    /// The server answered with a decodable body
    Replied { status: u16, response: UploadResponse },
    /// The server answered but the body could not be decoded
    Unparsed { status: u16, excerpt: Option<String> },
    /// The request itself failed
    Failed(String),
}

impl UploadOutcome {
    /// Whether this outcome counts against the cooldown
    pub fn attempted(&self) -> bool {
        !matches!(self, Self::CoolingDown)
    }

    /// Server acknowledged and recomputed the digest
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Replied { response, .. } if response.is_verified())
    }
}

pub struct UploadScheduler {
    function_url: Option<String>,
    has_key: bool,
    cooldown_ms: u64,
    last_attempt_ms: Option<u64>,
}

impl UploadScheduler {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            function_url: config
                .server
                .function_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            has_key: config.server.edge_api_key.as_deref().is_some_and(|k| !k.is_empty()),
            cooldown_ms: config.timing.upload_cooldown_ms,
            last_attempt_ms: None,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.last_attempt_ms
            .map_or(true, |last| elapsed_ms(now_ms, last) >= self.cooldown_ms)
    }

    /// Claim the attempt slot if the cooldown has passed
    pub fn begin_attempt(&mut self, now_ms: u64) -> bool {
        if !self.is_due(now_ms) {
            return false;
        }
        self.last_attempt_ms = Some(now_ms);
        true
    }

    /// Send `period`'s audit log and manifest, bypassing the cooldown
    pub fn upload(&self, journal: &EventJournal, period: &str, transport: &dyn Transport) -> UploadOutcome {
        let Some(url) = self.function_url.as_deref().filter(|_| self.has_key) else {
            debug!("Upload endpoint not configured");
            return UploadOutcome::NotConfigured;
        };

        let csv_path = journal.csv_path(period);
        let manifest_path = journal.manifest_path(period);
        let (csv_exists, manifest_exists) = (csv_path.exists(), manifest_path.exists());
        if !(csv_exists && manifest_exists) {
            warn!(period, csv = csv_exists, manifest = manifest_exists, "Upload skipped, files missing");
            return UploadOutcome::MissingFiles { csv: csv_exists, manifest: manifest_exists };
        }

        let (csv, manifest) = match (fs::read(&csv_path), fs::read(&manifest_path)) {
            (Ok(csv), Ok(manifest)) => (csv, manifest),
            (Err(e), _) | (_, Err(e)) => {
                warn!(period, error = %e, "Upload skipped, files unreadable");
                return UploadOutcome::Failed(e.to_string());
            }
        };
        let form = UploadForm {
            period: period.to_string(),
            csv_name: events_csv_name(period),
            csv,
            manifest_name: events_manifest_name(period),
            manifest,
        };

        info!(period, bytes = form.csv.len(), "Uploading audit log");
        let resp = match transport.post_upload(url, &form) {
            Ok(resp) => resp,
            Err(e) => {
                warn!(period, error = %e, "Upload failed");
                return UploadOutcome::Failed(e.to_string());
            }
        };

        match parse_tolerant::<UploadResponse>(&resp.body) {
            Some(response) => {
                if response.is_verified() {
                    info!(period, status = resp.status, "Upload verified");
                } else {
                    warn!(period, status = resp.status, ok = response.ok, "Upload not verified");
                }
                UploadOutcome::Replied { status: resp.status, response }
            }
            None => {
                let excerpt = body_excerpt(&resp.body);
                warn!(period, status = resp.status, body = ?excerpt, "Unparsable upload reply");
                UploadOutcome::Unparsed { status: resp.status, excerpt }
            }
        }
    }
}
