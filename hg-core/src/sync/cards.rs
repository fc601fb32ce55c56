//! Authorization table pull
//!
//! The remote side publishes a small manifest (`version`, `sha256`, `url`).
//! The table is only downloaded when its digest differs from the local file,
//! and only installed once the downloaded bytes hash to the published digest.

use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use hg_protocol::{body_excerpt, parse_tolerant, RemoteCardsManifest, SyncState};

use crate::config::DeviceConfig;
use crate::constants::limits;
use crate::durable;
use crate::error::{HelmgateError, Result};
use crate::sync::Transport;

/// Result of one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub updated: bool,
    pub version: String,
}

pub struct CardSyncer {
    cards_url: Option<String>,
    cards_path: PathBuf,
    tmp_path: PathBuf,
    state_path: PathBuf,
}

impl CardSyncer {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            cards_url: config.server.cards_url.clone().filter(|u| !u.is_empty()),
            cards_path: config.cards_csv(),
            tmp_path: config.cards_tmp(),
            state_path: config.cards_state(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.cards_url.is_some()
    }

    /// Last applied update; an unreadable state file counts as no state
    pub fn load_state(&self) -> SyncState {
        match durable::read_limited(&self.state_path, limits::MAX_STATE_SIZE) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = ?self.state_path, error = %e, "Ignoring corrupt sync state");
                SyncState::default()
            }),
            Err(HelmgateError::FileNotFound(_)) => SyncState::default(),
            Err(e) => {
                warn!(error = %e, "Could not read sync state");
                SyncState::default()
            }
        }
    }

    fn save_state(&self, version: &str, sha256: &str) {
        let state = SyncState {
            version: Some(version.to_string()),
            sha256: Some(sha256.to_string()),
        };
        let result = serde_json::to_vec(&state)
            .map_err(HelmgateError::from)
            .and_then(|json| durable::atomic_replace(&self.state_path, &json));
        if let Err(e) = result {
            warn!(error = %e, "Could not persist sync state");
        }
    }

    /// Fetch and validate the remote manifest
    pub fn fetch_manifest(&self, transport: &dyn Transport) -> Result<RemoteCardsManifest> {
        let url = self
            .cards_url
            .as_deref()
            .ok_or_else(|| HelmgateError::MissingConfig("server.cards_url".into()))?;
        let resp = transport.get(url, true)?;
        if resp.status != 200 {
            debug!(body = ?body_excerpt(&resp.body), "Manifest request refused");
            return Err(HelmgateError::Http { status: resp.status, context: "cards manifest".into() });
        }
        let manifest: RemoteCardsManifest = parse_tolerant(&resp.body).ok_or_else(|| {
            HelmgateError::ManifestInvalid(format!(
                "unparsable body: {}",
                body_excerpt(&resp.body).unwrap_or_default()
            ))
        })?;
        manifest.validate().map_err(HelmgateError::ManifestInvalid)?;
        if manifest.sha256.is_empty() {
            return Err(HelmgateError::ManifestInvalid("manifest has no 'sha256'".into()));
        }
        Ok(manifest)
    }

    /// Bring the local table in line with the remote manifest.
    ///
    /// `reload` runs only after a verified table has been installed.
    pub fn ensure_updated<F: FnOnce()>(&self, transport: &dyn Transport, reload: F) -> Result<SyncOutcome> {
        let state = self.load_state();
        let manifest = self.fetch_manifest(transport)?;
        let version = manifest.version_string();
        let remote_sha = manifest.sha256.to_ascii_lowercase();

        if self.cards_path.exists() {
            match durable::sha256_file(&self.cards_path) {
                Ok(local_sha) if local_sha == remote_sha => {
                    if !version.is_empty() && state.version.as_deref() == Some(version.as_str()) {
                        debug!(version = %version, "Authorization table up to date");
                    } else {
                        info!(version = %version, "Table unchanged, recording new version");
                        self.save_state(&version, &remote_sha);
                    }
                    return Ok(SyncOutcome { updated: false, version });
                }
                Ok(_) => debug!("Local table differs from remote"),
                Err(e) => warn!(error = %e, "Could not hash local table"),
            }
        }

        // validate() guarantees the url
        let url = manifest.url.as_deref().unwrap_or_default();
        info!(version = %version, size = ?manifest.size, "Downloading authorization table");
        let resp = transport.get(url, false)?;
        if resp.status != 200 {
            return Err(HelmgateError::Http { status: resp.status, context: "cards download".into() });
        }
        durable::write_synced(&self.tmp_path, &resp.body)?;

        let downloaded = durable::sha256_file(&self.tmp_path)?;
        if downloaded != remote_sha {
            let _ = fs::remove_file(&self.tmp_path);
            warn!(expected = %remote_sha, actual = %downloaded, "Rejected downloaded table");
            return Err(HelmgateError::DigestMismatch { expected: remote_sha, actual: downloaded });
        }

        durable::install_file(&self.tmp_path, &self.cards_path)?;
        self.save_state(&version, &remote_sha);
        reload();
        info!(version = %version, sha256 = %remote_sha, "Authorization table updated");
        Ok(SyncOutcome { updated: true, version })
    }
}
