//! Device configuration
//!
//! One JSON file describes the checkpoint: identity, storage layout, timing
//! windows, fusion parameters, server endpoints and the reader/classifier
//! wiring. Every field has a default so a partial file is valid.
//!
//! The configuration is loaded once at startup and handed to each component
//! at construction; nothing reads it from a global afterwards.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{fusion, identity, limits, paths, timing};
use crate::durable;
use crate::engine::TiePolicy;
use crate::error::{HelmgateError, Result};

/// Complete device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Identity of the physical checkpoint, written into every event
    #[serde(default = "default_checkpoint")]
    pub checkpoint: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: u32,
    /// Time zone label written next to each timestamp
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// One audit log per month; false keeps a single `events.csv`
    #[serde(default = "default_true")]
    pub monthly_rotation: bool,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub fusion: FusionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Which decisions keep the classifier's proof image reference
    #[serde(default)]
    pub proof_images: ProofImagePolicy,
}

fn default_checkpoint() -> String {
    identity::CHECKPOINT.to_string()
}

fn default_firmware_version() -> u32 {
    identity::FIRMWARE_VERSION
}

fn default_tz() -> String {
    identity::TZ_NAME.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(paths::DATA_DIR)
}

fn default_media_dir() -> PathBuf {
    PathBuf::from(paths::MEDIA_DIR)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(paths::STATE_DIR)
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            checkpoint: default_checkpoint(),
            firmware_version: default_firmware_version(),
            tz: default_tz(),
            data_dir: default_data_dir(),
            media_dir: default_media_dir(),
            state_dir: default_state_dir(),
            monthly_rotation: true,
            timing: TimingConfig::default(),
            fusion: FusionConfig::default(),
            server: ServerConfig::default(),
            gpio: GpioConfig::default(),
            classifier: ClassifierConfig::default(),
            proof_images: ProofImagePolicy::default(),
        }
    }
}

/// When an authorized decision records its proof image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofImagePolicy {
    #[default]
    Always,
    /// Only when the helmet was judged absent
    NoHelmetOnly,
    Never,
}

impl ProofImagePolicy {
    pub fn keeps(self, helmet: bool) -> bool {
        match self {
            Self::Always => true,
            Self::NoHelmetOnly => !helmet,
            Self::Never => false,
        }
    }
}

/// Timing windows, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub frame_timeout_ms: u64,
    pub anti_bounce_ms: u64,
    pub card_cooldown_ms: u64,
    pub event_dedup_ms: u64,
    pub upload_cooldown_ms: u64,
    pub cards_poll_ms: u64,
    pub poll_sleep_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: timing::FRAME_TIMEOUT_MS,
            anti_bounce_ms: timing::ANTI_BOUNCE_MS,
            card_cooldown_ms: timing::CARD_COOLDOWN_MS,
            event_dedup_ms: timing::EVENT_DEDUP_MS,
            upload_cooldown_ms: timing::UPLOAD_COOLDOWN_MS,
            cards_poll_ms: timing::CARDS_POLL_MS,
            poll_sleep_ms: timing::POLL_SLEEP_MS,
        }
    }
}

/// Classifier fusion parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub min_confidence: f32,
    pub max_frames: u32,
    pub early_stop: bool,
    /// Outcome of an exact tie in both count and best confidence
    pub tie_policy: TiePolicy,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_confidence: fusion::MIN_CONFIDENCE,
            max_frames: fusion::MAX_FRAMES,
            early_stop: fusion::EARLY_STOP,
            tie_policy: TiePolicy::default(),
        }
    }
}

/// Remote endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Upload endpoint for the monthly audit log
    pub function_url: Option<String>,
    /// Authorization list manifest endpoint
    pub cards_url: Option<String>,
    /// Shared secret sent in the `x-edge-key` header
    pub edge_api_key: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            function_url: None,
            cards_url: None,
            edge_api_key: None,
            request_timeout_secs: timing::REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Reader wiring (sysfs GPIO numbers of the two Wiegand data lines)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub sysfs_base: PathBuf,
    pub data0_line: Option<u32>,
    pub data1_line: Option<u32>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            sysfs_base: PathBuf::from("/sys/class/gpio"),
            data0_line: None,
            data1_line: None,
        }
    }
}

/// External single-frame classifier process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Command printing one JSON frame result per invocation
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Model file that must exist before the device starts
    pub model_path: Option<PathBuf>,
    /// Label list that must name both helmet classes
    pub labels_path: Option<PathBuf>,
}

impl DeviceConfig {
    /// Reject values the device cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint.trim().is_empty() {
            return Err(HelmgateError::invalid_config("checkpoint", "must not be empty"));
        }
        // Both are written verbatim into every audit log line
        for (field, value) in [("checkpoint", &self.checkpoint), ("tz", &self.tz)] {
            if value.contains(&[',', '\n', '\r'][..]) {
                return Err(HelmgateError::invalid_config(field, "must not contain commas or line breaks"));
            }
        }
        let t = &self.timing;
        for (field, value) in [
            ("timing.frame_timeout_ms", t.frame_timeout_ms),
            ("timing.card_cooldown_ms", t.card_cooldown_ms),
            ("timing.event_dedup_ms", t.event_dedup_ms),
            ("timing.upload_cooldown_ms", t.upload_cooldown_ms),
            ("timing.cards_poll_ms", t.cards_poll_ms),
        ] {
            if value == 0 {
                return Err(HelmgateError::invalid_config(field, "must be greater than zero"));
            }
        }
        let f = &self.fusion;
        if !(f.min_confidence > 0.0 && f.min_confidence <= 1.0) {
            return Err(HelmgateError::invalid_config(
                "fusion.min_confidence",
                format!("{} is outside (0, 1]", f.min_confidence),
            ));
        }
        if f.max_frames == 0 {
            return Err(HelmgateError::invalid_config("fusion.max_frames", "must be at least 1"));
        }
        Ok(())
    }

    /// Tag of the period containing `at` (empty when rotation is off)
    pub fn period_for(&self, at: &chrono::NaiveDateTime) -> String {
        if self.monthly_rotation {
            crate::clock::period_tag(at)
        } else {
            String::new()
        }
    }

    pub fn cards_csv(&self) -> PathBuf {
        self.state_dir.join(paths::CARDS_FILE)
    }

    pub fn cards_tmp(&self) -> PathBuf {
        self.state_dir.join(paths::CARDS_TMP_FILE)
    }

    pub fn cards_state(&self) -> PathBuf {
        self.state_dir.join(paths::CARDS_STATE_FILE)
    }

    pub fn events_csv(&self, period: &str) -> PathBuf {
        self.data_dir.join(hg_protocol::events_csv_name(period))
    }

    pub fn events_manifest(&self, period: &str) -> PathBuf {
        self.data_dir.join(hg_protocol::events_manifest_name(period))
    }

    /// Create the data, media and state directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.media_dir, &self.state_dir] {
            durable::ensure_dir(dir)?;
        }
        Ok(())
    }
}

/// Resolve which configuration file to read.
///
/// `HELMGATE_CONFIG` wins; then the system file; an unprivileged operator
/// without a system file falls back to their own config directory.
pub fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var(paths::CONFIG_ENV) {
        if !p.trim().is_empty() {
            return PathBuf::from(p);
        }
    }
    let system = PathBuf::from(paths::CONFIG_FILE);
    if system.exists() {
        return system;
    }
    match paths::user_config_file() {
        Some(user) if user.exists() => user,
        _ => system,
    }
}

/// Load the configuration from its resolved location
pub fn load_config() -> Result<DeviceConfig> {
    load_config_from(&config_path())
}

/// Load and validate a configuration file.
///
/// A missing file yields the defaults; a file that exists but cannot be read
/// or parsed is an error, since the device must not guess its identity.
pub fn load_config_from(path: &Path) -> Result<DeviceConfig> {
    if !path.exists() {
        warn!(path = ?path, "No configuration file, using defaults");
        return Ok(DeviceConfig::default());
    }

    let bytes = durable::read_limited(path, limits::MAX_CONFIG_SIZE)?;
    let config: DeviceConfig = serde_json::from_slice(&bytes)
        .map_err(|e| HelmgateError::config(format!("{}: {}", path.display(), e)))?;
    config.validate()?;

    info!(path = ?path, checkpoint = %config.checkpoint, "Loaded configuration");
    debug!(?config, "Effective configuration");
    Ok(config)
}
