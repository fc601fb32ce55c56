//! Constants and configuration defaults for helmgate
//!
//! Centralizes timing windows, paths and limits. Every value here is the
//! default of a `DeviceConfig` field unless noted otherwise.

use std::time::Duration;

/// Filesystem layout of the device
pub mod paths {
    /// System configuration file
    pub const CONFIG_FILE: &str = "/etc/helmgate/config.json";

    /// Environment variable overriding the configuration file location
    pub const CONFIG_ENV: &str = "HELMGATE_CONFIG";

    /// Default directory holding the audit log and manifests
    pub const DATA_DIR: &str = "/var/lib/helmgate/data";

    /// Default directory holding proof images
    pub const MEDIA_DIR: &str = "/var/lib/helmgate/media";

    /// Default directory holding the authorization table and sync state
    pub const STATE_DIR: &str = "/var/lib/helmgate/config";

    /// Authorization table file name
    pub const CARDS_FILE: &str = "cards.csv";

    /// Download staging file for the authorization table
    pub const CARDS_TMP_FILE: &str = "cards.csv.tmp";

    /// Persisted authorization sync state
    pub const CARDS_STATE_FILE: &str = "cards_state.json";

    /// Per-user configuration file (used by the CLI when not running as root)
    pub fn user_config_file() -> Option<std::path::PathBuf> {
        dirs::config_dir().map(|d| d.join("helmgate").join("config.json"))
    }
}

/// Device identity defaults
pub mod identity {
    pub const CHECKPOINT: &str = "SALA_MAQUINAS_A";
    pub const FIRMWARE_VERSION: u32 = 7;
    pub const TZ_NAME: &str = "Europe/Madrid";
}

/// Wiegand-26 frame layout
pub mod wiegand {
    /// Bits in a valid frame
    pub const FRAME_BITS: u8 = 26;

    /// Bit position of the leading even-parity bit
    pub const EVEN_PARITY_BIT: u32 = 25;

    /// Shift of the 12 bits covered by the even parity (bits 24..13)
    pub const HIGH_HALF_SHIFT: u32 = 13;

    /// Shift of the 12 bits covered by the odd parity (bits 12..1)
    pub const LOW_HALF_SHIFT: u32 = 1;

    pub const HALF_MASK: u32 = 0xFFF;

    /// Site code: bits 24..17
    pub const SITE_SHIFT: u32 = 17;
    pub const SITE_MASK: u32 = 0xFF;

    /// User code: bits 16..1
    pub const USER_SHIFT: u32 = 1;
    pub const USER_MASK: u32 = 0xFFFF;

    /// Mask of a 26-bit raw value
    pub const RAW_MASK: u32 = (1 << 26) - 1;
}

/// Timing windows
pub mod timing {
    use super::*;

    /// Silence after the last bit that closes a frame
    pub const FRAME_TIMEOUT_MS: u64 = 50;

    /// Reader-level anti-bounce between any two accepted frames
    pub const ANTI_BOUNCE_MS: u64 = 800;

    /// Raw and logical credential suppression window
    pub const CARD_COOLDOWN_MS: u64 = 6000;

    /// Outcome suppression window
    pub const EVENT_DEDUP_MS: u64 = 6000;

    /// Minimum spacing between two upload attempts
    pub const UPLOAD_COOLDOWN_MS: u64 = 8000;

    /// Authorization list pull interval
    pub const CARDS_POLL_MS: u64 = 10 * 60 * 1000;

    /// How often the authorization file is checked for outside edits
    pub const CARDS_FILE_CHECK_MS: u64 = 2000;

    /// Poll loop sleep between iterations
    pub const POLL_SLEEP_MS: u64 = 2;

    /// Network request timeout
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Classifier fusion parameters
pub mod fusion {
    /// Detections below this score are ignored
    pub const MIN_CONFIDENCE: f32 = 0.40;

    /// Frames sampled per credential
    pub const MAX_FRAMES: u32 = 8;

    /// Stop sampling once one class clearly leads
    pub const EARLY_STOP: bool = true;

    /// Detections a class needs before early stop can trigger
    pub const EARLY_STOP_MIN_HITS: u32 = 2;
}

/// Size limits
pub mod limits {
    /// Maximum configuration file size (1 MiB)
    pub const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

    /// Maximum sync state file size
    pub const MAX_STATE_SIZE: u64 = 64 * 1024;

    /// Read block used when hashing files
    pub const HASH_BLOCK: usize = 4096;

    /// Dedup maps are pruned once they hold this many entries
    pub const DEDUP_PRUNE_THRESHOLD: usize = 256;
}

/// Default holder name for enabled rows without one
pub const DEFAULT_HOLDER_NAME: &str = "Operario";

/// Timestamp format of audit log lines and manifests
pub const TIMESTAMP_FORMAT: &str = "%d-%m-%YT%H:%M:%S";

/// Period tag format
pub const PERIOD_FORMAT: &str = "%Y%m";
