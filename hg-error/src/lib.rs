//! Unified error handling for helmgate
//!
//! A single error type used by the core library, the daemon and the CLI.
//! Steady-state failures are logged and recovered by the caller; the variants
//! here mostly exist so that callers can tell the classes apart.

use std::io;
use std::path::PathBuf;

/// Result type alias using HelmgateError
pub type Result<T> = std::result::Result<T, HelmgateError>;

/// Unified error type for all helmgate operations
#[derive(thiserror::Error, Debug)]
pub enum HelmgateError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    #[error("Required resource missing: {0}")]
    ResourceMissing(String),

    // ============================================================================
    // Card Reader Protocol Errors
    // ============================================================================
    #[error("Wiegand frame has {bits} bits (expected 26)")]
    FrameLength {
        bits: u8,
    },

    #[error("Wiegand parity check failed for raw frame {raw:#09x}")]
    Parity {
        raw: u32,
    },

    // ============================================================================
    // Integrity Errors
    // ============================================================================
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        expected: String,
        actual: String,
    },

    #[error("Invalid remote manifest: {0}")]
    ManifestInvalid(String),

    // ============================================================================
    // Network Errors
    // ============================================================================
    #[error("HTTP {status} from {context}")]
    Http {
        status: u16,
        context: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    // ============================================================================
    // Classifier Errors
    // ============================================================================
    #[error("Classifier error: {0}")]
    Classifier(String),
}

impl HelmgateError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a transport error from a string
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a classifier error from a string
    pub fn classifier(msg: impl Into<String>) -> Self {
        Self::Classifier(msg.into())
    }

    /// Errors that must stop the device from starting
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidConfig { .. }
                | Self::MissingConfig(_)
                | Self::ResourceMissing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_fatality() {
        assert!(HelmgateError::config("bad").is_fatal_at_startup());
        assert!(HelmgateError::ResourceMissing("labels".into()).is_fatal_at_startup());
        assert!(!HelmgateError::transport("reset").is_fatal_at_startup());
        assert!(!HelmgateError::Parity { raw: 0 }.is_fatal_at_startup());
    }

    #[test]
    fn test_display_formats() {
        let err = HelmgateError::DigestMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(err.to_string(), "Digest mismatch: expected aa, got bb");
        assert_eq!(
            HelmgateError::FrameLength { bits: 12 }.to_string(),
            "Wiegand frame has 12 bits (expected 26)"
        );
    }
}
