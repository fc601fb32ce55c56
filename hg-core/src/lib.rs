//! helmgate Core Library
//!
//! Decision and audit core of a card-plus-helmet access checkpoint.
//!
//! # Features
//!
//! - **Card Reader**: lock-free Wiegand-26 accumulation and parity validation
//! - **Access Control**: authorization table with atomic reload, sliding-window dedup
//! - **Helmet Fusion**: multi-frame aggregation of an external classifier
//! - **Audit Log**: durable, month-rotated event log with integrity manifests
//! - **Reconciliation**: digest-gated card list pull and rate-limited log upload
//!
//! # Module Structure
//!
//! - `reader/` - Wiegand decoder and credential extraction
//! - `access/` - Authorization store and dedup gates
//! - `engine/` - Classifier fusion
//! - `journal/` - Event store, manifests and queries
//! - `sync/` - Remote reconciliation and HTTP transport
//! - `pipeline` - The per-frame decision pipeline tying it together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hg_core::{load_config, Checkpoint, SystemClock};
//!
//! let config = load_config().unwrap();
//! let checkpoint = Checkpoint::new(&config, Arc::new(SystemClock::new())).unwrap();
//! println!("{} cards loaded", checkpoint.cards().len());
//! ```

// Grouped modules
pub mod access;
pub mod engine;
pub mod journal;
pub mod reader;
pub mod sync;

// Standalone modules
pub mod clock;
pub mod config;
pub mod constants;
pub mod durable;
pub mod error;
pub mod pipeline;

// Re-export error types
pub use error::{HelmgateError, Result};

// Re-export configuration
pub use config::{
    config_path, load_config, load_config_from, ClassifierConfig, DeviceConfig, FusionConfig,
    GpioConfig, ProofImagePolicy, ServerConfig, TimingConfig,
};

pub use clock::{Clock, ManualClock, SystemClock};

// Re-export reader types
pub use reader::{CardKey, Credential, RawFrame, WiegandDecoder};

// Re-export access control types
pub use access::{AuthorizationStore, DedupGates, Gate, OutcomeKey};

// Re-export engine types
pub use engine::{FrameClassifier, FusionEngine, FusionResult, TiePolicy};

// Re-export journal types
pub use journal::{AccessEvent, EventFilter, EventJournal, EventRecord};

// Re-export sync types
pub use sync::{
    CardSyncer, HttpResponse, HttpTransport, SyncOutcome, Transport, UploadForm, UploadOutcome,
    UploadScheduler,
};

pub use pipeline::{Checkpoint, Decision};
