//! Error types re-exported from `hg-error`

pub use hg_error::{HelmgateError, Result};
