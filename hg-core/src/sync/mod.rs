//! Reconciliation with the remote service
//!
//! - `cards`: pull of the authorization table, gated on the published digest
//! - `upload`: rate-limited push of the current period's audit log
//! - `transport`: the HTTP seam both of them go through

mod cards;
mod transport;
mod upload;

pub use cards::{CardSyncer, SyncOutcome};
#[cfg(test)]
pub use transport::MockTransport;
pub use transport::{HttpResponse, HttpTransport, Transport, UploadForm};
pub use upload::{UploadOutcome, UploadScheduler};
