//! Durable audit log of access decisions and its integrity manifests

mod manifest;
mod query;
mod record;
mod store;

pub use query::EventFilter;
pub use record::{AccessEvent, EventRecord, Stamp};
pub use store::EventJournal;
