//! Access decisions: who may pass, and how often a card is acted upon

mod cards;
mod dedup;

pub use cards::{
    ensure_template, parse_row, parse_table, reload_or_keep, sanitize_field, AuthorizationStore,
    CardRow, CardTable,
};
pub use dedup::{DedupGates, Gate, OutcomeKey};
