//! Sliding-window suppression of repeated card reads
//!
//! A card held against the reader is read over and over. Four gates, checked
//! in order, keep one presentation from producing more than one decision:
//!
//! 1. anti-bounce: any frame within `anti_bounce_ms` of the last admitted one
//! 2. raw value: the same 26-bit frame within `card_cooldown_ms`
//! 3. credential: the same (site, user) within `card_cooldown_ms`
//! 4. outcome: the same (site, user, authorized, helmet) within `event_dedup_ms`
//!
//! Every gate records a key only when it lets it through, so a suppressed read
//! never extends its own window.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::clock::elapsed_ms;
use crate::config::TimingConfig;
use crate::constants::limits::DEDUP_PRUNE_THRESHOLD;
use crate::reader::CardKey;

/// Which gate suppressed a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    AntiBounce,
    RawValue,
    Credential,
    Outcome,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Gate::AntiBounce => "anti-bounce",
            Gate::RawValue => "raw value",
            Gate::Credential => "credential",
            Gate::Outcome => "outcome",
        })
    }
}

/// Decision identity used by the outcome gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutcomeKey {
    pub card: CardKey,
    pub authorized: bool,
    pub helmet: bool,
}

impl OutcomeKey {
    pub fn denied(card: CardKey) -> Self {
        Self { card, authorized: false, helmet: false }
    }

    pub fn authorized(card: CardKey, helmet: bool) -> Self {
        Self { card, authorized: true, helmet }
    }
}

/// Last accepted time per key
#[derive(Debug)]
struct SlidingWindow<K> {
    window_ms: u64,
    seen: HashMap<K, u64>,
}

impl<K: Eq + Hash + Copy> SlidingWindow<K> {
    fn new(window_ms: u64) -> Self {
        Self { window_ms, seen: HashMap::new() }
    }

    fn suppresses(&self, key: &K, now_ms: u64) -> bool {
        self.seen
            .get(key)
            .is_some_and(|&at| elapsed_ms(now_ms, at) < self.window_ms)
    }

    fn accept(&mut self, key: K, now_ms: u64) {
        if self.seen.len() >= DEDUP_PRUNE_THRESHOLD {
            let window = self.window_ms;
            self.seen.retain(|_, at| elapsed_ms(now_ms, *at) < window);
        }
        self.seen.insert(key, now_ms);
    }
}

#[derive(Debug)]
pub struct DedupGates {
    anti_bounce_ms: u64,
    last_admitted_ms: Option<u64>,
    raw: SlidingWindow<u32>,
    credential: SlidingWindow<CardKey>,
    outcome: SlidingWindow<OutcomeKey>,
}

impl DedupGates {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            anti_bounce_ms: timing.anti_bounce_ms,
            last_admitted_ms: None,
            raw: SlidingWindow::new(timing.card_cooldown_ms),
            credential: SlidingWindow::new(timing.card_cooldown_ms),
            outcome: SlidingWindow::new(timing.event_dedup_ms),
        }
    }

    /// Run a validated frame through the reader-level gates.
    ///
    /// Gates are evaluated in order and each one that passes records the read
    /// before the next is checked.
    pub fn admit_read(&mut self, raw: u32, card: CardKey, now_ms: u64) -> Result<(), Gate> {
        if let Some(last) = self.last_admitted_ms {
            if elapsed_ms(now_ms, last) < self.anti_bounce_ms {
                trace!(raw, "Suppressed by anti-bounce");
                return Err(Gate::AntiBounce);
            }
        }
        self.last_admitted_ms = Some(now_ms);

        if self.raw.suppresses(&raw, now_ms) {
            return Err(Gate::RawValue);
        }
        self.raw.accept(raw, now_ms);

        if self.credential.suppresses(&card, now_ms) {
            return Err(Gate::Credential);
        }
        self.credential.accept(card, now_ms);
        Ok(())
    }

    /// Whether `outcome` was already recorded inside its window
    pub fn outcome_is_duplicate(&self, outcome: &OutcomeKey, now_ms: u64) -> bool {
        self.outcome.suppresses(outcome, now_ms)
    }

    /// Record a logged outcome
    pub fn record_outcome(&mut self, outcome: OutcomeKey, now_ms: u64) {
        self.outcome.accept(outcome, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gates() -> DedupGates {
        DedupGates::new(&TimingConfig::default())
    }

    const CARD: CardKey = CardKey::new(10, 1234);

    #[test]
    fn test_same_raw_within_window_admitted_once() {
        let mut g = gates();
        assert_eq!(g.admit_read(0xABCDE, CARD, 10_000), Ok(()));
        assert_eq!(g.admit_read(0xABCDE, CARD, 11_000), Err(Gate::RawValue));
        assert_eq!(g.admit_read(0xABCDE, CARD, 15_999), Err(Gate::RawValue));
        assert_eq!(g.admit_read(0xABCDE, CARD, 16_000), Ok(()));
    }

    #[test]
    fn test_anti_bounce_blocks_any_frame() {
        let mut g = gates();
        assert_eq!(g.admit_read(1, CardKey::new(1, 1), 1_000), Ok(()));
        assert_eq!(g.admit_read(2, CardKey::new(2, 2), 1_500), Err(Gate::AntiBounce));
        assert_eq!(g.admit_read(2, CardKey::new(2, 2), 1_800), Ok(()));
    }

    #[test]
    fn test_same_card_different_raw_suppressed() {
        let mut g = gates();
        assert_eq!(g.admit_read(100, CARD, 0), Ok(()));
        assert_eq!(g.admit_read(200, CARD, 1_000), Err(Gate::Credential));
    }

    #[test]
    fn test_suppression_does_not_extend_window() {
        let mut g = gates();
        assert_eq!(g.admit_read(7, CARD, 0), Ok(()));
        assert_eq!(g.admit_read(7, CARD, 5_000), Err(Gate::RawValue));
        // window runs from the accepted read at 0, not the suppressed one
        assert_eq!(g.admit_read(7, CARD, 6_000), Ok(()));
    }

    #[test]
    fn test_outcome_window() {
        let mut g = gates();
        let denied = OutcomeKey::denied(CARD);
        let no_helmet = OutcomeKey::authorized(CARD, false);

        assert!(!g.outcome_is_duplicate(&denied, 0));
        g.record_outcome(denied, 0);
        assert!(g.outcome_is_duplicate(&denied, 5_999));
        assert!(!g.outcome_is_duplicate(&no_helmet, 1_000));
        assert!(!g.outcome_is_duplicate(&denied, 6_000));
    }

    #[test]
    fn test_prune_keeps_recent_keys() {
        let mut g = gates();
        for i in 0..DEDUP_PRUNE_THRESHOLD as u32 {
            g.raw.accept(i, 0);
        }
        g.raw.accept(9_999, 7_000);
        assert_eq!(g.raw.seen.len(), 1);

        g.raw.accept(1, 7_001);
        assert!(g.raw.suppresses(&9_999, 7_002));
    }
}
