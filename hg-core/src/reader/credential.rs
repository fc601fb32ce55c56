//! Wiegand-26 credential layout and parity
//!
//! Bit 25 is received first. It carries even parity over bits 24..13; bit 0
//! carries odd parity over bits 12..1. Site code is bits 24..17 and user code
//! bits 16..1.

use std::fmt;

use crate::constants::wiegand::*;
use crate::error::{HelmgateError, Result};
use crate::reader::RawFrame;

/// Fixed-width identity of a physical card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CardKey {
    pub site: u8,
    pub user: u16,
}

impl CardKey {
    pub const fn new(site: u8, user: u16) -> Self {
        Self { site, user }
    }
}

impl fmt::Display for CardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site, self.user)
    }
}

/// A validated card read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credential {
    pub raw: u32,
    pub key: CardKey,
}

impl Credential {
    /// Validate a captured frame: exactly 26 bits and both parities
    pub fn from_frame(frame: &RawFrame) -> Result<Self> {
        if frame.bit_count != FRAME_BITS {
            return Err(HelmgateError::FrameLength { bits: frame.bit_count });
        }
        let raw = frame.value & RAW_MASK;
        if !parity_ok(raw) {
            return Err(HelmgateError::Parity { raw });
        }
        Ok(Self { raw, key: extract(raw) })
    }

    /// Build the raw frame a reader would send for `key`
    pub fn encode(key: CardKey) -> u32 {
        let body = ((key.site as u32) << SITE_SHIFT) | ((key.user as u32) << USER_SHIFT);
        let high = (body >> HIGH_HALF_SHIFT) & HALF_MASK;
        let low = (body >> LOW_HALF_SHIFT) & HALF_MASK;
        let even = (high.count_ones() % 2 == 1) as u32;
        let odd = (low.count_ones() % 2 == 0) as u32;
        (even << EVEN_PARITY_BIT) | body | odd
    }

    pub fn site(&self) -> u8 {
        self.key.site
    }

    pub fn user(&self) -> u16 {
        self.key.user
    }
}

/// Both parity relations of a 26-bit raw value
pub fn parity_ok(raw: u32) -> bool {
    let high = (raw >> HIGH_HALF_SHIFT) & HALF_MASK;
    let low = (raw >> LOW_HALF_SHIFT) & HALF_MASK;
    let even_bit = (raw >> EVEN_PARITY_BIT) & 1 == 1;
    let odd_bit = raw & 1 == 1;

    even_bit == (high.count_ones() % 2 == 1) && odd_bit == (low.count_ones() % 2 == 0)
}

/// Site and user codes of a raw value (parity is not checked)
pub fn extract(raw: u32) -> CardKey {
    CardKey {
        site: ((raw >> SITE_SHIFT) & SITE_MASK) as u8,
        user: ((raw >> USER_SHIFT) & USER_MASK) as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(value: u32, bits: u8) -> RawFrame {
        RawFrame { bit_count: bits, value, first_bit_ms: 0, last_bit_ms: 0 }
    }

    /// Bit-by-bit reimplementation of the two checks
    fn reference_parity(raw: u32) -> bool {
        let bit = |i: u32| (raw >> i) & 1;
        let high_ones: u32 = (13..=24).map(bit).sum();
        let low_ones: u32 = (1..=12).map(bit).sum();
        let even_ok = bit(25) == if high_ones % 2 == 1 { 1 } else { 0 };
        let odd_ok = bit(0) == if low_ones % 2 == 0 { 1 } else { 0 };
        even_ok && odd_ok
    }

    proptest! {
        #[test]
        fn parity_matches_reference(raw in 0u32..(1 << 26)) {
            prop_assert_eq!(parity_ok(raw), reference_parity(raw));
        }

        #[test]
        fn encode_is_valid_and_extracts_back(site in any::<u8>(), user in any::<u16>()) {
            let key = CardKey::new(site, user);
            let raw = Credential::encode(key);
            prop_assert!(raw <= RAW_MASK);
            prop_assert!(parity_ok(raw));
            prop_assert_eq!(extract(raw), key);
        }
    }

    #[test]
    fn test_known_card() {
        let raw = Credential::encode(CardKey::new(148, 19828));
        let cred = Credential::from_frame(&frame(raw, 26)).unwrap();
        assert_eq!(cred.site(), 148);
        assert_eq!(cred.user(), 19828);
        assert_eq!(cred.raw, raw);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let raw = Credential::encode(CardKey::new(1, 2));
        assert!(matches!(
            Credential::from_frame(&frame(raw, 25)),
            Err(HelmgateError::FrameLength { bits: 25 })
        ));
        assert!(matches!(
            Credential::from_frame(&frame(raw, 34)),
            Err(HelmgateError::FrameLength { bits: 34 })
        ));
    }

    #[test]
    fn test_flipped_bit_fails_parity() {
        let raw = Credential::encode(CardKey::new(12, 345));
        for i in 0..26 {
            let corrupted = raw ^ (1 << i);
            assert!(
                matches!(
                    Credential::from_frame(&frame(corrupted, 26)),
                    Err(HelmgateError::Parity { .. })
                ),
                "bit {} flip went undetected",
                i
            );
        }
    }

    #[test]
    fn test_all_zero_frame_fails_odd_parity() {
        assert!(!parity_ok(0));
    }
}
