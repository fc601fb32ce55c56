//! Wiegand bitstream accumulator
//!
//! The two data lines of the reader each raise an edge event per bit. The
//! handlers run in interrupt-like context (a dedicated thread on Linux, an
//! ISR on a microcontroller) and may only do integer work and a timestamp
//! read, so the whole frame state lives in one packed atomic word:
//!
//! ```text
//!  63        48 47     40 39     32 31                    0
//! [ generation ][ unused ][ count  ][        value         ]
//! ```
//!
//! The single consumer snapshots the word, checks the inter-bit timeout and
//! resets it with a compare-exchange. If a bit lands between the snapshot and
//! the reset the exchange fails and the frame is simply picked up on a later
//! poll, so a frame can never be split or merged with the next one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::{elapsed_ms, Clock};

const VALUE_MASK: u64 = 0xFFFF_FFFF;
const COUNT_SHIFT: u32 = 32;
const COUNT_MASK: u64 = 0xFF;
const GEN_SHIFT: u32 = 48;
const GEN_MASK: u64 = 0xFFFF;

#[inline]
fn value_of(state: u64) -> u32 {
    (state & VALUE_MASK) as u32
}

#[inline]
fn count_of(state: u64) -> u8 {
    ((state >> COUNT_SHIFT) & COUNT_MASK) as u8
}

#[inline]
fn gen_of(state: u64) -> u16 {
    ((state >> GEN_SHIFT) & GEN_MASK) as u16
}

#[inline]
fn pack(value: u32, count: u8, gen: u16) -> u64 {
    (value as u64) | ((count as u64) << COUNT_SHIFT) | ((gen as u64) << GEN_SHIFT)
}

/// A frame captured by the consumer, not yet validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    /// Bits received (saturates at 255)
    pub bit_count: u8,
    /// Accumulated bits, first received bit most significant
    pub value: u32,
    pub first_bit_ms: u64,
    pub last_bit_ms: u64,
}

/// Lock-free accumulator shared between the edge handlers and the poll loop
pub struct WiegandDecoder {
    state: AtomicU64,
    first_bit_ms: AtomicU64,
    last_bit_ms: AtomicU64,
    timeout_ms: u64,
    clock: Arc<dyn Clock>,
}

impl WiegandDecoder {
    pub fn new(clock: Arc<dyn Clock>, timeout_ms: u64) -> Self {
        Self {
            state: AtomicU64::new(0),
            first_bit_ms: AtomicU64::new(0),
            last_bit_ms: AtomicU64::new(0),
            timeout_ms,
            clock,
        }
    }

    /// Edge on DATA0: append a 0 bit
    #[inline]
    pub fn on_data0(&self) {
        self.push_bit_at(false, self.clock.now_ms());
    }

    /// Edge on DATA1: append a 1 bit
    #[inline]
    pub fn on_data1(&self) {
        self.push_bit_at(true, self.clock.now_ms());
    }

    /// Append one bit received at `now_ms`.
    ///
    /// The timestamp is published before the bit so the consumer can never
    /// observe the new bit together with the previous, stale timestamp.
    pub fn push_bit_at(&self, bit: bool, now_ms: u64) {
        self.last_bit_ms.store(now_ms, Ordering::SeqCst);
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if count_of(cur) == 0 {
                self.first_bit_ms.store(now_ms, Ordering::SeqCst);
            }
            let value = (value_of(cur) << 1) | bit as u32;
            let count = count_of(cur).saturating_add(1);
            let next = pack(value, count, gen_of(cur).wrapping_add(1));
            match self
                .state
                .compare_exchange_weak(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Take the pending frame if the line has been silent long enough
    pub fn poll(&self) -> Option<RawFrame> {
        self.poll_at(self.clock.now_ms())
    }

    pub fn poll_at(&self, now_ms: u64) -> Option<RawFrame> {
        let snapshot = self.state.load(Ordering::SeqCst);
        let bit_count = count_of(snapshot);
        if bit_count == 0 {
            return None;
        }
        let last_bit_ms = self.last_bit_ms.load(Ordering::SeqCst);
        if elapsed_ms(now_ms, last_bit_ms) <= self.timeout_ms {
            return None;
        }
        let first_bit_ms = self.first_bit_ms.load(Ordering::SeqCst);

        let reset = pack(0, 0, gen_of(snapshot).wrapping_add(1));
        self.state
            .compare_exchange(snapshot, reset, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RawFrame {
                bit_count,
                value: value_of(snapshot),
                first_bit_ms,
                last_bit_ms,
            })
    }

    /// Bits accumulated so far (diagnostics)
    pub fn pending_bits(&self) -> u8 {
        count_of(self.state.load(Ordering::SeqCst))
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::NaiveDate;

    fn decoder() -> (Arc<ManualClock>, WiegandDecoder) {
        let clock = Arc::new(ManualClock::new(
            1_000,
            NaiveDate::from_ymd_opt(2025, 8, 15).unwrap().and_hms_opt(9, 0, 0).unwrap(),
        ));
        let decoder = WiegandDecoder::new(clock.clone(), 50);
        (clock, decoder)
    }

    fn feed(decoder: &WiegandDecoder, value: u32, bits: u8, start_ms: u64) {
        for i in (0..bits).rev() {
            let bit = (value >> i) & 1 == 1;
            decoder.push_bit_at(bit, start_ms + (bits - 1 - i) as u64 * 2);
        }
    }

    #[test]
    fn test_frame_not_complete_before_timeout() {
        let (_, d) = decoder();
        feed(&d, 0b1011, 4, 1_000);
        let last = 1_000 + 3 * 2;
        assert_eq!(d.poll_at(last + 50), None);
        assert_eq!(d.pending_bits(), 4);
    }

    #[test]
    fn test_frame_captured_and_reset() {
        let (_, d) = decoder();
        feed(&d, 0x2A5_5AA5 & 0x3FF_FFFF, 26, 1_000);
        let frame = d.poll_at(1_000 + 25 * 2 + 51).unwrap();

        assert_eq!(frame.bit_count, 26);
        assert_eq!(frame.value, 0x2A5_5AA5 & 0x3FF_FFFF);
        assert_eq!(frame.first_bit_ms, 1_000);
        assert_eq!(frame.last_bit_ms, 1_050);
        assert_eq!(d.pending_bits(), 0);
        assert_eq!(d.poll_at(10_000), None);
    }

    #[test]
    fn test_edge_handlers_use_clock() {
        let (clock, d) = decoder();
        d.on_data1();
        d.on_data0();
        d.on_data1();
        assert!(d.poll().is_none());
        clock.advance_ms(51);
        let frame = d.poll().unwrap();
        assert_eq!((frame.bit_count, frame.value), (3, 0b101));
    }

    #[test]
    fn test_bit_during_snapshot_defers_frame() {
        let (_, d) = decoder();
        feed(&d, 0b11, 2, 1_000);
        // A new bit arrives: its timestamp restarts the silence window
        d.push_bit_at(false, 1_100);
        assert_eq!(d.poll_at(1_120), None);
        let frame = d.poll_at(1_151).unwrap();
        assert_eq!((frame.bit_count, frame.value), (3, 0b110));
    }

    #[test]
    fn test_count_saturates() {
        let (_, d) = decoder();
        for i in 0..300u64 {
            d.push_bit_at(i % 2 == 0, 1_000);
        }
        assert_eq!(d.pending_bits(), 255);
    }

    #[test]
    fn test_concurrent_producers_lose_no_bits() {
        let (_, d) = decoder();
        let d = Arc::new(d);
        let handles: Vec<_> = (0..2)
            .map(|line| {
                let d = d.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        d.push_bit_at(line == 1, 1_000);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let frame = d.poll_at(2_000).unwrap();
        assert_eq!(frame.bit_count, 200);
    }
}
