//! Time sources
//!
//! Decision logic never reads the system clock directly: windows are measured
//! on a monotonic millisecond counter and period tags come from local wall time,
//! both behind [`Clock`] so tests can drive them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{Local, NaiveDateTime};
use parking_lot::Mutex;

use crate::constants::{PERIOD_FORMAT, TIMESTAMP_FORMAT};

pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary origin
    fn now_ms(&self) -> u64;

    /// Local wall-clock time
    fn local_now(&self) -> NaiveDateTime;
}

/// Real clock: `Instant` for windows, `chrono::Local` for wall time
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn local_now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Hand-driven clock for tests and replays
pub struct ManualClock {
    now_ms: AtomicU64,
    local: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start_ms: u64, local: NaiveDateTime) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            local: Mutex::new(local),
        }
    }

    /// Move both time bases forward
    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
        let mut local = self.local.lock();
        *local += chrono::Duration::milliseconds(ms as i64);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn local_now(&self) -> NaiveDateTime {
        *self.local.lock()
    }
}

/// `YYYYMM` tag of the rotation period containing `at`
pub fn period_tag(at: &NaiveDateTime) -> String {
    at.format(PERIOD_FORMAT).to_string()
}

/// Timestamp as written in audit log lines and manifests
pub fn format_timestamp(at: &NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Milliseconds elapsed from `earlier` to `now`, zero if the clock went back
#[inline]
pub fn elapsed_ms(now: u64, earlier: u64) -> u64 {
    now.saturating_sub(earlier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, ss)
            .unwrap()
    }

    #[test]
    fn test_period_tag_and_timestamp() {
        let t = at(2025, 8, 15, 17, 30, 5);
        assert_eq!(period_tag(&t), "202508");
        assert_eq!(format_timestamp(&t), "15-08-2025T17:30:05");
    }

    #[test]
    fn test_manual_clock_rolls_period() {
        let clock = ManualClock::new(0, at(2025, 8, 31, 23, 59, 59));
        assert_eq!(period_tag(&clock.local_now()), "202508");
        clock.advance_ms(1500);
        assert_eq!(clock.now_ms(), 1500);
        assert_eq!(period_tag(&clock.local_now()), "202509");
    }

    #[test]
    fn test_elapsed_saturates() {
        assert_eq!(elapsed_ms(10, 20), 0);
        assert_eq!(elapsed_ms(20, 10), 10);
    }
}
