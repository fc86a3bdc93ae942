//! Frame position estimation from the engine's elapsed-time counter.

use crate::types::MILLIS_PER_SECOND;

/// Estimate frames processed after `elapsed_millis` at `sample_rate`.
///
/// Assumes the engine has run continuously at `sample_rate` since the
/// stream started, so the result is an estimate rather than a hardware
/// read pointer.
pub fn frames_from_millis(elapsed_millis: i64, sample_rate: i32) -> i64 {
    elapsed_millis.saturating_mul(i64::from(sample_rate)) / MILLIS_PER_SECOND
}

/// Extends a wrapping 32-bit counter into a monotonic 64-bit one.
///
/// Engines report elapsed milliseconds as a `u32` that wraps after about
/// 49 days. Each update adds the wrapping delta from the previous sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MonotonicCounter {
    counter64: i64,
    counter32: u32,
}

impl MonotonicCounter {
    pub const fn new() -> Self {
        Self {
            counter64: 0,
            counter32: 0,
        }
    }

    pub fn get(&self) -> i64 {
        self.counter64
    }

    /// Fold a new 32-bit sample into the counter and return the 64-bit value.
    pub fn update32(&mut self, counter32: u32) -> i64 {
        let delta = counter32.wrapping_sub(self.counter32) as i32;
        // Backwards steps are ignored so the counter never decreases.
        if delta > 0 {
            self.counter64 += i64::from(delta);
            self.counter32 = counter32;
        }
        self.counter64
    }
}
