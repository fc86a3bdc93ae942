//! Sleeping in nanoseconds.

use std::time::Duration;

/// Sleep for `nanos`. Returns immediately for zero or negative values.
pub fn sleep_for_nanos(nanos: i64) {
    if nanos > 0 {
        std::thread::sleep(Duration::from_nanos(nanos as u64));
    }
}
