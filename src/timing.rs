//! Monotonic time source for protocol timeouts.

use std::sync::OnceLock;
use std::time::Instant;

/// Get the current monotonic timestamp in microseconds.
///
/// The epoch is the first call within this process; only differences between
/// two readings are meaningful.
#[inline]
pub fn monotonic_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
