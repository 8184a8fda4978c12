//! Monotonic nanosecond clock shared by dispatcher, workers and jobs

use std::sync::OnceLock;
use std::time::Instant;

static START_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process
///
/// Cheap after the first call (one atomic load plus `Instant::now`), so it
/// is fine inside spin loops.
#[inline]
pub fn now_ns() -> u64 {
    let start = START_INSTANT.get_or_init(Instant::now);
    start.elapsed().as_nanos() as u64
}
