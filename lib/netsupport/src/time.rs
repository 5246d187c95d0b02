use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime};

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since an arbitrary process-wide epoch. Used by the global timer
/// and the ping tracker so elapsed-time comparisons are immune to wall clock adjustments.
#[inline]
pub fn clock_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}
