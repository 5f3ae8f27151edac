use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// return millisecond since epoch
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Time left until `deadline`, zero once it has passed.
pub fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

pub fn is_expired(deadline: Instant) -> bool {
    Instant::now() >= deadline
}

pub(crate) fn as_millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Multiplies a duration by a float factor, saturating on overflow.
pub(crate) fn scale(
    duration: Duration,
    factor: f64,
) -> Duration {
    let ms = duration.as_millis() as f64 * factor;
    if !ms.is_finite() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis(ms.min(u64::MAX as f64) as u64)
}
