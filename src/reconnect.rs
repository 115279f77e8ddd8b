//! Exponential backoff schedule for session reconnects.

use std::time::Duration;

/// Delay before reconnect attempt number `attempts` (1-based):
/// `base * 2^(attempts - 1)`, capped at `cap`. Attempt 0 is treated as 1.
pub fn next_delay(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempts.max(1) - 1;
    let base_ms = base.as_millis() as u64;
    let delay_ms = if exp >= 32 {
        u64::MAX
    } else {
        base_ms.saturating_mul(1u64 << exp)
    };
    Duration::from_millis(delay_ms).min(cap)
}
