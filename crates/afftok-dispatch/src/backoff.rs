//! Jittered retry delays.

use std::time::Duration;

use rand::Rng;

use afftok_types::RetryPolicy;

/// The delay before the given 1-based attempt:
/// `min(cap, base · 2^(attempt−1)) · (1 + uniform(−jitter, +jitter))`
/// (or a constant base for fixed-interval pipelines).
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    base.mul_f64(factor.max(0.0))
}
