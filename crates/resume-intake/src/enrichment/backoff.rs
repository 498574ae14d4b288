use std::time::Duration;

/// Delay before the next attempt after `attempts` failed ones:
/// `base * 2^(attempts - 1)`, capped at `max`.
pub fn retry_delay(attempts: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}
