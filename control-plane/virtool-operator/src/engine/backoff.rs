use std::time::Duration;

use rand::Rng;

/// Exponential retry delay: `base * 2^attempt`, plus up to `jitter_pct`
/// percent random jitter, never above `max`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
            jitter_pct: 20,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        let exp = self.base.saturating_mul(factor).min(self.max);
        if self.jitter_pct == 0 || exp.is_zero() {
            return exp;
        }
        let spread = exp.as_millis() as u64 * u64::from(self.jitter_pct.min(100)) / 100;
        let jitter = rand::rng().random_range(0..=spread);
        (exp + Duration::from_millis(jitter)).min(self.max)
    }
}
