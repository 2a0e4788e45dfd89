// =============================================================================
// Poll backoff: spacing out polls after transient gateway failures
// =============================================================================
//
// delay(n) = min(cap, base × 2^n) ± jitter, n = consecutive failures so far.
// A successful tick resets n to zero.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    cap: Duration,
    /// Fraction of the delay added or removed at random, in [0, 1].
    jitter: f64,
    failures: u32,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(120), 0.1)
    }
}

impl PollBackoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn on_failure(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(31));
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.failures = self.failures.saturating_add(1);

        let spread = delay.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    pub fn on_success(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> PollBackoff {
        PollBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0)
    }

    #[test]
    fn doubles_until_cap() {
        let mut b = exact();
        let delays: Vec<u64> = (0..7).map(|_| b.on_failure().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(b.failures(), 7);
    }

    #[test]
    fn success_resets() {
        let mut b = exact();
        b.on_failure();
        b.on_failure();
        b.on_success();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.on_failure(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_band() {
        let mut b = PollBackoff::new(Duration::from_secs(10), Duration::from_secs(10), 0.2);
        for _ in 0..50 {
            let d = b.on_failure().as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "{d}");
        }
    }

    #[test]
    fn many_failures_do_not_overflow() {
        let mut b = exact();
        for _ in 0..100 {
            assert!(b.on_failure() <= Duration::from_secs(30));
        }
    }
}
