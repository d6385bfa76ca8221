use rand::Rng;
use std::time::Duration;

use crate::config::BackoffPolicy;

/// Exponential backoff iterator over a [`BackoffPolicy`].
///
/// Delays are `base * 2^attempt`, capped at `max`; with jitter, up to half of
/// the delay again is added at random (the cap still applies).
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, ignoring the retry ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Like [`Backoff::next_delay`] but `None` once `max_retries` is spent.
    pub fn next_retry(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        Some(self.next_delay())
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        let base = self.policy.base.saturating_mul(factor).min(self.policy.max);
        if !self.policy.jitter || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        (base + Duration::from_millis(extra)).min(self.policy.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter,
            max_retries: 3,
        }
    }

    #[test]
    fn test_doubles_and_caps() {
        let mut backoff = Backoff::new(policy(false));
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut backoff = Backoff::new(policy(false));
        assert!(backoff.next_retry().is_some());
        assert!(backoff.next_retry().is_some());
        assert!(backoff.next_retry().is_some());
        assert!(backoff.next_retry().is_none());
        backoff.reset();
        assert_eq!(backoff.next_retry(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let mut backoff = Backoff::new(policy(true));
        for expected in [100u128, 200, 400] {
            let delay = backoff.next_delay().as_millis();
            assert!(delay >= expected && delay <= (expected * 3 / 2).min(1000));
        }
    }
}
