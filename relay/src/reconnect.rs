use camera_relay_common::config::ReconnectConfig;
use std::time::Duration;

/// How the capture loop waits between upstream reconnect attempts.
///
/// Delay for attempt `n` (0-based) is `initial * multiplier^n`, capped at
/// `max`. With `max_attempts == None` the policy never gives up.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            max_attempts,
        }
    }

    /// Fixed delay, unlimited attempts.
    #[cfg(test)]
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0, None)
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.multiplier,
            config.max_attempts,
        )
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

/// Per-outage state of a [`ReconnectPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Delay before the next attempt, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let factor = self.policy.multiplier.powi(self.attempt.min(64) as i32);
        let delay = self
            .policy
            .initial
            .mul_f64(factor.min(u32::MAX as f64))
            .min(self.policy.max);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }

    /// Attempts made since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Call after the upstream delivered a frame.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_retry_forever_at_two_seconds() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig::default());
        let mut backoff = policy.backoff();
        for _ in 0..1000 {
            assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        }
        assert_eq!(backoff.attempts(), 1000);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy::new(
            Duration::from_secs(2),
            Duration::from_secs(30),
            2.0,
            None,
        );
        let mut backoff = policy.backoff();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn max_attempts_exhausts() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            1.0,
            Some(3),
        );
        let mut backoff = policy.backoff();
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn reset_restarts_from_initial_delay() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            3.0,
            None,
        );
        let mut backoff = policy.backoff();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(900)));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            10.0,
            None,
        );
        let mut backoff = policy.backoff();
        for _ in 0..200 {
            assert!(backoff.next_delay().unwrap() <= Duration::from_secs(60));
        }
    }
}
