//! Reconnect schedule: exponential backoff with jitter, capped.
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay, jitter included
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.3 = ±30%)
    pub jitter: f64,
    /// Attempts before the connection is reported unavailable
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    current_ms: f64,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_ms = policy.initial_backoff_ms as f64;
        Self {
            policy,
            attempt: 0,
            current_ms,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt, or `None` once attempts are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        let max = self.policy.max_backoff_ms as f64;
        let base = self.current_ms.min(max);
        self.current_ms = (self.current_ms * self.policy.multiplier.max(1.0)).min(max);
        Some(Duration::from_millis(apply_jitter(base, self.policy.jitter).min(max) as u64))
    }
}

fn apply_jitter(base_ms: f64, jitter: f64) -> f64 {
    let spread = jitter.clamp(0.0, 1.0);
    if spread == 0.0 {
        return base_ms;
    }
    let mut rng = rand::thread_rng();
    base_ms * (1.0 + rng.gen_range(-spread..spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn grows_exponentially_up_to_cap() {
        let mut backoff = Backoff::new(no_jitter(6));
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn stops_after_max_attempts() {
        let mut backoff = Backoff::new(no_jitter(2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 2);
    }

    #[test]
    fn jitter_stays_within_spread_and_cap() {
        let policy = ReconnectPolicy {
            jitter: 0.3,
            max_attempts: 50,
            ..no_jitter(50)
        };
        let mut backoff = Backoff::new(policy);
        let first = backoff.next_delay().unwrap().as_millis() as u64;
        assert!((70..=130).contains(&first), "first delay {first}");
        while let Some(delay) = backoff.next_delay() {
            assert!(delay <= Duration::from_millis(1_000));
        }
    }
}
