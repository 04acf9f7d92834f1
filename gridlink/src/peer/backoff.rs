//! Retry delays for failed peers.
//!
//! The delay after the n-th consecutive failure is
//! `initial * multiplier^(n-1)` plus up to `jitter * that` of random
//! spread, capped at `max`. A delay is never shorter than the one before
//! it, so jitter cannot make a struggling peer retry faster.

use std::time::Duration;

use rand::Rng;

use crate::node_config::ConnectorSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the base delay added as random spread, in `[0, 1]`.
    pub jitter: f64,
    /// Consecutive failures after which a peer goes dormant.
    pub max_attempts: u32,
    /// How long a dormant peer waits before the next attempt.
    pub dormant_sweep: Duration,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &ConnectorSettings) -> Self {
        Self {
            initial: settings.backoff_initial,
            max: settings.backoff_max,
            multiplier: settings.backoff_multiplier,
            jitter: settings.backoff_jitter,
            max_attempts: settings.max_attempts,
            dormant_sweep: settings.dormant_sweep,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures
    /// (1-based). `previous` is the delay used after the prior failure.
    pub fn next_delay<R: Rng + ?Sized>(
        &self,
        failures: u32,
        previous: Option<Duration>,
        rng: &mut R,
    ) -> Duration {
        let cap = self.max.as_secs_f64();
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = (self.initial.as_secs_f64() * self.multiplier.powi(exponent)).min(cap);

        let spread = if self.jitter > 0.0 && base > 0.0 {
            rng.gen_range(0.0..=self.jitter * base)
        } else {
            0.0
        };

        let delay = Duration::from_secs_f64((base + spread).min(cap));
        delay.max(previous.unwrap_or(Duration::ZERO)).min(self.max)
    }

    /// Whether `failures` consecutive failures should send the peer dormant.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter,
            max_attempts: 4,
            dormant_sweep: Duration::from_secs(60),
        }
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let p = policy(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (1..=4)
            .map(|n| p.next_delay(n, None, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800]);
    }

    #[test]
    fn never_exceeds_the_cap() {
        let p = policy(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for n in 1..200 {
            assert!(p.next_delay(n, None, &mut rng) <= p.max);
        }
    }

    #[test]
    fn sequence_is_monotonic_with_jitter() {
        let p = policy(1.0);
        for seed in 0..50 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut previous = None;
            for n in 1..30 {
                let delay = p.next_delay(n, previous, &mut rng);
                if let Some(prev) = previous {
                    assert!(delay >= prev, "seed {seed}: {delay:?} < {prev:?}");
                }
                previous = Some(delay);
            }
            assert_eq!(previous, Some(p.max));
        }
    }

    #[test]
    fn jitter_stays_within_its_fraction() {
        let p = policy(0.2);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let d = p.next_delay(1, None, &mut rng);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(121));
        }
    }

    #[test]
    fn exhaustion_at_max_attempts() {
        let p = policy(0.0);
        assert!(!p.is_exhausted(3));
        assert!(p.is_exhausted(4));
    }
}
