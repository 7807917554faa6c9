//! Retry and reconnect backoff.

use std::time::Duration;

use rand::Rng;

/// How a backoff delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Deterministic delays.
    None,
    /// Multiply by `U(0.5, 1.5)`. Used for REST retries.
    Half,
    /// Multiply by `U(1 - f, 1 + f)`. The gateway ladder uses `0.2`.
    Proportional(f64),
}

/// Exponential backoff: `base * factor^attempt`, capped, jittered.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: Jitter,
}

impl ExponentialBackoff {
    #[must_use]
    pub const fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            jitter: Jitter::None,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// The gateway reconnect ladder: 1s, x2, 60s cap, +/-20%.
    #[must_use]
    pub fn reconnect_ladder(base: Duration, cap: Duration) -> Self {
        Self::new(base, 2.0, cap).with_jitter(Jitter::Proportional(0.2))
    }

    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exact = self.base.as_secs_f64() * self.factor.powi(attempt.min(32) as i32);
        let capped = exact.min(self.cap.as_secs_f64());

        let jittered = match self.jitter {
            Jitter::None => capped,
            Jitter::Half => capped * rand::thread_rng().gen_range(0.5..1.5),
            Jitter::Proportional(f) => capped * rand::thread_rng().gen_range(1.0 - f..1.0 + f),
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_the_cap() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(60));
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
        assert_eq!(backoff.delay(6), Duration::from_secs(60));
        assert_eq!(backoff.delay(20), Duration::from_secs(60));
    }

    #[test]
    fn half_jitter_stays_in_band() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(2), 2.0, Duration::from_secs(60))
            .with_jitter(Jitter::Half);
        for _ in 0..50 {
            let d = backoff.delay(0).as_secs_f64();
            assert!((1.0..3.0).contains(&d), "delay {d} outside U(0.5,1.5) band");
        }
    }

    #[test]
    fn ladder_jitter_is_proportional() {
        let ladder =
            ExponentialBackoff::reconnect_ladder(Duration::from_secs(1), Duration::from_secs(60));
        for attempt in 0..4 {
            let nominal = 2.0_f64.powi(attempt as i32).min(60.0);
            let d = ladder.delay(attempt).as_secs_f64();
            assert!(d >= nominal * 0.8 - f64::EPSILON);
            assert!(d <= nominal * 1.2 + f64::EPSILON);
        }
    }
}
