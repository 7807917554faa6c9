//! Per-host circuit breaker.
//!
//! CLOSED passes everything, OPEN fails fast, HALF_OPEN admits a bounded
//! probe set. Network faults, 5xx and connect timeouts are failures; any
//! well-formed 4xx other than 429 proves the host is alive and counts as a
//! success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CircuitConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: State,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probes_in_flight: u32 },
}

/// Breaker for a single host.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Admission check. `Err(retry_in)` means fail fast without sending.
    ///
    /// A successful check in HALF_OPEN reserves a probe slot; the caller must
    /// balance it with `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(()),
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    debug!("circuit half-open, admitting probe");
                    inner.state = State::HalfOpen {
                        probes_in_flight: 1,
                    };
                    inner.success_count = 0;
                    Ok(())
                } else {
                    Err(until - now)
                }
            }
            State::HalfOpen {
                ref mut probes_in_flight,
            } => {
                if *probes_in_flight < self.config.half_open_probes {
                    *probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(self.config.open_timeout)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => {
                inner.failure_count = 0;
            }
            State::HalfOpen {
                ref mut probes_in_flight,
            } => {
                *probes_in_flight = probes_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    debug!("circuit closed after successful probes");
                    inner.state = State::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        "circuit opened after consecutive failures"
                    );
                    inner.state = State::Open {
                        until: Instant::now() + self.config.open_timeout,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!("probe failed, circuit re-opened");
                inner.state = State::Open {
                    until: Instant::now() + self.config.open_timeout,
                };
                inner.success_count = 0;
            }
            State::Open { .. } => {}
        }
    }

    /// The admitted request never produced a verdict (cancelled, or failed
    /// before reaching the host). Releases a HALF_OPEN probe slot without
    /// counting either way.
    pub fn record_cancel(&self) {
        let mut inner = self.inner.lock();
        if let State::HalfOpen {
            ref mut probes_in_flight,
        } = inner.state
        {
            *probes_in_flight = probes_in_flight.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.inner.lock().state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }
}

/// Breakers keyed by host.
#[derive(Debug)]
pub struct CircuitRegistry {
    config: CircuitConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    #[must_use]
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn for_host(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(host.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_millis(20),
            half_open_probes: 1,
        }
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test]
    async fn half_open_then_closed_after_successes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;

        // First probe admitted, concurrent second rejected.
        assert!(breaker.try_acquire().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_err());
        breaker.record_success();

        for _ in 0..2 {
            assert!(breaker.try_acquire().is_ok());
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(breaker.try_acquire().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_the_streak() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn registry_hands_out_one_breaker_per_host() {
        let registry = CircuitRegistry::new(fast_config());
        let a = registry.for_host("discord.com");
        let b = registry.for_host("discord.com");
        let c = registry.for_host("cdn.discordapp.com");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
