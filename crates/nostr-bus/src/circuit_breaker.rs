//! Per-relay circuit breaker.
//!
//! `closed` allows every attempt. After `threshold` consecutive failures the
//! breaker opens and denies attempts for `reset_after`. Once that elapses a
//! single probe is let through in `half_open`: success closes the breaker,
//! failure reopens it. A trial that is never recorded expires after another
//! `reset_after`, so an abandoned attempt cannot hold the relay shut.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub threshold: u32,
    /// How long an open circuit denies attempts before probing.
    pub reset_after: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            reset_after: DEFAULT_RESET_AFTER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: u32,
    probe_in_flight: bool,
    probe_started_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: 0,
            probe_in_flight: false,
            probe_started_at: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_success_at(&self) -> Option<Instant> {
        self.last_success_at
    }

    /// Gate for a relay attempt. May move `open` to `half_open`, in which case
    /// exactly one caller gets `true` until the probe is recorded.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.reset_after)
                    .unwrap_or(true);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.start_probe();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let stale = self
                    .probe_started_at
                    .map(|at| at.elapsed() >= self.config.reset_after)
                    .unwrap_or(true);
                if self.probe_in_flight && !stale {
                    false
                } else {
                    self.start_probe();
                    true
                }
            }
        }
    }

    fn start_probe(&mut self) {
        self.probe_in_flight = true;
        self.probe_started_at = Some(Instant::now());
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.probe_in_flight = false;
        self.probe_started_at = None;
        self.last_success_at = Some(Instant::now());
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure_at = Some(Instant::now());
        self.probe_in_flight = false;
        self.probe_started_at = None;
        match self.state {
            CircuitState::HalfOpen => self.state = CircuitState::Open,
            CircuitState::Closed if self.failures >= self.config.threshold => {
                self.state = CircuitState::Open
            }
            _ => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tripped() -> CircuitBreaker {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..5 {
            assert!(breaker.can_attempt());
            breaker.record_failure();
        }
        breaker
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_probe_after_reset() {
        let mut breaker = tripped();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_attempt());
        assert!(!breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let mut breaker = tripped();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_closes_and_resets() {
        let mut breaker = tripped();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
        assert!(breaker.can_attempt());
        assert!(breaker.can_attempt());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_trial_expires() {
        let mut breaker = tripped();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(breaker.can_attempt());

        // The trial outcome is never recorded.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_attempt());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_attempt());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn test_success_while_closed_resets_counter() {
        let mut breaker = CircuitBreaker::default();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);

        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
