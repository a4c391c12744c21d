//! Outbound routing across unreliable relays.
//!
//! Relays are tried best-score-first; a relay whose circuit is open is
//! skipped. The first relay to accept the event wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::crypto::build_dm;
use crate::health::HealthTracker;
use crate::metrics::{self, BusMetrics};
use crate::transport::RelayTransport;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub event_id: String,
    pub relay: String,
}

pub struct RelayRouter {
    transport: Arc<dyn RelayTransport>,
    relays: Vec<String>,
    health: Mutex<HealthTracker>,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
    attempt_timeout: Duration,
    metrics: BusMetrics,
}

impl RelayRouter {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        breaker_config: CircuitBreakerConfig,
        attempt_timeout: Duration,
        metrics: BusMetrics,
    ) -> Self {
        let relays = transport.relays();
        Self {
            transport,
            relays,
            health: Mutex::new(HealthTracker::new()),
            breakers: Mutex::new(HashMap::new()),
            breaker_config,
            attempt_timeout,
            metrics,
        }
    }

    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    /// Relays in the order the next send would try them.
    pub fn attempt_order(&self) -> Result<Vec<String>, Error> {
        let health = self.health.lock().map_err(|_| Error::MutexPoisoned)?;
        Ok(health.sorted_relays(&self.relays))
    }

    pub fn health_score(&self, relay: &str) -> Result<f64, Error> {
        let health = self.health.lock().map_err(|_| Error::MutexPoisoned)?;
        Ok(health.score(relay))
    }

    pub fn circuit_state(&self, relay: &str) -> Result<CircuitState, Error> {
        let breakers = self.breakers.lock().map_err(|_| Error::MutexPoisoned)?;
        Ok(breakers
            .get(relay)
            .map(CircuitBreaker::state)
            .unwrap_or(CircuitState::Closed))
    }

    pub fn can_attempt(&self, relay: &str) -> Result<bool, Error> {
        self.with_breaker(relay, |breaker| breaker.can_attempt())
    }

    pub fn record_success(&self, relay: &str, latency: Duration) -> Result<(), Error> {
        self.health
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .record_success(relay, latency);
        self.with_breaker(relay, CircuitBreaker::record_success)?;
        self.metrics.incr_relay(metrics::RELAY_PUBLISH_SUCCESS, relay);
        Ok(())
    }

    pub fn record_failure(&self, relay: &str) -> Result<(), Error> {
        self.health
            .lock()
            .map_err(|_| Error::MutexPoisoned)?
            .record_failure(relay);
        self.with_breaker(relay, CircuitBreaker::record_failure)?;
        self.metrics.incr_relay(metrics::RELAY_PUBLISH_FAILURE, relay);
        Ok(())
    }

    /// Encrypt, sign and route a DM.
    pub async fn send_dm(
        &self,
        keys: &Keys,
        to: &PublicKey,
        plaintext: &str,
    ) -> Result<SendReceipt, Error> {
        let event = build_dm(keys, to, plaintext)?;
        self.publish_first(&event).await
    }

    /// Publish to the first relay that accepts the event.
    pub async fn publish_first(&self, event: &Event) -> Result<SendReceipt, Error> {
        let mut last_error: Option<Error> = None;

        for relay in self.attempt_order()? {
            if !self.can_attempt(&relay)? {
                debug!(relay = %relay, "Circuit open, skipping relay");
                continue;
            }

            let pending = PendingAttempt::new(self, &relay);
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.attempt_timeout,
                self.transport.publish(&relay, event),
            )
            .await
            .unwrap_or(Err(Error::Timeout));
            pending.settle();

            match result {
                Ok(()) => {
                    self.record_success(&relay, started.elapsed())?;
                    info!(event_id = %event.id, relay = %relay, "Published event");
                    return Ok(SendReceipt {
                        event_id: event.id.to_hex(),
                        relay,
                    });
                }
                Err(err) => {
                    warn!(event_id = %event.id, relay = %relay, error = %err, "Relay publish failed");
                    self.record_failure(&relay)?;
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(err) => Error::AllRelaysFailed(Box::new(err)),
            None => Error::NoRelayAvailable,
        })
    }

    fn with_breaker<T>(
        &self,
        relay: &str,
        apply: impl FnOnce(&mut CircuitBreaker) -> T,
    ) -> Result<T, Error> {
        let mut breakers = self.breakers.lock().map_err(|_| Error::MutexPoisoned)?;
        let breaker = breakers
            .entry(relay.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.breaker_config));
        let before = breaker.state();
        let out = apply(breaker);
        let after = breaker.state();
        drop(breakers);

        if before != after {
            let name = match after {
                CircuitState::Open => metrics::CIRCUIT_OPEN,
                CircuitState::HalfOpen => metrics::CIRCUIT_HALF_OPEN,
                CircuitState::Closed => metrics::CIRCUIT_CLOSE,
            };
            info!(relay = %relay, state = ?after, "Circuit breaker transition");
            self.metrics.incr_relay(name, relay);
        }
        Ok(out)
    }
}

/// Counts an attempt as failed if the send future is dropped before the
/// outcome is recorded, so a half-open circuit is never left waiting.
struct PendingAttempt<'a> {
    router: &'a RelayRouter,
    relay: &'a str,
    settled: bool,
}

impl<'a> PendingAttempt<'a> {
    fn new(router: &'a RelayRouter, relay: &'a str) -> Self {
        Self {
            router,
            relay,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingAttempt<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        debug!(relay = %self.relay, "Publish attempt cancelled");
        if let Err(err) = self.router.record_failure(self.relay) {
            warn!(relay = %self.relay, error = %err, "Failed to record cancelled attempt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RelayNotice;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Relays listed in `down` reject every publish; everything else accepts.
    struct ScriptedTransport {
        relays: Vec<String>,
        down: Vec<String>,
        attempts: Mutex<Vec<String>>,
        stalled: AtomicBool,
    }

    impl ScriptedTransport {
        fn new(relays: &[&str], down: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                relays: relays.iter().map(|r| r.to_string()).collect(),
                down: down.iter().map(|r| r.to_string()).collect(),
                attempts: Mutex::new(Vec::new()),
                stalled: AtomicBool::new(false),
            })
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        fn relays(&self) -> Vec<String> {
            self.relays.clone()
        }

        async fn subscribe(
            &self,
            _filter: Filter,
        ) -> Result<mpsc::UnboundedReceiver<RelayNotice>, Error> {
            Ok(mpsc::unbounded_channel().1)
        }

        async fn publish(&self, relay: &str, _event: &Event) -> Result<(), Error> {
            self.attempts.lock().unwrap().push(relay.to_string());
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.down.iter().any(|r| r == relay) {
                Err(Error::RelayRejected {
                    relay: relay.to_string(),
                    reason: "blocked".to_string(),
                })
            } else {
                Ok(())
            }
        }

        async fn fetch(
            &self,
            _relay: &str,
            _filter: Filter,
            _timeout: Duration,
        ) -> Result<Vec<Event>, Error> {
            Ok(Vec::new())
        }

        async fn close(&self) {}
    }

    fn event() -> Event {
        let alice = Keys::generate();
        let bob = Keys::generate();
        build_dm(&alice, &bob.public_key(), "ping").unwrap()
    }

    fn router(transport: Arc<ScriptedTransport>) -> RelayRouter {
        RelayRouter::new(
            transport,
            CircuitBreakerConfig::default(),
            Duration::from_secs(5),
            BusMetrics::default(),
        )
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let transport = ScriptedTransport::new(&["wss://a", "wss://b", "wss://c"], &[]);
        let router = router(transport.clone());

        let receipt = router.publish_first(&event()).await.unwrap();
        assert_eq!(receipt.relay, "wss://a");
        assert_eq!(transport.attempts(), vec!["wss://a"]);
    }

    #[tokio::test]
    async fn test_falls_back_and_reorders_by_health() {
        let transport = ScriptedTransport::new(&["wss://a", "wss://b"], &["wss://a"]);
        let router = router(transport.clone());

        let receipt = router.publish_first(&event()).await.unwrap();
        assert_eq!(receipt.relay, "wss://b");
        assert_eq!(router.attempt_order().unwrap(), vec!["wss://b", "wss://a"]);

        router.publish_first(&event()).await.unwrap();
        assert_eq!(transport.attempts(), vec!["wss://a", "wss://b", "wss://b"]);
    }

    #[tokio::test]
    async fn test_all_failed_reports_last_error() {
        let transport = ScriptedTransport::new(&["wss://a", "wss://b"], &["wss://a", "wss://b"]);
        let router = router(transport);

        match router.publish_first(&event()).await {
            Err(Error::AllRelaysFailed(last)) => match *last {
                Error::RelayRejected { relay, .. } => assert_eq!(relay, "wss://b"),
                other => panic!("unexpected inner error: {other}"),
            },
            other => panic!("expected AllRelaysFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_is_skipped() {
        let transport = ScriptedTransport::new(&["wss://a"], &["wss://a"]);
        let bus_metrics = BusMetrics::default();
        let router = RelayRouter::new(
            transport.clone(),
            CircuitBreakerConfig::default(),
            Duration::from_secs(5),
            bus_metrics.clone(),
        );

        for _ in 0..5 {
            assert!(router.publish_first(&event()).await.is_err());
        }
        assert_eq!(router.circuit_state("wss://a").unwrap(), CircuitState::Open);
        assert_eq!(bus_metrics.snapshot().counter(metrics::CIRCUIT_OPEN), 1);

        assert!(matches!(
            router.publish_first(&event()).await,
            Err(Error::NoRelayAvailable)
        ));
        assert_eq!(transport.attempts().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_attempt_does_not_wedge_circuit() {
        let transport = ScriptedTransport::new(&["wss://a"], &["wss://a"]);
        let router = RelayRouter::new(
            transport.clone(),
            CircuitBreakerConfig {
                threshold: 1,
                reset_after: Duration::from_secs(30),
            },
            Duration::from_secs(5),
            BusMetrics::default(),
        );

        assert!(router.publish_first(&event()).await.is_err());
        assert_eq!(router.circuit_state("wss://a").unwrap(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        transport.stalled.store(true, Ordering::SeqCst);
        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), router.publish_first(&event())).await;
        assert!(cancelled.is_err());
        assert_eq!(transport.attempts().len(), 2);

        // The dropped attempt counts as a failure and the circuit reopens.
        assert_eq!(router.circuit_state("wss://a").unwrap(), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(router.can_attempt("wss://a").unwrap());
        assert_eq!(router.circuit_state("wss://a").unwrap(), CircuitState::HalfOpen);
    }
}
