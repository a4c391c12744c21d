//! Rolling per-relay health used to order relay attempts.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Score for relays we have never tried.
pub const NEUTRAL_SCORE: f64 = 0.5;

const RECENCY_WINDOW: Duration = Duration::from_secs(60);
const MAX_RECENCY_BONUS: f64 = 0.2;
const MAX_LATENCY_PENALTY: f64 = 0.2;
const LATENCY_CAP_MS: f64 = 10_000.0;

#[derive(Debug, Clone, Default)]
pub struct RelayHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub latency_sum_ms: u64,
    pub latency_count: u64,
    pub last_success_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

impl RelayHealth {
    pub fn average_latency_ms(&self) -> Option<f64> {
        (self.latency_count > 0).then(|| self.latency_sum_ms as f64 / self.latency_count as f64)
    }

    fn score(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return NEUTRAL_SCORE;
        }
        let success_rate = self.success_count as f64 / total as f64;

        let recency_bonus = self
            .last_success_at
            .map(|at| {
                let elapsed = at.elapsed().as_secs_f64();
                let window = RECENCY_WINDOW.as_secs_f64();
                MAX_RECENCY_BONUS * (1.0 - elapsed / window).max(0.0)
            })
            .unwrap_or(0.0);

        let latency_penalty = self
            .average_latency_ms()
            .map(|avg| MAX_LATENCY_PENALTY * (avg / LATENCY_CAP_MS).min(1.0))
            .unwrap_or(0.0);

        (success_rate + recency_bonus - latency_penalty).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    relays: HashMap<String, RelayHealth>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, relay: &str, latency: Duration) {
        let entry = self.relays.entry(relay.to_string()).or_default();
        entry.success_count += 1;
        entry.latency_sum_ms += latency.as_millis() as u64;
        entry.latency_count += 1;
        entry.last_success_at = Some(Instant::now());
    }

    pub fn record_failure(&mut self, relay: &str) {
        let entry = self.relays.entry(relay.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure_at = Some(Instant::now());
    }

    pub fn health(&self, relay: &str) -> Option<&RelayHealth> {
        self.relays.get(relay)
    }

    pub fn score(&self, relay: &str) -> f64 {
        self.relays
            .get(relay)
            .map(RelayHealth::score)
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Relays ordered best-first. Equal scores keep their input order.
    pub fn sorted_relays(&self, relays: &[String]) -> Vec<String> {
        let mut scored: Vec<(f64, &String)> = relays
            .iter()
            .map(|relay| (self.score(relay), relay))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        scored.into_iter().map(|(_, relay)| relay.clone()).collect()
    }
}
