//! Observational counters and gauges. Nothing here gates control flow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

pub const EVENT_RECEIVED: &str = "event.received";
pub const EVENT_PROCESSED: &str = "event.processed";
pub const EVENT_DUPLICATE: &str = "event.duplicate";
pub const EVENT_REJECTED_SELF: &str = "event.rejected.self_message";
pub const EVENT_REJECTED_STALE: &str = "event.rejected.stale";
pub const EVENT_REJECTED_FUTURE: &str = "event.rejected.future";
pub const EVENT_REJECTED_WRONG_RECIPIENT: &str = "event.rejected.wrong_recipient";
pub const EVENT_REJECTED_WRONG_KIND: &str = "event.rejected.wrong_kind";
pub const EVENT_REJECTED_OVERSIZED: &str = "event.rejected.oversized_ciphertext";
pub const EVENT_REJECTED_SIGNATURE: &str = "event.rejected.invalid_signature";
pub const EVENT_REJECTED_DECRYPT: &str = "event.rejected.decrypt_failed";
pub const DECRYPT_SUCCESS: &str = "decrypt.success";
pub const DECRYPT_FAILURE: &str = "decrypt.failure";
pub const RELAY_EVENT: &str = "relay.message.event";
pub const RELAY_EOSE: &str = "relay.message.eose";
pub const RELAY_CLOSED: &str = "relay.message.closed";
pub const RELAY_PUBLISH_SUCCESS: &str = "relay.publish.success";
pub const RELAY_PUBLISH_FAILURE: &str = "relay.publish.failure";
pub const RELAY_RECONNECT: &str = "relay.reconnect";
pub const CIRCUIT_OPEN: &str = "relay.circuit_breaker.open";
pub const CIRCUIT_HALF_OPEN: &str = "relay.circuit_breaker.half_open";
pub const CIRCUIT_CLOSE: &str = "relay.circuit_breaker.close";
pub const SEEN_TRACKER_SIZE: &str = "seen_tracker.size";
pub const STATE_WRITE_FAILURE: &str = "state.write.failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub relay: Option<String>,
}

pub type MetricCallback = Arc<dyn Fn(&MetricEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }
}

/// Shared per-account collector; clones feed the same totals.
#[derive(Clone, Default)]
pub struct BusMetrics {
    totals: Arc<Mutex<MetricsSnapshot>>,
    sink: Option<MetricCallback>,
}

impl BusMetrics {
    pub fn new(sink: Option<MetricCallback>) -> Self {
        Self {
            totals: Arc::default(),
            sink,
        }
    }

    pub fn incr(&self, name: &'static str) {
        self.emit(name, MetricKind::Counter, 1.0, None);
    }

    pub fn incr_relay(&self, name: &'static str, relay: &str) {
        self.emit(name, MetricKind::Counter, 1.0, Some(relay));
    }

    pub fn gauge(&self, name: &'static str, value: f64) {
        self.emit(name, MetricKind::Gauge, value, None);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.totals
            .lock()
            .map(|totals| totals.clone())
            .unwrap_or_default()
    }

    fn emit(&self, name: &'static str, kind: MetricKind, value: f64, relay: Option<&str>) {
        if let Ok(mut totals) = self.totals.lock() {
            match kind {
                MetricKind::Counter => {
                    *totals.counters.entry(name.to_string()).or_insert(0) += value as u64;
                }
                MetricKind::Gauge => {
                    totals.gauges.insert(name.to_string(), value);
                }
            }
        }

        if let Some(sink) = &self.sink {
            sink(&MetricEvent {
                name,
                kind,
                value,
                relay: relay.map(str::to_string),
            });
        }
    }
}
