//! Kind-0 profile publishing.
//!
//! Every publish fans out to all configured relays in parallel and reports a
//! per-relay outcome. Publishes for one account never overlap: callers queue
//! on a per-account lock and run in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::prelude::*;
use tracing::{info, warn};

use super::types::ProfileContent;
use crate::events::unix_timestamp;
use crate::metrics::{self, BusMetrics};
use crate::state::{ProfileState, PublishStatus, StateStore, PROFILE_STATE_VERSION};
use crate::transport::RelayTransport;
use crate::Error;

type AccountLock = Arc<tokio::sync::Mutex<()>>;

fn lock_registry() -> &'static Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The publish lock shared by every publisher of `account_id` in this process.
/// An entry is dropped from the registry once nobody holds or awaits it.
fn account_lock(account_id: &str) -> Result<AccountLock, Error> {
    let mut locks = lock_registry().lock().map_err(|_| Error::MutexPoisoned)?;
    locks.retain(|_, lock| lock.strong_count() > 0);
    if let Some(lock) = locks.get(account_id).and_then(Weak::upgrade) {
        return Ok(lock);
    }
    let lock = Arc::new(tokio::sync::Mutex::new(()));
    locks.insert(account_id.to_string(), Arc::downgrade(&lock));
    Ok(lock)
}

#[derive(Debug, Clone)]
pub struct ProfilePublishResult {
    pub event_id: String,
    pub created_at: u64,
    pub successes: Vec<String>,
    /// Relay URL to error message, timeouts included.
    pub failures: HashMap<String, String>,
    pub results: HashMap<String, PublishStatus>,
}

impl ProfilePublishResult {
    pub fn any_success(&self) -> bool {
        !self.successes.is_empty()
    }
}

pub struct ProfilePublisher {
    account_id: String,
    keys: Keys,
    transport: Arc<dyn RelayTransport>,
    store: StateStore,
    timeout: Duration,
    metrics: BusMetrics,
    /// Survives a failed state write so timestamps stay monotonic.
    last_published_at: Mutex<Option<u64>>,
}

impl ProfilePublisher {
    pub fn new(
        account_id: impl Into<String>,
        keys: Keys,
        transport: Arc<dyn RelayTransport>,
        store: StateStore,
        timeout: Duration,
        metrics: BusMetrics,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            keys,
            transport,
            store,
            timeout,
            metrics,
            last_published_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> Option<ProfileState> {
        self.store.read_profile_state()
    }

    pub async fn publish(&self, profile: &ProfileContent) -> Result<ProfilePublishResult, Error> {
        profile.validate_urls()?;
        let content = profile.to_json()?;

        let lock = account_lock(&self.account_id)?;
        let _guard = lock.lock().await;

        let previous = self.store.read_profile_state();
        let last = {
            let cached = self.last_published_at.lock().map_err(|_| Error::MutexPoisoned)?;
            previous
                .as_ref()
                .and_then(|state| state.last_published_at)
                .max(*cached)
        };
        let created_at = next_created_at(unix_timestamp(), last);

        let event = EventBuilder::new(Kind::Metadata, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(&self.keys)
            .map_err(|err| Error::Signing(err.to_string()))?;

        let result = self.fan_out(&event, created_at).await;

        *self.last_published_at.lock().map_err(|_| Error::MutexPoisoned)? = Some(created_at);
        let state = ProfileState {
            version: PROFILE_STATE_VERSION,
            last_published_at: Some(created_at),
            last_published_event_id: Some(result.event_id.clone()),
            last_publish_results: result.results.clone(),
        };
        if let Err(err) = self.store.write_profile_state(&state) {
            warn!(account = %self.account_id, error = %err, "Failed to write profile state");
            self.metrics.incr(metrics::STATE_WRITE_FAILURE);
        }

        info!(
            account = %self.account_id,
            event_id = %result.event_id,
            created_at,
            ok = result.successes.len(),
            failed = result.failures.len(),
            "Published profile"
        );
        Ok(result)
    }

    async fn fan_out(&self, event: &Event, created_at: u64) -> ProfilePublishResult {
        let relays = self.transport.relays();
        let attempts = relays.iter().map(|relay| async move {
            let outcome =
                tokio::time::timeout(self.timeout, self.transport.publish(relay, event)).await;
            (relay.clone(), outcome.unwrap_or(Err(Error::Timeout)))
        });

        let mut result = ProfilePublishResult {
            event_id: event.id.to_hex(),
            created_at,
            successes: Vec::new(),
            failures: HashMap::new(),
            results: HashMap::new(),
        };
        for (relay, outcome) in join_all(attempts).await {
            let status = match outcome {
                Ok(()) => {
                    self.metrics.incr_relay(metrics::RELAY_PUBLISH_SUCCESS, &relay);
                    result.successes.push(relay.clone());
                    PublishStatus::Ok
                }
                Err(err) => {
                    warn!(relay = %relay, error = %err, "Profile publish failed");
                    self.metrics.incr_relay(metrics::RELAY_PUBLISH_FAILURE, &relay);
                    let status = if err.is_timeout() {
                        PublishStatus::Timeout
                    } else {
                        PublishStatus::Failed
                    };
                    result.failures.insert(relay.clone(), err.to_string());
                    status
                }
            };
            result.results.insert(relay, status);
        }
        result
    }
}

/// Replaceable events keep only the newest `created_at`, so a new publish
/// must land strictly after the previous one.
pub fn next_created_at(now: u64, last_published_at: Option<u64>) -> u64 {
    match last_published_at {
        Some(last) => now.max(last + 1),
        None => now,
    }
}
