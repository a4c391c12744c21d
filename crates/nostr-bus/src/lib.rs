//! Resilient Nostr direct-message bus with profile publishing.
//!
//! One [`BusHandle`] per account keeps an encrypted DM subscription alive
//! across a set of unreliable relays, delivers each inbound message to the
//! caller at most once (also across restarts), and routes replies through
//! the healthiest relay that will take them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          NOSTR-BUS                                │
//! │                                                                   │
//! │  relays ──► RelayTransport ──► EventPipeline ──► MessageHandler   │
//! │                 ▲              (dedupe, verify,        │          │
//! │                 │               decrypt)               │ reply    │
//! │                 │                   │                  ▼          │
//! │                 │             CheckpointWriter     RelayRouter    │
//! │                 │             (debounced, 0600)    (health score, │
//! │                 │                   │               circuit gate) │
//! │                 │                   ▼                  │          │
//! │                 │            bus-state-<acct>.json     │          │
//! │                 └──────────────────────────────────────┘          │
//! │                                                                   │
//! │  ProfilePublisher (kind 0, fan-out)   ProfileImporter (newest)    │
//! │            │                                  │                   │
//! │            ▼                                  ▼                   │
//! │   profile-state-<acct>.json          URL safety + merge           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Inbound order
//!
//! | Step | Check | Metric on drop |
//! |------|-------|----------------|
//! | 1 | seen or in flight | `event.duplicate` |
//! | 2 | kind 4 only | `event.rejected.wrong_kind` |
//! | 3 | not from ourselves | `event.rejected.self_message` |
//! | 4 | inside `[since, now + skew]` | `event.rejected.stale` / `.future` |
//! | 5 | `p`-tagged for us, size cap | `event.rejected.wrong_recipient` / `.oversized_ciphertext` |
//! | 6 | signature | `event.rejected.invalid_signature` |
//! | 7 | decrypt | `event.rejected.decrypt_failed` |
//!
//! # Example
//!
//! ```rust,ignore
//! use nostr_bus::{BusCallbacks, BusConfig, DirectMessage, MessageHandler, NostrBus, ReplyHandle};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Echo {
//!     async fn on_message(&self, msg: DirectMessage, reply: ReplyHandle) -> Result<(), nostr_bus::Error> {
//!         reply.send(&msg.plaintext).await?;
//!         Ok(())
//!     }
//! }
//!
//! let config = BusConfig::from_env()?.expect("NOSTR_RELAYS not set");
//! let bus = NostrBus::start(config, Arc::new(Echo), BusCallbacks::default()).await?;
//! // ...
//! bus.close().await?;
//! ```

mod bus;
mod circuit_breaker;
mod config;
mod crypto;
mod error;
mod events;
mod health;
mod metrics;
mod pipeline;
pub mod profile;
mod router;
mod seen;
mod state;
mod transport;

pub use bus::{
    BusCallbacks, BusHandle, EoseCallback, ErrorCallback, MessageHandler, NostrBus, ReplyHandle,
};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{parse_relays, BusConfig, ReconnectConfig};
pub use crypto::{build_dm, decrypt_dm, parse_public_key, verify_event};
pub use error::Error;
pub use events::{dm_filter, parse_event_json, profile_filter, unix_timestamp, DirectMessage};
pub use health::{HealthTracker, RelayHealth, NEUTRAL_SCORE};
pub use metrics::{
    BusMetrics, MetricCallback, MetricEvent, MetricKind, MetricsSnapshot, CIRCUIT_CLOSE,
    CIRCUIT_HALF_OPEN, CIRCUIT_OPEN, DECRYPT_FAILURE, DECRYPT_SUCCESS, EVENT_DUPLICATE,
    EVENT_PROCESSED, EVENT_RECEIVED, EVENT_REJECTED_DECRYPT, EVENT_REJECTED_FUTURE,
    EVENT_REJECTED_OVERSIZED, EVENT_REJECTED_SELF, EVENT_REJECTED_SIGNATURE,
    EVENT_REJECTED_STALE, EVENT_REJECTED_WRONG_KIND, EVENT_REJECTED_WRONG_RECIPIENT,
    RELAY_CLOSED, RELAY_EOSE, RELAY_EVENT, RELAY_PUBLISH_FAILURE, RELAY_PUBLISH_SUCCESS,
    RELAY_RECONNECT, SEEN_TRACKER_SIZE, STATE_WRITE_FAILURE,
};
pub use pipeline::{Admission, DropReason, EventPipeline, PipelineLimits};
pub use profile::{
    merge_profiles, ImportedProfile, ProfileContent, ProfileImporter, ProfilePublishResult,
    ProfilePublisher,
};
pub use router::{RelayRouter, SendReceipt};
pub use seen::{SeenTracker, SeenTrackerConfig};
pub use state::{
    compute_since_timestamp, normalize_account_id, BusState, CheckpointWriter, ProfileState,
    PublishStatus, StateStore, WriteErrorCallback, BUS_STATE_VERSION, MAX_PERSISTED_EVENT_IDS,
    PROFILE_STATE_VERSION,
};
pub use transport::{RelayNotice, RelayTransport, SdkTransport};

/// Crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
