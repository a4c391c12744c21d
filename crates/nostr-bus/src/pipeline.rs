//! Inbound event admission.
//!
//! Checks run cheapest-first and signature verification only happens once an
//! event is plausibly for us:
//!
//! 1. already seen or in flight
//! 2. authored by ourselves
//! 3. older than the resume point (or too far in the future)
//! 4. not `p`-tagged for us (plus a ciphertext size cap)
//! 5. signature; only a verified id is marked seen
//! 6. decrypt; a failure leaves the id seen
//!
//! Steps 7 (handler) and 8 (checkpoint) belong to the bus, which calls
//! [`EventPipeline::complete`] when it is done with an admitted event.

use std::collections::HashSet;
use std::time::Duration;

use nostr_sdk::prelude::*;

use crate::crypto::{decrypt_dm, verify_event};
use crate::events::{is_addressed_to, unix_timestamp, DirectMessage};
use crate::metrics::{self, BusMetrics};
use crate::seen::{SeenTracker, SeenTrackerConfig};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    WrongKind,
    SelfMessage,
    Stale,
    Future,
    WrongRecipient,
    Oversized,
    InvalidSignature,
    DecryptFailed,
}

impl DropReason {
    fn metric(self) -> &'static str {
        match self {
            DropReason::Duplicate => metrics::EVENT_DUPLICATE,
            DropReason::WrongKind => metrics::EVENT_REJECTED_WRONG_KIND,
            DropReason::SelfMessage => metrics::EVENT_REJECTED_SELF,
            DropReason::Stale => metrics::EVENT_REJECTED_STALE,
            DropReason::Future => metrics::EVENT_REJECTED_FUTURE,
            DropReason::WrongRecipient => metrics::EVENT_REJECTED_WRONG_RECIPIENT,
            DropReason::Oversized => metrics::EVENT_REJECTED_OVERSIZED,
            DropReason::InvalidSignature => metrics::EVENT_REJECTED_SIGNATURE,
            DropReason::DecryptFailed => metrics::EVENT_REJECTED_DECRYPT,
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Deliver(DirectMessage),
    /// Dropped. `error` is set for the cases the caller must report.
    Dropped {
        reason: DropReason,
        error: Option<Error>,
    },
}

impl Admission {
    fn dropped(reason: DropReason) -> Self {
        Admission::Dropped {
            reason,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineLimits {
    pub max_future_skew: Duration,
    pub max_ciphertext_bytes: usize,
}

pub struct EventPipeline {
    keys: Keys,
    self_pubkey: PublicKey,
    since: u64,
    limits: PipelineLimits,
    seen: SeenTracker,
    inflight: HashSet<EventId>,
    metrics: BusMetrics,
}

impl EventPipeline {
    pub fn new(
        keys: Keys,
        since: u64,
        seen: SeenTrackerConfig,
        limits: PipelineLimits,
        metrics: BusMetrics,
    ) -> Self {
        let self_pubkey = keys.public_key();
        Self {
            keys,
            self_pubkey,
            since,
            limits,
            seen: SeenTracker::new(seen),
            inflight: HashSet::new(),
            metrics,
        }
    }

    /// Load ids persisted by a previous run so they are not replayed.
    pub fn seed_seen<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.seen.seed(ids);
        self.metrics
            .gauge(metrics::SEEN_TRACKER_SIZE, self.seen.len() as f64);
    }

    pub fn since(&self) -> u64 {
        self.since
    }

    pub fn set_since(&mut self, since: u64) {
        self.since = since;
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.peek(id)
    }

    pub fn prune_seen(&mut self) -> usize {
        self.seen.prune()
    }

    pub fn admit(&mut self, event: &Event) -> Admission {
        self.metrics.incr(metrics::EVENT_RECEIVED);
        let admission = self.check(event);
        match &admission {
            Admission::Deliver(_) => self.metrics.incr(metrics::DECRYPT_SUCCESS),
            Admission::Dropped { reason, .. } => {
                self.metrics.incr(reason.metric());
                if *reason == DropReason::DecryptFailed {
                    self.metrics.incr(metrics::DECRYPT_FAILURE);
                }
            }
        }
        admission
    }

    /// Release an admitted event once the handler and checkpoint are done.
    pub fn complete(&mut self, id: &EventId) {
        if self.inflight.remove(id) {
            self.metrics.incr(metrics::EVENT_PROCESSED);
        }
    }

    fn check(&mut self, event: &Event) -> Admission {
        let id_hex = event.id.to_hex();

        if self.inflight.contains(&event.id) || self.seen.peek(&id_hex) {
            return Admission::dropped(DropReason::Duplicate);
        }
        if event.kind != Kind::EncryptedDirectMessage {
            return Admission::dropped(DropReason::WrongKind);
        }
        if event.pubkey == self.self_pubkey {
            return Admission::dropped(DropReason::SelfMessage);
        }

        let created_at = event.created_at.as_secs();
        if created_at < self.since {
            return Admission::dropped(DropReason::Stale);
        }
        if created_at > unix_timestamp() + self.limits.max_future_skew.as_secs() {
            return Admission::dropped(DropReason::Future);
        }

        if !is_addressed_to(event, &self.self_pubkey) {
            return Admission::dropped(DropReason::WrongRecipient);
        }
        if event.content.len() > self.limits.max_ciphertext_bytes {
            return Admission::dropped(DropReason::Oversized);
        }

        if let Err(err) = verify_event(event) {
            return Admission::Dropped {
                reason: DropReason::InvalidSignature,
                error: Some(err),
            };
        }
        self.seen.add(&id_hex);
        self.metrics
            .gauge(metrics::SEEN_TRACKER_SIZE, self.seen.len() as f64);

        let plaintext = match decrypt_dm(&self.keys, event) {
            Ok(plaintext) => plaintext,
            Err(err) => {
                return Admission::Dropped {
                    reason: DropReason::DecryptFailed,
                    error: Some(err),
                }
            }
        };

        self.inflight.insert(event.id);
        Admission::Deliver(DirectMessage {
            event_id: id_hex,
            sender: event.pubkey,
            plaintext,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::build_dm;
    use nostr_sdk::nostr::nips::nip04;

    struct Fixture {
        me: Keys,
        peer: Keys,
        pipeline: EventPipeline,
        metrics: BusMetrics,
    }

    fn fixture(since: u64) -> Fixture {
        let me = Keys::generate();
        let metrics = BusMetrics::default();
        let pipeline = EventPipeline::new(
            me.clone(),
            since,
            SeenTrackerConfig::default(),
            PipelineLimits {
                max_future_skew: Duration::from_secs(300),
                max_ciphertext_bytes: 64 * 1024,
            },
            metrics.clone(),
        );
        Fixture {
            me,
            peer: Keys::generate(),
            pipeline,
            metrics,
        }
    }

    fn dm_at(from: &Keys, to: &PublicKey, text: &str, created_at: u64) -> Event {
        let ciphertext = nip04::encrypt(from.secret_key(), to, text).unwrap();
        EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
            .tag(Tag::public_key(*to))
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(from)
            .unwrap()
    }

    fn reason(admission: Admission) -> DropReason {
        match admission {
            Admission::Dropped { reason, .. } => reason,
            Admission::Deliver(msg) => panic!("unexpected delivery: {msg:?}"),
        }
    }

    #[test]
    fn test_valid_dm_is_delivered_once() {
        let mut f = fixture(0);
        let event = build_dm(&f.peer, &f.me.public_key(), "hello").unwrap();

        match f.pipeline.admit(&event) {
            Admission::Deliver(msg) => {
                assert_eq!(msg.plaintext, "hello");
                assert_eq!(msg.sender, f.peer.public_key());
                assert_eq!(msg.event_id, event.id.to_hex());
            }
            other => panic!("expected delivery, got {other:?}"),
        }

        // Second relay delivers the same event while the first is in flight.
        assert_eq!(reason(f.pipeline.admit(&event)), DropReason::Duplicate);
        f.pipeline.complete(&event.id);
        assert_eq!(reason(f.pipeline.admit(&event)), DropReason::Duplicate);

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.counter(metrics::EVENT_RECEIVED), 3);
        assert_eq!(snapshot.counter(metrics::EVENT_DUPLICATE), 2);
        assert_eq!(snapshot.counter(metrics::EVENT_PROCESSED), 1);
    }

    #[test]
    fn test_self_message_dropped() {
        let mut f = fixture(0);
        let event = build_dm(&f.me, &f.me.public_key(), "echo").unwrap();
        assert_eq!(reason(f.pipeline.admit(&event)), DropReason::SelfMessage);
    }

    #[test]
    fn test_stale_and_future_events_dropped() {
        let now = unix_timestamp();
        let mut f = fixture(now - 100);

        let stale = dm_at(&f.peer, &f.me.public_key(), "old", now - 101);
        assert_eq!(reason(f.pipeline.admit(&stale)), DropReason::Stale);

        let future = dm_at(&f.peer, &f.me.public_key(), "later", now + 3_600);
        assert_eq!(reason(f.pipeline.admit(&future)), DropReason::Future);

        let on_time = dm_at(&f.peer, &f.me.public_key(), "now", now - 100);
        assert!(matches!(f.pipeline.admit(&on_time), Admission::Deliver(_)));
    }

    #[test]
    fn test_wrong_recipient_dropped_before_verification() {
        let mut f = fixture(0);
        let stranger = Keys::generate();
        let mut event = build_dm(&f.peer, &stranger.public_key(), "not for you").unwrap();
        // A broken signature must not matter: the p-tag check comes first.
        event.content.push('!');
        assert_eq!(reason(f.pipeline.admit(&event)), DropReason::WrongRecipient);
        assert!(!f.pipeline.is_seen(&event.id.to_hex()));
    }

    #[test]
    fn test_invalid_signature_is_reported_and_not_cached() {
        let mut f = fixture(0);
        let mut event = build_dm(&f.peer, &f.me.public_key(), "hi").unwrap();
        event.content.push('x');

        match f.pipeline.admit(&event) {
            Admission::Dropped { reason, error } => {
                assert_eq!(reason, DropReason::InvalidSignature);
                assert!(matches!(error, Some(Error::InvalidSignature(_))));
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert!(!f.pipeline.is_seen(&event.id.to_hex()));
        assert_eq!(f.pipeline.seen_len(), 0);
    }

    #[test]
    fn test_decrypt_failure_stays_seen() {
        let mut f = fixture(0);
        let event = EventBuilder::new(Kind::EncryptedDirectMessage, "definitely not nip04")
            .tag(Tag::public_key(f.me.public_key()))
            .sign_with_keys(&f.peer)
            .unwrap();

        match f.pipeline.admit(&event) {
            Admission::Dropped { reason, error } => {
                assert_eq!(reason, DropReason::DecryptFailed);
                assert!(matches!(error, Some(Error::Decrypt(_))));
            }
            other => panic!("expected drop, got {other:?}"),
        }
        assert!(f.pipeline.is_seen(&event.id.to_hex()));
        assert_eq!(reason(f.pipeline.admit(&event)), DropReason::Duplicate);
        assert_eq!(f.metrics.snapshot().counter(metrics::DECRYPT_FAILURE), 1);
    }

    #[test]
    fn test_oversized_and_wrong_kind_dropped() {
        let mut f = fixture(0);
        let big = EventBuilder::new(Kind::EncryptedDirectMessage, "a".repeat(64 * 1024 + 1))
            .tag(Tag::public_key(f.me.public_key()))
            .sign_with_keys(&f.peer)
            .unwrap();
        assert_eq!(reason(f.pipeline.admit(&big)), DropReason::Oversized);

        let note = EventBuilder::new(Kind::TextNote, "hi")
            .tag(Tag::public_key(f.me.public_key()))
            .sign_with_keys(&f.peer)
            .unwrap();
        assert_eq!(reason(f.pipeline.admit(&note)), DropReason::WrongKind);
    }

    #[test]
    fn test_seeded_ids_are_not_replayed() {
        let mut f = fixture(0);
        let first = build_dm(&f.peer, &f.me.public_key(), "one").unwrap();
        let second = build_dm(&f.peer, &f.me.public_key(), "two").unwrap();
        let third = build_dm(&f.peer, &f.me.public_key(), "three").unwrap();

        f.pipeline.seed_seen([
            first.id.to_hex(),
            second.id.to_hex(),
            third.id.to_hex(),
        ]);
        assert_eq!(reason(f.pipeline.admit(&second)), DropReason::Duplicate);
    }
}
