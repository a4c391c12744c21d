//! Fetch the newest kind-0 profile for a pubkey from every relay.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use nostr_sdk::prelude::*;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::ProfileContent;
use crate::crypto::verify_event;
use crate::events::profile_filter;
use crate::transport::RelayTransport;
use crate::Error;

#[derive(Debug, Clone)]
pub struct ImportedProfile {
    /// Parsed content with unsafe URL fields removed.
    pub profile: ProfileContent,
    pub event_id: String,
    pub created_at: u64,
    pub source_relay: String,
    pub relays_queried: usize,
}

pub struct ProfileImporter {
    transport: Arc<dyn RelayTransport>,
    timeout: Duration,
}

impl ProfileImporter {
    pub fn new(transport: Arc<dyn RelayTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    /// Query all relays in parallel under one overall deadline. Relays that
    /// have not answered by the deadline are ignored.
    pub async fn import(&self, author: &PublicKey) -> Result<ImportedProfile, Error> {
        let relays = self.transport.relays();
        let deadline = Instant::now() + self.timeout;

        let mut pending: FuturesUnordered<_> = relays
            .iter()
            .map(|relay| async move {
                let events = self
                    .transport
                    .fetch(relay, profile_filter(*author), self.timeout)
                    .await;
                (relay.clone(), events)
            })
            .collect();

        let mut best: Option<(String, Event)> = None;
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((relay, Ok(events)))) => {
                    debug!(relay = %relay, count = events.len(), "Profile fetch returned");
                    for event in events {
                        if event.pubkey != *author || event.kind != Kind::Metadata {
                            continue;
                        }
                        // Strictly newer only, so ties keep the first seen.
                        let newer = best
                            .as_ref()
                            .map_or(true, |(_, current)| event.created_at > current.created_at);
                        if newer {
                            best = Some((relay.clone(), event));
                        }
                    }
                }
                Ok(Some((relay, Err(err)))) => {
                    warn!(relay = %relay, error = %err, "Profile fetch failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(pending = pending.len(), "Profile import deadline reached");
                    break;
                }
            }
        }

        let Some((source_relay, event)) = best else {
            return Err(Error::ProfileNotFound {
                queried: relays.len(),
            });
        };

        verify_event(&event)?;
        let mut profile = ProfileContent::from_json(&event.content)
            .map_err(|err| Error::MalformedEvent(format!("profile content: {}", err)))?;
        let dropped = profile.sanitize_urls();
        if !dropped.is_empty() {
            warn!(event_id = %event.id, fields = ?dropped, "Dropped unsafe profile URLs");
        }

        info!(
            author = %author,
            event_id = %event.id,
            relay = %source_relay,
            "Imported profile"
        );
        Ok(ImportedProfile {
            profile,
            event_id: event.id.to_hex(),
            created_at: event.created_at.as_secs(),
            source_relay,
            relays_queried: relays.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RelayNotice;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct StoredTransport {
        relays: Vec<String>,
        stored: HashMap<String, Vec<Event>>,
        hang: Vec<String>,
    }

    #[async_trait]
    impl RelayTransport for StoredTransport {
        fn relays(&self) -> Vec<String> {
            self.relays.clone()
        }

        async fn subscribe(
            &self,
            _filter: Filter,
        ) -> Result<mpsc::UnboundedReceiver<RelayNotice>, Error> {
            Ok(mpsc::unbounded_channel().1)
        }

        async fn publish(&self, _relay: &str, _event: &Event) -> Result<(), Error> {
            Ok(())
        }

        async fn fetch(
            &self,
            relay: &str,
            _filter: Filter,
            _timeout: Duration,
        ) -> Result<Vec<Event>, Error> {
            if self.hang.iter().any(|r| r == relay) {
                std::future::pending::<()>().await;
            }
            Ok(self.stored.get(relay).cloned().unwrap_or_default())
        }

        async fn close(&self) {}
    }

    fn profile_event(keys: &Keys, content: &str, created_at: u64) -> Event {
        EventBuilder::new(Kind::Metadata, content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(keys)
            .unwrap()
    }

    fn importer(stored: Vec<(&str, Vec<Event>)>, hang: &[&str]) -> ProfileImporter {
        let transport = StoredTransport {
            relays: stored.iter().map(|(r, _)| r.to_string()).collect(),
            stored: stored
                .into_iter()
                .map(|(r, events)| (r.to_string(), events))
                .collect(),
            hang: hang.iter().map(|r| r.to_string()).collect(),
        };
        ProfileImporter::new(Arc::new(transport), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_newest_event_wins() {
        let keys = Keys::generate();
        let old = profile_event(&keys, r#"{"name":"old"}"#, 1_000);
        let new = profile_event(&keys, r#"{"name":"new"}"#, 2_000);

        let importer = importer(vec![("wss://a", vec![old]), ("wss://b", vec![new.clone()])], &[]);
        let imported = importer.import(&keys.public_key()).await.unwrap();

        assert_eq!(imported.profile.name.as_deref(), Some("new"));
        assert_eq!(imported.event_id, new.id.to_hex());
        assert_eq!(imported.created_at, 2_000);
        assert_eq!(imported.source_relay, "wss://b");
        assert_eq!(imported.relays_queried, 2);
    }

    #[tokio::test]
    async fn test_foreign_author_is_ignored() {
        let keys = Keys::generate();
        let other = Keys::generate();
        let mine = profile_event(&keys, r#"{"name":"mine"}"#, 1_000);
        let spoof = profile_event(&other, r#"{"name":"spoof"}"#, 9_000);

        let importer = importer(vec![("wss://a", vec![mine, spoof])], &[]);
        let imported = importer.import(&keys.public_key()).await.unwrap();
        assert_eq!(imported.profile.name.as_deref(), Some("mine"));
    }

    #[tokio::test]
    async fn test_invalid_signature_fails() {
        let keys = Keys::generate();
        let mut event = profile_event(&keys, r#"{"name":"x"}"#, 1_000);
        event.content = r#"{"name":"tampered"}"#.to_string();

        let importer = importer(vec![("wss://a", vec![event])], &[]);
        assert!(matches!(
            importer.import(&keys.public_key()).await,
            Err(Error::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn test_unsafe_urls_are_dropped() {
        let keys = Keys::generate();
        let event = profile_event(
            &keys,
            r#"{"name":"x","picture":"https://10.0.0.1/p.png","website":"https://example.com"}"#,
            1_000,
        );

        let importer = importer(vec![("wss://a", vec![event])], &[]);
        let imported = importer.import(&keys.public_key()).await.unwrap();
        assert_eq!(imported.profile.picture, None);
        assert_eq!(imported.profile.website.as_deref(), Some("https://example.com"));
    }

    #[tokio::test]
    async fn test_mistyped_fields_do_not_fail_import() {
        let keys = Keys::generate();
        let event = profile_event(
            &keys,
            r#"{"name":"Alice","about":"hi","nip05":123,"lud16":false}"#,
            1_000,
        );

        let importer = importer(vec![("wss://a", vec![event])], &[]);
        let imported = importer.import(&keys.public_key()).await.unwrap();
        assert_eq!(imported.profile.name.as_deref(), Some("Alice"));
        assert_eq!(imported.profile.about.as_deref(), Some("hi"));
        assert_eq!(imported.profile.nip05, None);
        assert_eq!(imported.profile.lud16, None);
    }

    #[tokio::test]
    async fn test_not_found() {
        let keys = Keys::generate();
        let importer = importer(vec![("wss://a", vec![]), ("wss://b", vec![])], &[]);
        assert!(matches!(
            importer.import(&keys.public_key()).await,
            Err(Error::ProfileNotFound { queried: 2 })
        ));
    }

    #[tokio::test]
    async fn test_hung_relay_does_not_block_result() {
        let keys = Keys::generate();
        let event = profile_event(&keys, r#"{"name":"x"}"#, 1_000);

        let importer = importer(vec![("wss://a", vec![event]), ("wss://stuck", vec![])], &["wss://stuck"]);
        let imported = importer.import(&keys.public_key()).await.unwrap();
        assert_eq!(imported.source_relay, "wss://a");
    }
}
