use std::time::{SystemTime, UNIX_EPOCH};

use nostr_sdk::prelude::*;

use crate::Error;

/// An inbound DM that passed every pipeline check and was decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    pub event_id: String,
    pub sender: PublicKey,
    pub plaintext: String,
    pub created_at: u64,
}

/// Strictly parse relay-supplied JSON into a typed event.
///
/// Missing or mistyped fields are rejected here, so nothing downstream has to
/// re-check the event shape.
pub fn parse_event_json(raw: &str) -> Result<Event, Error> {
    Event::from_json(raw).map_err(|err| Error::MalformedEvent(err.to_string()))
}

/// Values of every tag named `name` (first value only).
pub fn tag_values<'a>(event: &'a Event, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    event.tags.iter().filter_map(move |tag| {
        let parts = tag.as_slice();
        if parts.len() >= 2 && parts[0] == name {
            Some(parts[1].as_str())
        } else {
            None
        }
    })
}

/// True when the event carries `["p", <pubkey>]` for the given key.
pub fn is_addressed_to(event: &Event, pubkey: &PublicKey) -> bool {
    let hex = pubkey.to_hex();
    tag_values(event, "p").any(|value| value.eq_ignore_ascii_case(&hex))
}

pub fn dm_filter(recipient: PublicKey, since: u64) -> Filter {
    Filter::new()
        .kind(Kind::EncryptedDirectMessage)
        .pubkey(recipient)
        .since(Timestamp::from(since))
}

pub fn profile_filter(author: PublicKey) -> Filter {
    Filter::new().kind(Kind::Metadata).author(author).limit(1)
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
