use nostr_sdk::nostr::nips::nip04;
use nostr_sdk::prelude::*;

use crate::Error;

/// Build and sign a NIP-04 encrypted DM addressed with a `p` tag.
pub fn build_dm(keys: &Keys, recipient: &PublicKey, plaintext: &str) -> Result<Event, Error> {
    let ciphertext = nip04::encrypt(keys.secret_key(), recipient, plaintext)
        .map_err(|err| Error::Encrypt(err.to_string()))?;
    EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
        .tag(Tag::public_key(*recipient))
        .sign_with_keys(keys)
        .map_err(|err| Error::Signing(err.to_string()))
}

pub fn decrypt_dm(keys: &Keys, event: &Event) -> Result<String, Error> {
    nip04::decrypt(keys.secret_key(), &event.pubkey, &event.content)
        .map_err(|err| Error::Decrypt(err.to_string()))
}

/// Check both the id hash and the schnorr signature.
pub fn verify_event(event: &Event) -> Result<(), Error> {
    event
        .verify()
        .map_err(|err| Error::InvalidSignature(err.to_string()))
}

pub fn parse_public_key(value: &str) -> Result<PublicKey, Error> {
    Ok(PublicKey::parse(value.trim())?)
}
