use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("nostr client error: {0}")]
    NostrClient(#[from] nostr_sdk::client::Error),
    #[error("nostr key error: {0}")]
    NostrKey(#[from] nostr_sdk::nostr::key::Error),
    #[error("serde json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing env var: {0}")]
    MissingEnv(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("failed to sign event: {0}")]
    Signing(String),
    #[error("invalid event signature: {0}")]
    InvalidSignature(String),
    #[error("encrypt failed: {0}")]
    Encrypt(String),
    #[error("decrypt failed: {0}")]
    Decrypt(String),
    #[error("relay {relay} rejected event: {reason}")]
    RelayRejected { relay: String, reason: String },
    #[error("all relays failed, last error: {0}")]
    AllRelaysFailed(Box<Error>),
    #[error("no relay available (all circuits open)")]
    NoRelayAvailable,
    #[error("profile not found on {queried} relay(s)")]
    ProfileNotFound { queried: usize },
    #[error("unsafe url in field {field}: {reason}")]
    UnsafeUrl { field: &'static str, reason: String },
    #[error("message handler failed: {0}")]
    Handler(String),
    #[error("bus is closed")]
    Closed,
    #[error("mutex poisoned")]
    MutexPoisoned,
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// True when the error came from a relay deadline rather than a rejection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}
