use std::env;
use std::path::PathBuf;
use std::time::Duration;

use nostr_sdk::prelude::*;
use rand_core::{OsRng, RngCore};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::seen::SeenTrackerConfig;
use crate::Error;

const DEFAULT_ACCOUNT_ID: &str = "default";
const DEFAULT_STATE_DIR: &str = "./data/nostr";
const DEFAULT_STARTUP_LOOKBACK_SECS: u64 = 120;
const DEFAULT_CHECKPOINT_DEBOUNCE_SECS: u64 = 5;
const DEFAULT_RELAY_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_FUTURE_SKEW_SECS: u64 = 300;
const DEFAULT_MAX_CIPHERTEXT_BYTES: usize = 64 * 1024;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Backoff for re-establishing the inbound subscription.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of retries (None = infinite).
    pub max_retries: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier for each retry.
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.3 = ±30%).
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl ReconnectConfig {
    /// Delay for a given attempt number, without jitter.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(32) as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Delay for a given attempt number with jitter applied, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt).as_millis() as f64;
        let unit = OsRng.next_u32() as f64 / u32::MAX as f64;
        let spread = self.jitter.clamp(0.0, 1.0) * (unit * 2.0 - 1.0);
        let delay = Duration::from_millis((base * (1.0 + spread)).max(0.0) as u64);
        delay.min(self.max_delay)
    }

    /// Check if we should retry after the given number of attempts.
    pub fn should_retry(&self, attempts: u32) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub account_id: String,
    pub secret_key: String,
    pub relays: Vec<String>,
    pub state_dir: PathBuf,
    /// Subtracted from the resume point to absorb relay lag and clock skew.
    pub startup_lookback: Duration,
    pub checkpoint_debounce: Duration,
    /// Per-relay deadline for a DM publish attempt.
    pub send_timeout: Duration,
    pub profile_publish_timeout: Duration,
    pub profile_import_timeout: Duration,
    pub max_future_skew: Duration,
    pub max_ciphertext_bytes: usize,
    pub seen: SeenTrackerConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub reconnect: ReconnectConfig,
    /// How long `close` waits for running handlers before flushing.
    pub shutdown_grace: Duration,
}

impl BusConfig {
    pub fn new(secret_key: impl Into<String>, relays: Vec<String>) -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            secret_key: secret_key.into(),
            relays,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            startup_lookback: Duration::from_secs(DEFAULT_STARTUP_LOOKBACK_SECS),
            checkpoint_debounce: Duration::from_secs(DEFAULT_CHECKPOINT_DEBOUNCE_SECS),
            send_timeout: Duration::from_secs(DEFAULT_RELAY_TIMEOUT_SECS),
            profile_publish_timeout: Duration::from_secs(DEFAULT_RELAY_TIMEOUT_SECS),
            profile_import_timeout: Duration::from_secs(DEFAULT_RELAY_TIMEOUT_SECS),
            max_future_skew: Duration::from_secs(DEFAULT_MAX_FUTURE_SKEW_SECS),
            max_ciphertext_bytes: DEFAULT_MAX_CIPHERTEXT_BYTES,
            seen: SeenTrackerConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            reconnect: ReconnectConfig::default(),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = account_id.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn from_env() -> Result<Option<Self>, Error> {
        let relays = match env::var("NOSTR_RELAYS") {
            Ok(value) => parse_relays(&value),
            Err(_) => Vec::new(),
        };
        if relays.is_empty() {
            return Ok(None);
        }

        let secret_key =
            env::var("NOSTR_SECRET_KEY").map_err(|_| Error::MissingEnv("NOSTR_SECRET_KEY"))?;
        let mut config = Self::new(secret_key, relays);
        if let Ok(account_id) = env::var("NOSTR_ACCOUNT_ID") {
            config.account_id = account_id;
        }
        if let Ok(dir) = env::var("NOSTR_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        Ok(Some(config))
    }

    /// Parse the signing key and check the relay list. Both failures are
    /// fatal at start-up.
    pub fn validate(&self) -> Result<Keys, Error> {
        if self.relays.is_empty() {
            return Err(Error::Config("at least one relay is required".to_string()));
        }
        let keys = Keys::parse(self.secret_key.trim())?;
        Ok(keys)
    }
}

pub fn parse_relays(value: &str) -> Vec<String> {
    value
        .split(',')
        .flat_map(|chunk| chunk.split_whitespace())
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relays_mixed_separators() {
        let relays = parse_relays("wss://a.example, wss://b.example\twss://c.example,,");
        assert_eq!(
            relays,
            vec!["wss://a.example", "wss://b.example", "wss://c.example"]
        );
    }

    #[test]
    fn test_validate_rejects_empty_relays() {
        let keys = Keys::generate();
        let config = BusConfig::new(keys.secret_key().to_secret_hex(), vec![]);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_key() {
        let config = BusConfig::new("not-a-key", vec!["wss://relay.example".to_string()]);
        assert!(matches!(config.validate(), Err(Error::NostrKey(_))));
    }

    #[test]
    fn test_validate_accepts_hex_key() {
        let keys = Keys::generate();
        let config = BusConfig::new(
            keys.secret_key().to_secret_hex(),
            vec!["wss://relay.example".to_string()],
        );
        assert_eq!(config.validate().unwrap().public_key(), keys.public_key());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.base_delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.base_delay_for_attempt(20), Duration::from_secs(60));
        for attempt in 0..10 {
            let delay = config.delay_for_attempt(attempt);
            let base = config.base_delay_for_attempt(attempt).as_millis() as f64;
            assert!(delay <= config.max_delay);
            assert!(delay.as_millis() as f64 >= base * 0.7 - 1.0);
        }
    }

    #[test]
    fn test_should_retry_respects_limit() {
        let config = ReconnectConfig {
            max_retries: Some(2),
            ..Default::default()
        };
        assert!(config.should_retry(1));
        assert!(!config.should_retry(2));
        assert!(ReconnectConfig::default().should_retry(u32::MAX - 1));
    }
}
