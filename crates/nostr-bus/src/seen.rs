//! Bounded, TTL'd set of processed event ids.
//!
//! Ids come straight from relays, so any string is a valid key here: empty,
//! huge, unicode or names like `__proto__` are just entries.

use std::time::Duration;

use indexmap::IndexMap;
use tokio::time::Instant;

const DEFAULT_MAX_ENTRIES: usize = 100_000;
const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
pub struct SeenTrackerConfig {
    pub max_entries: usize,
    pub ttl: Duration,
}

impl Default for SeenTrackerConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Insertion-ordered map of id -> inserted_at. The front is always the oldest
/// entry, so LRU eviction is a pop from the front.
#[derive(Debug)]
pub struct SeenTracker {
    config: SeenTrackerConfig,
    entries: IndexMap<String, Instant>,
}

impl SeenTracker {
    pub fn new(config: SeenTrackerConfig) -> Self {
        Self {
            config: SeenTrackerConfig {
                max_entries: config.max_entries.max(1),
                ttl: config.ttl,
            },
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Membership test with no side effects. Expired entries report absent.
    pub fn peek(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|inserted_at| !self.is_expired(*inserted_at))
            .unwrap_or(false)
    }

    /// Membership test that refreshes the entry's LRU position.
    pub fn has(&mut self, id: &str) -> bool {
        match self.entries.get(id).copied() {
            Some(inserted_at) if !self.is_expired(inserted_at) => {
                if let Some(index) = self.entries.get_index_of(id) {
                    let last = self.entries.len() - 1;
                    self.entries.move_index(index, last);
                }
                true
            }
            Some(_) => {
                self.entries.shift_remove(id);
                false
            }
            None => false,
        }
    }

    /// Insert `id`. Returns `true` if it was already present (and unexpired).
    pub fn add(&mut self, id: &str) -> bool {
        if self.has(id) {
            return true;
        }
        self.entries.insert(id.to_string(), Instant::now());
        self.evict_overflow();
        false
    }

    /// Bulk-load ids persisted by a previous process, oldest first. When the
    /// batch exceeds capacity only the newest `max_entries` survive.
    pub fn seed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let now = Instant::now();
        for id in ids {
            let id = id.as_ref();
            if let Some(index) = self.entries.get_index_of(id) {
                let last = self.entries.len() - 1;
                self.entries.move_index(index, last);
            }
            self.entries.insert(id.to_string(), now);
            self.evict_overflow();
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.shift_remove(id).is_some()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.entries.len();
        let ttl = self.config.ttl;
        self.entries.retain(|_, inserted_at| inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ids oldest-first, newest `limit` of them.
    pub fn recent_ids(&self, limit: usize) -> Vec<String> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.keys().skip(skip).cloned().collect()
    }

    fn is_expired(&self, inserted_at: Instant) -> bool {
        inserted_at.elapsed() >= self.config.ttl
    }

    fn evict_overflow(&mut self) {
        while self.entries.len() > self.config.max_entries {
            self.entries.shift_remove_index(0);
        }
    }
}

impl Default for SeenTracker {
    fn default() -> Self {
        Self::new(SeenTrackerConfig::default())
    }
}
