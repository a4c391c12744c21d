//! Durable per-account checkpoints.
//!
//! Two JSON files live in the state directory for each account:
//! `bus-state-<account>.json` (resume point and recent event ids) and
//! `profile-state-<account>.json` (last profile publish). Reads never fail:
//! anything missing or unreadable is treated as "no state".

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Error;

pub const BUS_STATE_VERSION: u32 = 2;
pub const PROFILE_STATE_VERSION: u32 = 1;
pub const MAX_PERSISTED_EVENT_IDS: usize = 5000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusState {
    pub version: u32,
    pub last_processed_at: Option<u64>,
    pub gateway_started_at: Option<u64>,
    #[serde(default)]
    pub recent_event_ids: Vec<String>,
}

impl BusState {
    pub fn new(last_processed_at: Option<u64>, gateway_started_at: Option<u64>) -> Self {
        Self {
            version: BUS_STATE_VERSION,
            last_processed_at,
            gateway_started_at,
            recent_event_ids: Vec::new(),
        }
    }

    /// Advance the checkpoint. `last_processed_at` never moves backwards.
    pub fn record(&mut self, created_at: u64, event_id: &str) {
        self.last_processed_at = Some(self.last_processed_at.map_or(created_at, |t| t.max(created_at)));
        if !self.recent_event_ids.iter().any(|id| id == event_id) {
            self.recent_event_ids.push(event_id.to_string());
        }
        truncate_oldest(&mut self.recent_event_ids, MAX_PERSISTED_EVENT_IDS);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishStatus {
    Ok,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileState {
    pub version: u32,
    pub last_published_at: Option<u64>,
    pub last_published_event_id: Option<String>,
    #[serde(default)]
    pub last_publish_results: HashMap<String, PublishStatus>,
}

/// Resume point for the inbound subscription, before the lookback window is
/// subtracted. Without state we start from `now`.
pub fn compute_since_timestamp(state: Option<&BusState>, now: u64) -> u64 {
    let Some(state) = state else {
        return now;
    };
    [state.last_processed_at, state.gateway_started_at]
        .into_iter()
        .flatten()
        .filter(|ts| *ts > 0)
        .max()
        .unwrap_or(now)
}

/// Replaces characters that are unsafe in file names.
pub fn normalize_account_id(account_id: &str) -> String {
    let trimmed = account_id.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    account_id: String,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>, account_id: &str) -> Self {
        Self {
            dir: dir.into(),
            account_id: normalize_account_id(account_id),
        }
    }

    pub fn bus_state_path(&self) -> PathBuf {
        self.dir.join(format!("bus-state-{}.json", self.account_id))
    }

    pub fn profile_state_path(&self) -> PathBuf {
        self.dir.join(format!("profile-state-{}.json", self.account_id))
    }

    pub fn read_bus_state(&self) -> Option<BusState> {
        let value = read_json(&self.bus_state_path())?;
        match value.get("version").and_then(Value::as_u64) {
            Some(1) => {
                let legacy: BusState = serde_json::from_value(value).ok()?;
                Some(BusState {
                    version: BUS_STATE_VERSION,
                    recent_event_ids: Vec::new(),
                    ..legacy
                })
            }
            Some(2) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    pub fn write_bus_state(&self, state: &BusState) -> Result<(), Error> {
        let mut state = state.clone();
        state.version = BUS_STATE_VERSION;
        truncate_oldest(&mut state.recent_event_ids, MAX_PERSISTED_EVENT_IDS);
        write_json_atomic(&self.bus_state_path(), &state)
    }

    pub fn read_profile_state(&self) -> Option<ProfileState> {
        let value = read_json(&self.profile_state_path())?;
        match value.get("version").and_then(Value::as_u64) {
            Some(1) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }

    pub fn write_profile_state(&self, state: &ProfileState) -> Result<(), Error> {
        let mut state = state.clone();
        state.version = PROFILE_STATE_VERSION;
        write_json_atomic(&self.profile_state_path(), &state)
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Ignoring corrupt state file");
            None
        }
    }
}

fn truncate_oldest(ids: &mut Vec<String>, max: usize) {
    if ids.len() > max {
        let excess = ids.len() - max;
        ids.drain(..excess);
    }
}

/// Write to a randomly named sibling, restrict it to the owner, then rename
/// over the target so readers never observe a partial file.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), Error> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("state path has no parent: {}", path.display())))?;
    create_private_dir(dir)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state.json");
    let mut suffix = [0u8; 8];
    OsRng.fill_bytes(&mut suffix);
    let tmp_path = dir.join(format!("{file_name}.{}.tmp", hex::encode(suffix)));

    let json = serde_json::to_vec_pretty(value)?;
    let result = (|| -> Result<(), Error> {
        let mut file = fs::File::create(&tmp_path)?;
        set_owner_only(&tmp_path, 0o600)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn create_private_dir(dir: &Path) -> Result<(), Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir)?;
    Ok(())
}

fn set_owner_only(path: &Path, mode: u32) -> Result<(), Error> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

pub type WriteErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct CheckpointInner {
    state: BusState,
    dirty: bool,
}

/// Debounced writer for [`BusState`].
///
/// `record` only touches memory and wakes the writer task; the task waits for
/// a quiet period before writing, so bursts coalesce into one write and at
/// most one write is ever pending. `close` flushes synchronously.
pub struct CheckpointWriter {
    store: StateStore,
    inner: Arc<Mutex<CheckpointInner>>,
    write_lock: Mutex<()>,
    wake: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    on_error: Option<WriteErrorCallback>,
}

impl CheckpointWriter {
    pub fn spawn(
        store: StateStore,
        initial: BusState,
        debounce: Duration,
        on_error: Option<WriteErrorCallback>,
    ) -> Arc<Self> {
        let writer = Arc::new(Self {
            store,
            inner: Arc::new(Mutex::new(CheckpointInner {
                state: initial,
                dirty: false,
            })),
            write_lock: Mutex::new(()),
            wake: Arc::new(Notify::new()),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
            on_error,
        });

        let task_writer = Arc::downgrade(&writer);
        let wake = writer.wake.clone();
        let handle = tokio::spawn(async move {
            loop {
                wake.notified().await;
                // Keep extending the quiet period while updates keep arriving.
                while tokio::time::timeout(debounce, wake.notified()).await.is_ok() {}
                let Some(writer) = task_writer.upgrade() else {
                    return;
                };
                writer.flush_reporting();
            }
        });
        if let Ok(mut task) = writer.task.lock() {
            *task = Some(handle);
        }
        writer
    }

    pub fn record(&self, created_at: u64, event_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.state.record(created_at, event_id);
            inner.dirty = true;
        }
        // Without the debounce task, late records are written straight away.
        if self.closed.load(Ordering::SeqCst) {
            self.flush_reporting();
        } else {
            self.wake.notify_one();
        }
    }

    pub fn snapshot(&self) -> BusState {
        self.inner
            .lock()
            .map(|inner| inner.state.clone())
            .unwrap_or_default()
    }

    /// Write the current state now if anything changed since the last write.
    pub fn flush(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().map_err(|_| Error::MutexPoisoned)?;
        let state = {
            let mut inner = self.inner.lock().map_err(|_| Error::MutexPoisoned)?;
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            inner.state.clone()
        };

        if let Err(err) = self.store.write_bus_state(&state) {
            // In-memory state stays authoritative; retry on the next flush.
            if let Ok(mut inner) = self.inner.lock() {
                inner.dirty = true;
            }
            return Err(err);
        }
        debug!(
            last_processed_at = ?state.last_processed_at,
            ids = state.recent_event_ids.len(),
            "Wrote bus checkpoint"
        );
        Ok(())
    }

    /// Stop the debounce task and write any pending state.
    pub fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
        self.flush()
    }

    fn flush_reporting(&self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, "Failed to write bus checkpoint");
            if let Some(on_error) = &self.on_error {
                on_error(&err);
            }
        }
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
