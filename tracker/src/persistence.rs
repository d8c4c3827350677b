//! Durable storage for the checklist.
//!
//! The checklist lives in a single JSON document, [`DOCUMENT_FILE`], under an
//! application-owned directory.
//!
//! # Design
//!
//! - **Load never fails**: a missing, truncated, corrupt, or schema-mismatched
//!   document resolves to a repaired or default state. Corrupt documents are
//!   kept aside as `checklist.json.corrupt`. Everything discarded is logged.
//!
//! - **Atomic writes**: the document is serialized to a temporary file in the
//!   same directory and then renamed over the target, so a crash mid-write
//!   leaves the previous good copy intact.
//!
//! - **Snapshot debouncing**: [`PersistenceManager::request_debounced_save`]
//!   deep-copies the state at call time. The flush task only ever sees that
//!   copy, never live state.
//!
//! - **Ordered writes**: each snapshot carries a generation number taken at
//!   request time. A write whose generation is older than the last one
//!   written is skipped, so a delayed flush can never overwrite the final
//!   shutdown save.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use dutyroll_tracker::catalog::Catalog;
//! use dutyroll_tracker::persistence::PersistenceManager;
//!
//! let catalog = Catalog::builtin();
//! let store = PersistenceManager::new("/tmp/dutyroll");
//! let state = store.load(&catalog, Some("alice"), Utc::now());
//! store.save(&state).unwrap();
//! ```

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{Cadence, Catalog};
use crate::types::{ChecklistState, Task};
use crate::utils::debounce::Debouncer;

/// Name of the checklist document inside the data directory.
pub const DOCUMENT_FILE: &str = "checklist.json";

/// Suffix appended to a document that could not be read.
pub const CORRUPT_SUFFIX: &str = "corrupt";

/// Current document schema.
pub const SCHEMA_VERSION: u32 = 1;

/// Upper bound on persisted task entries.
pub const MAX_TASKS: usize = 256;

/// Timestamps further in the future than this are discarded on load.
const MAX_FUTURE_SKEW_HOURS: i64 = 24;

/// Debounce key for the checklist document.
const SAVE_KEY: &str = "checklist";

/// Capacity of the channel between the debouncer and the flush task.
const FLUSH_CHANNEL_CAPACITY: usize = 16;

/// Errors from writing the checklist document.
///
/// Loading has no error type: it always produces a usable state.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The temporary file could not be renamed over the document.
    #[error("failed to replace document: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// On-disk form of [`ChecklistState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    pub schema_version: u32,
    pub tasks: Vec<Task>,
    pub last_daily_reset: Option<DateTime<Utc>>,
    pub last_weekly_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dedicated_reset_timestamps: BTreeMap<String, DateTime<Utc>>,
    pub last_save_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_identity: Option<String>,
}

impl PersistedDocument {
    fn from_state(state: &ChecklistState, saved_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tasks: state.tasks.clone(),
            last_daily_reset: state.last_daily_reset,
            last_weekly_reset: state.last_weekly_reset,
            dedicated_reset_timestamps: state.dedicated_resets.clone(),
            last_save_time: Some(saved_at),
            owner_identity: state.owner.clone(),
        }
    }
}

/// Where a loaded state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    /// No document existed; catalog defaults.
    Missing,
    /// The document was read, possibly with repairs.
    Document,
    /// The document could not be parsed; catalog defaults.
    Corrupt(String),
    /// The document had an unsupported schema version; catalog defaults.
    SchemaMismatch(Option<u64>),
    /// The document belongs to another owner; catalog defaults.
    OwnerMismatch(String),
}

/// A loaded state plus what had to be discarded to get it.
#[derive(Debug, Clone)]
pub struct LoadReport {
    pub state: ChecklistState,
    pub origin: LoadOrigin,
    pub discarded: Vec<String>,
}

#[derive(Debug)]
struct Snapshot {
    generation: u64,
    state: ChecklistState,
}

/// State shared with the flush task.
#[derive(Debug)]
struct Store {
    dir: PathBuf,
    path: PathBuf,
    next_generation: AtomicU64,
    /// Generation of the newest document on disk. The lock also serializes writes.
    written: Mutex<u64>,
    writes: AtomicUsize,
}

impl Store {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Writes `state` unless a newer generation is already on disk.
    ///
    /// Returns whether the file was written.
    fn write(&self, generation: u64, state: &ChecklistState) -> Result<bool, PersistenceError> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if generation <= *written {
            debug!(generation, newest = *written, "Skipping stale snapshot");
            return Ok(false);
        }

        std::fs::create_dir_all(&self.dir)?;
        let document = PersistedDocument::from_state(state, Utc::now());
        let json = serde_json::to_vec_pretty(&document)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        *written = generation;
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            path = %self.path.display(),
            generation,
            tasks = document.tasks.len(),
            "Checklist saved"
        );
        Ok(true)
    }
}

/// Loads and saves the checklist document.
#[derive(Debug)]
pub struct PersistenceManager {
    store: Arc<Store>,
    debouncer: Option<Debouncer<&'static str, Snapshot>>,
    flush_task: Option<JoinHandle<()>>,
}

impl PersistenceManager {
    /// Creates a manager for `dir`. Debounced saves write immediately until
    /// [`with_debounce`](Self::with_debounce) is used.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(DOCUMENT_FILE);
        Self {
            store: Arc::new(Store {
                dir,
                path,
                next_generation: AtomicU64::new(0),
                written: Mutex::new(0),
                writes: AtomicUsize::new(0),
            }),
            debouncer: None,
            flush_task: None,
        }
    }

    /// Enables debounced saves with the given quiet period.
    ///
    /// Spawns the debouncer and the flush task, so it must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn with_debounce(mut self, quiet_period: Duration) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
        self.debouncer = Some(Debouncer::new(quiet_period, flush_tx));
        self.flush_task = Some(tokio::spawn(run_flush_loop(Arc::clone(&self.store), flush_rx)));
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.store.path
    }

    /// Number of physical document writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.store.writes.load(Ordering::SeqCst)
    }

    /// Loads the checklist for `owner`.
    ///
    /// Never fails; see [`load_with_report`](Self::load_with_report).
    #[must_use]
    pub fn load(&self, catalog: &Catalog, owner: Option<&str>, now: DateTime<Utc>) -> ChecklistState {
        self.load_with_report(catalog, owner, now).state
    }

    /// Loads the checklist, reporting where it came from and what was discarded.
    #[must_use]
    pub fn load_with_report(&self, catalog: &Catalog, owner: Option<&str>, now: DateTime<Utc>) -> LoadReport {
        let owner_string = owner.map(str::to_string);
        let defaults = |origin: LoadOrigin, discarded: Vec<String>| LoadReport {
            state: catalog.default_state(owner_string.clone()),
            origin,
            discarded,
        };

        let path = &self.store.path;
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No checklist document, using catalog defaults");
                return defaults(LoadOrigin::Missing, Vec::new());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Checklist document unreadable, using catalog defaults");
                return defaults(LoadOrigin::Corrupt(e.to_string()), Vec::new());
            }
        };

        let root: Value = match serde_json::from_slice(&bytes) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) => {
                self.set_aside_corrupt();
                warn!(path = %path.display(), "Checklist document is not an object, using catalog defaults");
                return defaults(LoadOrigin::Corrupt("document is not an object".into()), Vec::new());
            }
            Err(e) => {
                self.set_aside_corrupt();
                warn!(path = %path.display(), error = %e, "Checklist document corrupt, using catalog defaults");
                return defaults(LoadOrigin::Corrupt(e.to_string()), Vec::new());
            }
        };

        let version = root.get("schemaVersion").and_then(Value::as_u64);
        if version != Some(u64::from(SCHEMA_VERSION)) {
            self.set_aside_corrupt();
            warn!(
                path = %path.display(),
                found = ?version,
                expected = SCHEMA_VERSION,
                "Checklist schema mismatch, using catalog defaults"
            );
            return defaults(LoadOrigin::SchemaMismatch(version), Vec::new());
        }

        let stored_owner = root.get("ownerIdentity").and_then(Value::as_str).map(str::to_string);
        if let (Some(stored), Some(current)) = (&stored_owner, owner) {
            if stored != current {
                warn!(stored = %stored, current = %current, "Checklist belongs to another owner, using catalog defaults");
                return defaults(LoadOrigin::OwnerMismatch(stored.clone()), Vec::new());
            }
        }

        let mut repair = Repair::new(catalog, now);
        let state = repair.apply(&root, owner_string.or(stored_owner));

        for entry in &repair.discarded {
            warn!(path = %path.display(), discarded = %entry, "Discarded checklist entry");
        }
        info!(
            path = %path.display(),
            tasks = state.tasks.len(),
            discarded = repair.discarded.len(),
            "Checklist loaded"
        );

        LoadReport {
            state,
            origin: LoadOrigin::Document,
            discarded: repair.discarded,
        }
    }

    fn set_aside_corrupt(&self) {
        let target = self.store.path.with_extension(format!("json.{CORRUPT_SUFFIX}"));
        match std::fs::rename(&self.store.path, &target) {
            Ok(()) => info!(path = %target.display(), "Kept unreadable checklist document aside"),
            Err(e) => warn!(path = %target.display(), error = %e, "Could not keep unreadable document aside"),
        }
    }

    /// Writes `state` atomically, right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, temporary file, or rename fails.
    /// The previous document is left intact in every failure case.
    pub fn save(&self, state: &ChecklistState) -> Result<(), PersistenceError> {
        let generation = self.store.next_generation();
        self.store.write(generation, state)?;
        Ok(())
    }

    /// Snapshots `state` now and schedules a write after the quiet period,
    /// replacing any earlier pending request.
    pub fn request_debounced_save(&self, state: &ChecklistState) {
        let snapshot = Snapshot {
            generation: self.store.next_generation(),
            state: state.clone(),
        };

        let Some(debouncer) = &self.debouncer else {
            if let Err(e) = self.store.write(snapshot.generation, &snapshot.state) {
                error!(error = %e, "Checklist save failed");
            }
            return;
        };

        if let Err(e) = debouncer.try_send(SAVE_KEY, snapshot) {
            // Nothing newer is queued behind a failed request, so persist the
            // latest state right away instead of losing it.
            warn!(error = %e, "Debounced save rejected, saving immediately");
            let generation = self.store.next_generation();
            if let Err(e) = self.store.write(generation, state) {
                error!(error = %e, "Checklist save failed");
            }
        }
    }

    /// Cancels any pending debounced save, then saves `final_state`
    /// synchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the final save fails.
    pub async fn shutdown(&mut self, final_state: &ChecklistState) -> Result<(), PersistenceError> {
        if let Some(debouncer) = self.debouncer.take() {
            match debouncer.cancel(SAVE_KEY).await {
                Ok(true) => debug!("Pending debounced save cancelled"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Could not cancel pending save"),
            }
        }

        let result = self.save(final_state);

        if let Some(handle) = self.flush_task.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Flush task failed");
            }
        }

        match &result {
            Ok(()) => info!(path = %self.store.path.display(), "Final checklist save complete"),
            Err(e) => error!(error = %e, "Final checklist save failed"),
        }
        result
    }
}

async fn run_flush_loop(store: Arc<Store>, mut flush_rx: mpsc::Receiver<(&'static str, Snapshot)>) {
    while let Some((_, snapshot)) = flush_rx.recv().await {
        let store = Arc::clone(&store);
        let generation = snapshot.generation;
        let result = tokio::task::spawn_blocking(move || store.write(snapshot.generation, &snapshot.state)).await;
        match result {
            Ok(Ok(true)) => debug!(generation, "Debounced save flushed"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => error!(generation, error = %e, "Debounced save failed"),
            Err(e) => error!(generation, error = %e, "Debounced save task panicked"),
        }
    }
    debug!("Flush loop terminated");
}

/// Validates a parsed document against the catalog.
struct Repair<'a> {
    catalog: &'a Catalog,
    earliest: DateTime<Utc>,
    latest: DateTime<Utc>,
    discarded: Vec<String>,
}

impl<'a> Repair<'a> {
    fn new(catalog: &'a Catalog, now: DateTime<Utc>) -> Self {
        let earliest = Utc
            .with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            catalog,
            earliest,
            latest: now + chrono::Duration::hours(MAX_FUTURE_SKEW_HOURS),
            discarded: Vec::new(),
        }
    }

    fn in_range(&self, at: DateTime<Utc>) -> bool {
        at >= self.earliest && at <= self.latest
    }

    fn timestamp(&mut self, root: &Value, key: &str) -> Option<DateTime<Utc>> {
        let value = root.get(key)?;
        if value.is_null() {
            return None;
        }
        match serde_json::from_value::<DateTime<Utc>>(value.clone()) {
            Ok(at) if self.in_range(at) => Some(at),
            Ok(at) => {
                self.discarded.push(format!("{key}: out-of-range timestamp {at}"));
                None
            }
            Err(e) => {
                self.discarded.push(format!("{key}: {e}"));
                None
            }
        }
    }

    fn apply(&mut self, root: &Value, owner: Option<String>) -> ChecklistState {
        let tasks = self.tasks(root);
        let dedicated_resets = self.dedicated(root);

        ChecklistState {
            tasks,
            last_daily_reset: self.timestamp(root, "lastDailyReset"),
            last_weekly_reset: self.timestamp(root, "lastWeeklyReset"),
            dedicated_resets,
            last_save_time: self.timestamp(root, "lastSaveTime"),
            owner,
        }
    }

    fn tasks(&mut self, root: &Value) -> Vec<Task> {
        let entries = match root.get("tasks") {
            Some(Value::Array(entries)) => entries.as_slice(),
            Some(_) => {
                self.discarded.push("tasks: not an array".into());
                &[]
            }
            None => &[],
        };
        if entries.len() > MAX_TASKS {
            self.discarded
                .push(format!("tasks: {} entries beyond the {MAX_TASKS} limit", entries.len() - MAX_TASKS));
        }

        let catalog = self.catalog;
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for (index, entry) in entries.iter().take(MAX_TASKS).enumerate() {
            let mut task: Task = match serde_json::from_value(entry.clone()) {
                Ok(task) => task,
                Err(e) => {
                    self.discarded.push(format!("tasks[{index}]: {e}"));
                    continue;
                }
            };
            let Some(def) = catalog.get(&task.id) else {
                self.discarded.push(format!("tasks[{index}]: unknown task id '{}'", task.id));
                continue;
            };
            if !seen.insert(task.id.clone()) {
                self.discarded.push(format!("tasks[{index}]: duplicate task id '{}'", task.id));
                continue;
            }
            if task.category != def.category {
                self.discarded.push(format!(
                    "tasks[{index}]: category '{}' corrected to '{}'",
                    task.category, def.category
                ));
                task.category = def.category;
            }
            if let Some(at) = task.completed_at {
                if !self.in_range(at) {
                    self.discarded
                        .push(format!("tasks[{index}]: out-of-range completedAt {at}"));
                    task.completed_at = None;
                }
            }
            tasks.push(task);
        }

        for def in catalog.definitions() {
            if !seen.contains(&def.id) {
                debug!(task_id = %def.id, "Catalog task missing from document, added with defaults");
                tasks.push(def.to_task());
            }
        }

        tasks.sort_by_key(|t| t.sort_order);
        tasks
    }

    fn dedicated(&mut self, root: &Value) -> BTreeMap<String, DateTime<Utc>> {
        let mut resets = BTreeMap::new();
        let Some(Value::Object(map)) = root.get("dedicatedResetTimestamps") else {
            return resets;
        };

        for (task_id, value) in map {
            let dedicated = self
                .catalog
                .get(task_id)
                .is_some_and(|def| matches!(def.cadence, Cadence::Dedicated(_)));
            if !dedicated {
                self.discarded
                    .push(format!("dedicatedResetTimestamps.{task_id}: no dedicated cadence"));
                continue;
            }
            match serde_json::from_value::<DateTime<Utc>>(value.clone()) {
                Ok(at) if self.in_range(at) => {
                    resets.insert(task_id.clone(), at);
                }
                Ok(at) => self
                    .discarded
                    .push(format!("dedicatedResetTimestamps.{task_id}: out-of-range timestamp {at}")),
                Err(e) => self
                    .discarded
                    .push(format!("dedicatedResetTimestamps.{task_id}: {e}")),
            }
        }
        resets
    }
}
