//! Row annotations: labels plus per-row notes and label sets
//!
//! Annotations are keyed by the source file fingerprint and survive
//! reloads of the same file. Snapshots are JSON envelopes written
//! atomically. Saves coalesce through a dirty flag and an
//! in-flight guard; autosave is debounced with a max-interval
//! ceiling so a steady stream of edits still hits disk.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::warn;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::config::AnnotationConfig;
use crate::error::Error;
use crate::platform::StorageBackend;
use crate::Result;

/// Snapshot format version
pub const TAGS_SNAPSHOT_VERSION: u32 = 1;

/// Backend directory holding annotation snapshots
pub const TAGS_DIR: &str = "tags";

/// A user-defined label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    /// Stable label id
    pub id: String,
    /// Display name
    pub name: String,
    /// Display color
    pub color: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time, epoch milliseconds
    pub created_at: i64,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

/// Per-row annotation record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRecord {
    /// Labels attached to the row
    #[serde(default)]
    pub label_ids: HashSet<String>,
    /// Free-text note
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Last update time, epoch milliseconds
    pub updated_at: i64,
}

impl TagRecord {
    /// A record with no labels and no meaningful note is empty and
    /// gets deleted
    pub fn is_empty(&self) -> bool {
        self.label_ids.is_empty()
            && self.note.as_deref().map_or(true, |n| n.trim().is_empty())
    }
}

/// How `tag_rows` combines with existing records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMode {
    /// Overwrite the label set (and note, when given)
    Replace,
    /// Union the label set
    Append,
    /// Subtract the label set
    Remove,
}

/// `tag_rows` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagRowsRequest {
    /// Rows to touch
    pub row_ids: Vec<u32>,
    /// Labels to apply per the mode
    #[serde(default)]
    pub label_ids: Option<Vec<String>>,
    /// Note to set; an empty string clears it
    #[serde(default)]
    pub note: Option<String>,
    /// Combination mode
    pub mode: TagMode,
}

/// How imported annotations combine with existing ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Union labels and per-row records
    Merge,
    /// Drop everything and take the import
    Replace,
}

/// Exported (or loaded) annotation state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagSnapshot {
    /// All labels, sorted by id
    pub labels: Vec<Label>,
    /// Per-row records
    pub tags: HashMap<u32, TagRecord>,
}

/// Persisted envelope
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEnvelope {
    version: u32,
    updated_at: i64,
    payload: SnapshotPayload,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    labels: Vec<Label>,
    // JSON object keys are strings; row ids are stringified
    tags: HashMap<String, TagRecord>,
}

/// Transient persistence status surfaced to callers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStatus {
    /// Unsaved changes exist
    pub dirty: bool,
    /// Last save failure, cleared on the next success
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct AnnotationState {
    labels: HashMap<String, Label>,
    tags: HashMap<u32, TagRecord>,
}

#[derive(Debug, Default)]
struct SaveClock {
    dirty_since: Option<Instant>,
    last_mark: Option<Instant>,
}

/// Label and tag store for one source-file fingerprint
#[derive(Debug)]
pub struct AnnotationStore {
    backend: Arc<dyn StorageBackend>,
    file_name: String,
    config: AnnotationConfig,
    state: RwLock<AnnotationState>,
    dirty: AtomicBool,
    save_in_flight: AtomicBool,
    clock: Mutex<SaveClock>,
    last_error: Mutex<Option<String>>,
}

impl AnnotationStore {
    /// Open the store for a fingerprint key, hydrating any snapshot
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        store_key: &str,
        config: AnnotationConfig,
    ) -> Result<Self> {
        let file_name = format!("tags-{}.json", store_key);
        let mut state = AnnotationState::default();
        if let Some(bytes) = backend.read(TAGS_DIR, &file_name).await? {
            let envelope: SnapshotEnvelope = serde_json::from_slice(&bytes)?;
            if envelope.version != TAGS_SNAPSHOT_VERSION {
                return Err(Error::corruption(format!(
                    "unsupported tags snapshot version {}",
                    envelope.version
                )));
            }
            state.labels = envelope
                .payload
                .labels
                .into_iter()
                .map(|label| (label.id.clone(), label))
                .collect();
            state.tags = envelope
                .payload
                .tags
                .into_iter()
                .filter_map(|(row, record)| row.parse::<u32>().ok().map(|id| (id, record)))
                .collect();
        }
        Ok(Self {
            backend,
            file_name,
            config,
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
            save_in_flight: AtomicBool::new(false),
            clock: Mutex::new(SaveClock::default()),
            last_error: Mutex::new(None),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        let mut clock = self.clock.lock();
        let now = Instant::now();
        clock.last_mark = Some(now);
        if clock.dirty_since.is_none() {
            clock.dirty_since = Some(now);
        }
    }

    /// Current persistence status
    pub fn save_status(&self) -> SaveStatus {
        SaveStatus {
            dirty: self.dirty.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
        }
    }

    /// Create or update a label
    pub fn upsert_label(&self, mut label: Label) {
        let mut state = self.state.write();
        let now = Utc::now().timestamp_millis();
        label.updated_at = now;
        match state.labels.get(&label.id) {
            Some(existing) => label.created_at = existing.created_at,
            None => {
                if label.created_at == 0 {
                    label.created_at = now;
                }
            }
        }
        state.labels.insert(label.id.clone(), label);
        drop(state);
        self.mark_dirty();
    }

    /// Delete a label, cascading through every tag record
    pub fn delete_label(&self, label_id: &str) {
        let mut state = self.state.write();
        state.labels.remove(label_id);
        let now = Utc::now().timestamp_millis();
        state.tags.retain(|_, record| {
            if record.label_ids.remove(label_id) {
                record.updated_at = now;
            }
            !record.is_empty()
        });
        drop(state);
        self.mark_dirty();
    }

    /// Apply labels and/or a note to a set of rows
    pub fn tag_rows(&self, request: &TagRowsRequest) {
        let now = Utc::now().timestamp_millis();
        let labels: Option<HashSet<String>> = request
            .label_ids
            .as_ref()
            .map(|ids| ids.iter().cloned().collect());

        let mut state = self.state.write();
        for &row_id in &request.row_ids {
            let record = state.tags.entry(row_id).or_default();
            match request.mode {
                TagMode::Replace => {
                    if let Some(labels) = &labels {
                        record.label_ids = labels.clone();
                    }
                    if let Some(note) = &request.note {
                        record.note = (!note.trim().is_empty()).then(|| note.clone());
                    }
                }
                TagMode::Append => {
                    if let Some(labels) = &labels {
                        record.label_ids.extend(labels.iter().cloned());
                    }
                    if let Some(note) = &request.note {
                        record.note = (!note.trim().is_empty()).then(|| note.clone());
                    }
                }
                TagMode::Remove => {
                    if let Some(labels) = &labels {
                        record.label_ids.retain(|id| !labels.contains(id));
                    }
                    if request.note.is_some() {
                        record.note = None;
                    }
                }
            }
            record.updated_at = now;
            if record.is_empty() {
                state.tags.remove(&row_id);
            }
        }
        drop(state);
        self.mark_dirty();
    }

    /// Drop the records of the given rows entirely
    pub fn clear_tag(&self, row_ids: &[u32]) {
        let mut state = self.state.write();
        for row_id in row_ids {
            state.tags.remove(row_id);
        }
        drop(state);
        self.mark_dirty();
    }

    /// Snapshot of labels and tags
    pub fn export(&self) -> TagSnapshot {
        let state = self.state.read();
        let mut labels: Vec<Label> = state.labels.values().cloned().collect();
        labels.sort_by(|a, b| a.id.cmp(&b.id));
        TagSnapshot {
            labels,
            tags: state.tags.clone(),
        }
    }

    /// Import a snapshot
    pub fn import(&self, snapshot: TagSnapshot, strategy: MergeStrategy) {
        let mut state = self.state.write();
        match strategy {
            MergeStrategy::Replace => {
                state.labels = snapshot
                    .labels
                    .into_iter()
                    .map(|label| (label.id.clone(), label))
                    .collect();
                state.tags = snapshot
                    .tags
                    .into_iter()
                    .filter(|(_, record)| !record.is_empty())
                    .collect();
            }
            MergeStrategy::Merge => {
                for label in snapshot.labels {
                    state.labels.insert(label.id.clone(), label);
                }
                for (row_id, incoming) in snapshot.tags {
                    let record = state.tags.entry(row_id).or_default();
                    record.label_ids.extend(incoming.label_ids);
                    if incoming.note.is_some() {
                        record.note = incoming.note;
                    }
                    record.updated_at = record.updated_at.max(incoming.updated_at);
                    if record.is_empty() {
                        state.tags.remove(&row_id);
                    }
                }
            }
        }
        drop(state);
        self.mark_dirty();
    }

    /// Per-row records for filter evaluation
    pub fn tags_snapshot(&self) -> HashMap<u32, TagRecord> {
        self.state.read().tags.clone()
    }

    /// Write the snapshot, coalescing with any in-flight save
    ///
    /// A save requested while another is writing re-marks dirty and
    /// returns; the autosave pass picks it up.
    pub async fn persist(&self) -> Result<()> {
        if self.save_in_flight.swap(true, Ordering::SeqCst) {
            self.mark_dirty();
            return Ok(());
        }
        self.dirty.store(false, Ordering::SeqCst);

        let bytes = {
            let snapshot = self.export();
            let envelope = SnapshotEnvelope {
                version: TAGS_SNAPSHOT_VERSION,
                updated_at: Utc::now().timestamp_millis(),
                payload: SnapshotPayload {
                    labels: snapshot.labels,
                    tags: snapshot
                        .tags
                        .into_iter()
                        .map(|(row_id, record)| (row_id.to_string(), record))
                        .collect(),
                },
            };
            serde_json::to_vec(&envelope)
        };

        let result = match bytes {
            Ok(bytes) => self.backend.write_atomic(TAGS_DIR, &self.file_name, &bytes).await,
            Err(e) => Err(Error::from(e)),
        };
        self.save_in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                self.clock.lock().dirty_since = None;
                *self.last_error.lock() = None;
                Ok(())
            }
            Err(e) => {
                // best-effort: re-queue and surface the error string
                self.dirty.store(true, Ordering::SeqCst);
                *self.last_error.lock() = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Save when the debounce or the ceiling says so
    pub async fn autosave_if_due(&self) -> Result<bool> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let due = {
            let clock = self.clock.lock();
            let now = Instant::now();
            let debounce_due = clock
                .last_mark
                .is_some_and(|mark| now.duration_since(mark) >= self.config.autosave_debounce);
            let ceiling_due = clock.dirty_since.is_some_and(|since| {
                now.duration_since(since) >= self.config.autosave_max_interval
            });
            debounce_due || ceiling_due
        };
        if !due {
            return Ok(false);
        }
        self.persist().await?;
        Ok(true)
    }
}

/// Background autosave loop; ends when the store is dropped
pub fn spawn_autosave(store: &Arc<AnnotationStore>) -> tokio::task::JoinHandle<()> {
    let weak: Weak<AnnotationStore> = Arc::downgrade(store);
    let tick = store
        .config
        .autosave_debounce
        .min(store.config.autosave_max_interval)
        .checked_div(4)
        .unwrap_or(Duration::from_secs(1))
        .max(Duration::from_millis(20));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(tick).await;
            let Some(store) = weak.upgrade() else {
                break;
            };
            if let Err(e) = store.autosave_if_due().await {
                warn!("annotation autosave failed, will retry: {}", e);
            }
        }
    })
}
