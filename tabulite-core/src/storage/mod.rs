//! Columnar batch storage
//!
//! Batches are appended in row-id order. Every stored batch goes into
//! a bounded insertion-ordered cache of decoded batches; when the
//! backend is durable the encoded batch is also spilled to a
//! dataset-keyed directory so evicted batches can be read back. In
//! memory-only mode an evicted batch is gone, and asking for it is a
//! non-recoverable error for that query.

pub mod batch;
pub mod row_index;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Error;
use crate::platform::StorageBackend;
use crate::types::Row;
use crate::Result;

pub use batch::{decode_batch, encode_batch, BatchStats, ColumnData, RowBatch};

/// Position metadata for one stored batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchMeta {
    /// First row id in the batch
    pub row_start: u32,
    /// Rows in the batch
    pub row_count: u32,
    /// Cumulative ingestion counters at store time
    pub stats: BatchStats,
}

/// Batch store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Batches appended over the store's lifetime
    pub batches_stored: u64,
    /// Cache lookups that found a decoded batch
    pub cache_hits: u64,
    /// Cache lookups that had to read the backend
    pub cache_misses: u64,
    /// Encoded bytes written to the backend
    pub spilled_bytes: u64,
}

/// Insertion-ordered cache bounded by entry count
#[derive(Debug)]
struct BatchCache {
    entries: HashMap<usize, Arc<RowBatch>>,
    order: Vec<usize>,
    capacity: usize,
}

impl BatchCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, index: usize) -> Option<Arc<RowBatch>> {
        self.entries.get(&index).cloned()
    }

    fn insert(&mut self, index: usize, batch: Arc<RowBatch>) {
        if self.entries.insert(index, batch).is_none() {
            self.order.push(index);
        }
        while self.order.len() > self.capacity {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[derive(Debug)]
struct StoreState {
    metas: Vec<BatchMeta>,
    cache: BatchCache,
    stats: StoreStats,
}

/// Memory-first, disk-backed store of columnar batches
#[derive(Debug)]
pub struct BatchStore {
    backend: Arc<dyn StorageBackend>,
    dataset_dir: String,
    spill: bool,
    state: RwLock<StoreState>,
}

impl BatchStore {
    /// Create a store for one dataset
    ///
    /// Spill is enabled when the backend is durable; otherwise the
    /// bounded cache is all there is.
    pub fn new(backend: Arc<dyn StorageBackend>, dataset_dir: String, cache_entries: usize) -> Self {
        let spill = backend.is_durable();
        Self {
            backend,
            dataset_dir,
            spill,
            state: RwLock::new(StoreState {
                metas: Vec::new(),
                cache: BatchCache::new(cache_entries),
                stats: StoreStats::default(),
            }),
        }
    }

    fn batch_file_name(index: usize) -> String {
        format!("batch-{:06}.bin", index)
    }

    /// Total rows across all stored batches
    pub fn total_rows(&self) -> u64 {
        let state = self.state.read();
        state
            .metas
            .last()
            .map(|meta| meta.row_start as u64 + meta.row_count as u64)
            .unwrap_or(0)
    }

    /// Number of stored batches
    pub fn batch_count(&self) -> usize {
        self.state.read().metas.len()
    }

    /// Metadata snapshot in batch order
    pub fn metas(&self) -> Vec<BatchMeta> {
        self.state.read().metas.clone()
    }

    /// Store counters
    pub fn stats(&self) -> StoreStats {
        self.state.read().stats
    }

    /// Append a batch
    ///
    /// Batches must arrive in row-id order: the first row id must
    /// equal the store's current total row count.
    pub async fn store_batch(&self, batch: RowBatch) -> Result<BatchMeta> {
        self.store_batch_arc(Arc::new(batch)).await
    }

    /// Append an already-shared batch, keeping the caller's `Arc` as
    /// the cached copy
    pub async fn store_batch_arc(&self, batch: Arc<RowBatch>) -> Result<BatchMeta> {
        batch.validate()?;
        let expected_start = self.total_rows();
        if batch.row_start() as u64 != expected_start {
            return Err(Error::internal(format!(
                "batch starts at row {}, store expects {}",
                batch.row_start(),
                expected_start
            )));
        }

        let meta = BatchMeta {
            row_start: batch.row_start(),
            row_count: batch.row_count() as u32,
            stats: batch.stats,
        };
        let index = self.batch_count();

        if self.spill {
            let encoded = encode_batch(&batch)?;
            self.backend
                .write_atomic(&self.dataset_dir, &Self::batch_file_name(index), &encoded)
                .await?;
            let mut state = self.state.write();
            state.stats.spilled_bytes += encoded.len() as u64;
        }

        let mut state = self.state.write();
        state.metas.push(meta);
        state.stats.batches_stored += 1;
        state.cache.insert(index, batch);
        Ok(meta)
    }

    /// Load one batch, from cache or from the backend
    pub async fn load_batch(&self, index: usize) -> Result<Arc<RowBatch>> {
        let meta = {
            let mut state = self.state.write();
            let meta = *state
                .metas
                .get(index)
                .ok_or_else(|| Error::internal(format!("no batch at index {}", index)))?;
            if let Some(batch) = state.cache.get(index) {
                state.stats.cache_hits += 1;
                return Ok(batch);
            }
            state.stats.cache_misses += 1;
            meta
        };

        if !self.spill {
            return Err(Error::corruption(format!(
                "batch {} was evicted and no durable store is available",
                index
            )));
        }

        let bytes = self
            .backend
            .read(&self.dataset_dir, &Self::batch_file_name(index))
            .await?
            .ok_or_else(|| Error::corruption(format!("spilled batch {} is missing", index)))?;
        let batch = Arc::new(decode_batch(&bytes, meta.stats)?);

        let mut state = self.state.write();
        state.cache.insert(index, batch.clone());
        Ok(batch)
    }

    /// Index of the batch containing a row id
    pub fn batch_index_for_row(&self, row_id: u32) -> Option<usize> {
        let state = self.state.read();
        let metas = &state.metas;
        let mut lo = 0usize;
        let mut hi = metas.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let meta = &metas[mid];
            if row_id < meta.row_start {
                hi = mid;
            } else if row_id >= meta.row_start + meta.row_count {
                lo = mid + 1;
            } else {
                return Some(mid);
            }
        }
        None
    }

    /// Materialize rows for the given ids, in the caller's order
    pub async fn materialize_rows(&self, ids: &[u32]) -> Result<Vec<Row>> {
        // Bin ids by batch so each needed batch is loaded once
        let mut by_batch: HashMap<usize, Vec<u32>> = HashMap::new();
        for &id in ids {
            let index = self.batch_index_for_row(id).ok_or_else(|| {
                Error::invalid_input(format!("row id {} is out of range", id))
            })?;
            by_batch.entry(index).or_default().push(id);
        }

        let mut materialized: HashMap<u32, Row> = HashMap::with_capacity(ids.len());
        let mut batch_indexes: Vec<usize> = by_batch.keys().copied().collect();
        batch_indexes.sort_unstable();
        for index in batch_indexes {
            let batch = self.load_batch(index).await?;
            let row_start = batch.row_start();
            for &id in &by_batch[&index] {
                let local = (id - row_start) as usize;
                materialized.insert(id, batch.row_at(local));
            }
        }

        Ok(ids
            .iter()
            .map(|id| materialized[id].clone())
            .collect())
    }

    /// Materialize a contiguous window of the dense row-id space
    pub async fn materialize_range(&self, offset: u64, limit: usize) -> Result<Vec<Row>> {
        let total = self.total_rows();
        if offset >= total {
            return Ok(Vec::new());
        }
        let end = (offset + limit as u64).min(total);
        let ids: Vec<u32> = (offset as u32..end as u32).collect();
        self.materialize_rows(&ids).await
    }

    /// Drop everything, cache and spilled files included
    pub async fn clear(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            state.metas.clear();
            state.cache.clear();
        }
        if self.spill {
            self.backend.remove_dir(&self.dataset_dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{DiskBackend, MemoryBackend};
    use crate::types::{ColumnType, Value};
    use tempfile::TempDir;

    fn batch_of(row_start: u32, names: &[&str]) -> RowBatch {
        let raw: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        RowBatch {
            row_ids: (row_start..row_start + names.len() as u32).collect(),
            columns: vec![(
                "name".to_string(),
                ColumnData::from_raw(ColumnType::Text, &raw),
            )],
            stats: BatchStats::default(),
        }
    }

    async fn disk_store(temp: &TempDir, cache_entries: usize) -> BatchStore {
        let backend = DiskBackend::open(temp.path().to_path_buf()).await.unwrap();
        BatchStore::new(Arc::new(backend), "ds-test".to_string(), cache_entries)
    }

    #[tokio::test]
    async fn test_append_and_total_rows() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 4).await;

        store.store_batch(batch_of(0, &["a", "b"])).await.unwrap();
        store.store_batch(batch_of(2, &["c"])).await.unwrap();
        assert_eq!(store.total_rows(), 3);
        assert_eq!(store.batch_count(), 2);

        // out-of-order append is rejected
        let err = store.store_batch(batch_of(5, &["x"])).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_materialize_preserves_caller_order() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 4).await;
        store.store_batch(batch_of(0, &["a", "b", "c"])).await.unwrap();
        store.store_batch(batch_of(3, &["d", "e"])).await.unwrap();

        let rows = store.materialize_rows(&[4, 0, 3, 1]).await.unwrap();
        let ids: Vec<u32> = rows.iter().map(|r| r.row_id).collect();
        assert_eq!(ids, vec![4, 0, 3, 1]);
        assert_eq!(rows[0].get("name"), &Value::Text("e".to_string()));
    }

    #[tokio::test]
    async fn test_eviction_reloads_from_disk() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 1).await;
        store.store_batch(batch_of(0, &["a"])).await.unwrap();
        store.store_batch(batch_of(1, &["b"])).await.unwrap();

        // batch 0 was evicted by the 1-entry cache; it must come back
        // from the spilled file
        let batch = store.load_batch(0).await.unwrap();
        assert_eq!(batch.row_ids, vec![0]);
        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_memory_only_eviction_is_fatal() {
        let store = BatchStore::new(Arc::new(MemoryBackend::new()), "ds".to_string(), 1);
        store.store_batch(batch_of(0, &["a"])).await.unwrap();
        store.store_batch(batch_of(1, &["b"])).await.unwrap();

        let err = store.load_batch(0).await.unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
        // the still-cached batch is fine
        assert!(store.load_batch(1).await.is_ok());
    }

    #[tokio::test]
    async fn test_binary_search_batch_lookup() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 4).await;
        store.store_batch(batch_of(0, &["a", "b"])).await.unwrap();
        store.store_batch(batch_of(2, &["c", "d", "e"])).await.unwrap();

        assert_eq!(store.batch_index_for_row(0), Some(0));
        assert_eq!(store.batch_index_for_row(1), Some(0));
        assert_eq!(store.batch_index_for_row(2), Some(1));
        assert_eq!(store.batch_index_for_row(4), Some(1));
        assert_eq!(store.batch_index_for_row(5), None);
    }

    #[tokio::test]
    async fn test_materialize_range_clamps() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 4).await;
        store.store_batch(batch_of(0, &["a", "b", "c"])).await.unwrap();

        let rows = store.materialize_range(1, 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.materialize_range(7, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_spilled_files() {
        let temp = TempDir::new().unwrap();
        let store = disk_store(&temp, 4).await;
        store.store_batch(batch_of(0, &["a"])).await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.total_rows(), 0);
        assert!(!temp.path().join("ds-test").exists());
    }
}
