//! Tabulite Core Engine
//!
//! The data engine behind an interactive explorer for large delimited
//! files. Streams CSV/TSV (optionally gzip-compressed) sources into a
//! columnar batch store with bounded memory and disk spill, infers
//! column types on the fly, and serves paginated, filtered, sorted,
//! grouped and searched views while the file is still loading.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod annotations;
pub mod config;
pub mod error;
pub mod fuzzy;
pub mod parser;
pub mod platform;
pub mod query;
pub mod storage;
pub mod types;

pub use crate::{
    config::{Config, InitOptions},
    error::{Error, ErrorKind, Result},
    types::*,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::annotations::{
    spawn_autosave, AnnotationStore, Label, MergeStrategy, SaveStatus, TagRowsRequest, TagSnapshot,
};
use crate::fuzzy::{FuzzyIndex, FuzzyIndexBuilder};
use crate::parser::{
    is_gzip_name, ByteSource, ColumnInference, DelimitedParser, FileSource, GzipSource,
    ParseOptions, ParseSink, RowObserver, TypeResolution,
};
use crate::platform::Platform;
use crate::query::{
    build_salvage_plan, compile_filter, evaluate_batch, group::run_group_by,
    search::run_search, sort, FilterContext, FilterNode, FuzzyUse, GroupByRequest, GroupOutcome,
    SearchOutcome, SearchRequest,
};
use crate::storage::row_index::{
    load_row_index as read_row_index, CheckpointEntry, RowIndexSummary, RowIndexWriter,
    RowOffsetIndex,
};
use crate::storage::{BatchStore, RowBatch, StoreStats};

/// Ingestion callbacks delivered in strict order: one `on_start`,
/// then batches with progress, then exactly one completion or error
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// The normalized header of the new dataset
    async fn on_start(&self, _columns: &[String]) {}

    /// A batch was parsed and stored
    async fn on_batch(&self, _batch: &RowBatch) {}

    /// Cumulative ingestion counters
    async fn on_progress(&self, _progress: &LoadProgress) {}

    /// The load finished
    async fn on_complete(&self, _summary: &LoadSummary) {}

    /// The load failed (not called for reload pre-emption)
    async fn on_error(&self, _error: &Error) {}
}

/// Sink that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl IngestSink for NoopSink {}

/// `load_file` request
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Source file path
    pub path: PathBuf,
    /// Explicit delimiter byte; autodetected when unset
    pub delimiter: Option<u8>,
    /// Rows per batch override
    pub batch_size: Option<usize>,
    /// Rows between checkpoints override
    pub checkpoint_interval: Option<u32>,
    /// Source encoding; only UTF-8 is supported
    pub encoding: Option<String>,
    /// MIME hint; `application/gzip` forces decompression
    pub mime_type: Option<String>,
}

impl LoadRequest {
    /// Request with defaults for everything but the path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: None,
            batch_size: None,
            checkpoint_interval: None,
            encoding: None,
            mime_type: None,
        }
    }
}

/// Cumulative counters reported after every stored batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadProgress {
    /// Data rows parsed so far
    pub rows_parsed: u64,
    /// Bytes consumed from the (decompressed) source
    pub bytes_parsed: u64,
    /// Batches stored so far
    pub batches_stored: u64,
}

/// Load completion summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    /// Normalized header
    pub columns: Vec<String>,
    /// Resolved column types
    pub column_types: HashMap<String, ColumnType>,
    /// Total data rows
    pub total_rows: u64,
    /// Total bytes parsed
    pub bytes_parsed: u64,
    /// Whether a cached fuzzy snapshot was reused
    pub fuzzy_reused: bool,
}

/// Paginated row window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowPage {
    /// Materialized rows
    pub rows: Vec<Row>,
    /// Rows in the dataset
    pub total_rows: u64,
    /// Rows passing the active filter
    pub matched_rows: u64,
}

/// `apply_filter` request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFilterRequest {
    /// Predicate tree; `None` clears the filter
    pub expression: Option<FilterNode>,
    /// First row of the returned window
    #[serde(default)]
    pub offset: Option<u64>,
    /// Window size
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `apply_filter` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterOutcome {
    /// The requested window of matching rows
    pub rows: Vec<Row>,
    /// Rows in the dataset
    pub total_rows: u64,
    /// Rows matching the filter
    pub matched_rows: u64,
    /// The expression now in force
    pub expression: Option<FilterNode>,
    /// Fuzzy salvage metadata, when the salvage pass fired
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuzzy_used: Option<Vec<FuzzyUse>>,
    /// Per-leaf match counts, in tree order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate_match_counts: Option<Vec<u64>>,
}

/// `apply_sorts` request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySortsRequest {
    /// Sort keys, outermost first; empty clears sorting
    pub sorts: Vec<SortSpec>,
    /// First row of the returned window
    #[serde(default)]
    pub offset: Option<u64>,
    /// Window size
    #[serde(default)]
    pub limit: Option<usize>,
    /// Sort the visible window first, finish in the background
    #[serde(default)]
    pub progressive: bool,
    /// Visible window size for progressive mode
    #[serde(default)]
    pub visible_rows: Option<usize>,
}

/// `apply_sorts` response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SortOutcome {
    /// The requested window in sorted order
    pub rows: Vec<Row>,
    /// Rows in the dataset
    pub total_rows: u64,
    /// Rows in the sorted set
    pub matched_rows: u64,
    /// Sorts now in force
    pub sorts: Vec<SortSpec>,
    /// False while a progressive sort is still completing
    pub sort_complete: bool,
    /// Ids actually sorted so far
    pub sorted_row_count: u64,
}

/// Schema panel summary of the loaded dataset
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    /// Source file identity
    pub fingerprint: FileFingerprint,
    /// Header columns
    pub columns: Vec<String>,
    /// Resolved types
    pub column_types: HashMap<String, ColumnType>,
    /// Type resolutions with their confidence, in header order
    pub column_resolutions: Vec<TypeResolution>,
    /// Per-column inference state, in header order
    pub column_inference: Vec<ColumnInference>,
    /// Rows stored so far
    pub total_rows: u64,
    /// Bytes parsed so far
    pub bytes_parsed: u64,
    /// Whether ingestion has finished
    pub eof: bool,
    /// Filter currently in force
    pub filter_expression: Option<FilterNode>,
    /// Sorts currently in force
    pub sorts: Vec<SortSpec>,
}

/// Aggregate engine statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Current dataset counters, when one is loaded
    pub dataset: Option<DatasetStats>,
    /// Annotation store counters, when one is live
    pub annotations: Option<AnnotationStats>,
}

/// Dataset-level counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStats {
    /// Rows stored
    pub total_rows: u64,
    /// Bytes parsed
    pub bytes_parsed: u64,
    /// Ingestion finished
    pub eof: bool,
    /// Batch store counters
    pub store: StoreStats,
    /// Tokens across fuzzy index columns
    pub fuzzy_tokens: u64,
    /// Whether any fuzzy column was truncated by its budgets
    pub fuzzy_truncated: bool,
}

/// Annotation store counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationStats {
    /// Labels defined
    pub labels: usize,
    /// Rows carrying a record
    pub tagged_rows: usize,
    /// Persistence status
    pub status: SaveStatus,
}

/// The single active dataset record
struct Dataset {
    generation: u64,
    fingerprint: FileFingerprint,
    store_key: String,
    store: Arc<BatchStore>,
    header: Vec<String>,
    column_types: HashMap<String, ColumnType>,
    column_resolutions: Vec<TypeResolution>,
    column_inference: Vec<ColumnInference>,
    total_rows: u64,
    bytes_parsed: u64,
    eof: bool,
    filter_expression: Option<FilterNode>,
    filter_row_ids: Option<Vec<u32>>,
    sorts: Vec<SortSpec>,
    sorted_row_ids: Option<Vec<u32>>,
    fuzzy: Option<Arc<FuzzyIndex>>,
}

impl Dataset {
    /// The id list queries page over: sorted permutation if present,
    /// else the filtered set, else the dense range
    fn active_ids(&self) -> Option<&Vec<u32>> {
        self.sorted_row_ids.as_ref().or(self.filter_row_ids.as_ref())
    }

    fn matched_rows(&self) -> u64 {
        self.filter_row_ids
            .as_ref()
            .map(|ids| ids.len() as u64)
            .unwrap_or(self.total_rows)
    }

    fn window(&self, offset: u64, limit: usize) -> Vec<u32> {
        match self.active_ids() {
            Some(ids) => ids
                .iter()
                .skip(offset as usize)
                .take(limit)
                .copied()
                .collect(),
            None => {
                let end = (offset + limit as u64).min(self.total_rows);
                (offset.min(end) as u32..end as u32).collect()
            }
        }
    }
}

struct EngineInner {
    config: parking_lot::RwLock<Config>,
    platform: Platform,
    dataset: RwLock<Option<Dataset>>,
    annotations: RwLock<Option<Arc<AnnotationStore>>>,
    autosave_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    generation: AtomicU64,
}

/// Engine facade: owns the dataset state and serves the request set
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Engine over an explicit platform
    pub fn new(config: Config, platform: Platform) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: parking_lot::RwLock::new(config),
                platform,
                dataset: RwLock::new(None),
                annotations: RwLock::new(None),
                autosave_task: parking_lot::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Engine persisting into a private directory on disk
    pub async fn open(private_dir: &std::path::Path, config: Config) -> Result<Self> {
        let platform = Platform::open(private_dir).await?;
        Ok(Self::new(config, platform))
    }

    /// Engine with memory-only persistence
    pub fn in_memory(config: Config) -> Self {
        Self::new(config, Platform::in_memory())
    }

    /// Idempotently merge `init` options into the configuration
    pub fn init(&self, options: &InitOptions) {
        self.inner.config.write().apply_init(options);
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Config {
        self.inner.config.read().clone()
    }

    /// Load a delimited file, replacing any current dataset
    ///
    /// A load in progress is pre-empted: it observes the new
    /// generation at its next batch boundary and stops with
    /// `CancelledByReload`.
    pub async fn load_file(
        &self,
        request: LoadRequest,
        sink: Arc<dyn IngestSink>,
    ) -> Result<LoadSummary> {
        let inner = &self.inner;
        if let Some(encoding) = request.encoding.as_deref() {
            if !encoding.eq_ignore_ascii_case("utf-8") {
                let e = Error::unsupported(format!("encoding {} (only utf-8)", encoding));
                sink.on_error(&e).await;
                return Err(e);
            }
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let config = self.config();

        // persist outstanding annotations before tearing anything down
        if let Some(previous) = inner.annotations.write().await.take() {
            if previous.save_status().dirty {
                if let Err(e) = previous.persist().await {
                    warn!("could not persist annotations before reload: {}", e);
                }
            }
        }
        if let Some(task) = inner.autosave_task.lock().take() {
            task.abort();
        }

        let fingerprint = match inner.platform.fingerprint(&request.path).await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                sink.on_error(&e).await;
                return Err(e);
            }
        };
        let store_key = fingerprint.store_key();
        let backend = inner.platform.backend().clone();

        // dataset-keyed stores
        let store = Arc::new(BatchStore::new(
            backend.clone(),
            format!("batches-{}", store_key),
            config.storage.cache_entries,
        ));
        store.clear().await?;

        // reuse the cached fuzzy snapshot only for a byte-identical file
        let cached_fuzzy = match fuzzy::load_snapshot(&backend, &store_key).await {
            Ok(Some(snapshot)) if snapshot.is_reusable_for(&fingerprint) => {
                Some(Arc::new(snapshot))
            }
            Ok(_) => None,
            Err(e) => {
                warn!("ignoring unreadable fuzzy snapshot: {}", e);
                None
            }
        };
        let fuzzy_reused = cached_fuzzy.is_some();

        // hydrate annotations for this fingerprint
        let annotation_store = Arc::new(
            AnnotationStore::open(backend.clone(), &store_key, config.annotations.clone()).await?,
        );
        *inner.annotations.write().await = Some(annotation_store.clone());
        *inner.autosave_task.lock() = Some(spawn_autosave(&annotation_store));

        {
            let mut guard = inner.dataset.write().await;
            if let Some(old) = guard.take() {
                if let Err(e) = old.store.clear().await {
                    warn!("could not clear previous dataset spill: {}", e);
                }
            }
            *guard = Some(Dataset {
                generation,
                fingerprint: fingerprint.clone(),
                store_key: store_key.clone(),
                store: store.clone(),
                header: Vec::new(),
                column_types: HashMap::new(),
                column_resolutions: Vec::new(),
                column_inference: Vec::new(),
                total_rows: 0,
                bytes_parsed: 0,
                eof: false,
                filter_expression: None,
                filter_row_ids: None,
                sorts: Vec::new(),
                sorted_row_ids: None,
                fuzzy: cached_fuzzy,
            });
        }

        // open the source, inserting decompression when announced
        let gzip = is_gzip_name(&fingerprint.file_name)
            || request.mime_type.as_deref() == Some("application/gzip");
        let file = match FileSource::open(&request.path, config.parser.chunk_size).await {
            Ok(file) => file,
            Err(e) => {
                sink.on_error(&e).await;
                return Err(e);
            }
        };
        let mut file_source;
        let mut gzip_source;
        let source: &mut dyn ByteSource = if gzip {
            gzip_source = GzipSource::new(file);
            &mut gzip_source
        } else {
            file_source = file;
            &mut file_source
        };

        let options = ParseOptions::resolve(
            &config.parser,
            request.delimiter,
            request.batch_size,
            request.checkpoint_interval,
        );
        let checkpoint_interval = options.checkpoint_interval;
        let mut parser = DelimitedParser::new(options);

        let fuzzy_builder = Arc::new(parking_lot::Mutex::new(None::<FuzzyIndexBuilder>));
        let mut observer = SharedFuzzyObserver(fuzzy_builder.clone());
        let mut driver = IngestDriver {
            engine: self.inner.clone(),
            generation,
            sink: sink.clone(),
            store: store.clone(),
            row_index: RowIndexWriter::new(backend.clone(), &store_key, checkpoint_interval),
            fuzzy_builder: fuzzy_builder.clone(),
            build_fuzzy: !fuzzy_reused,
            fuzzy_config: config.fuzzy.clone(),
            batches_stored: 0,
            slow_threshold: config.query.slow_batch_threshold,
            debug_logging: config.query.debug_logging,
        };

        let run = parser.run(source, &mut driver, Some(&mut observer)).await;
        let summary = match run {
            Ok(summary) => summary,
            Err(e) => {
                driver.row_index.abort();
                if !matches!(e, Error::CancelledByReload(_)) {
                    sink.on_error(&e).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = driver
            .row_index
            .finalize(RowIndexSummary {
                row_count: summary.rows_parsed,
                bytes_parsed: summary.bytes_parsed,
            })
            .await
        {
            sink.on_error(&e).await;
            return Err(e);
        }

        // finalize and persist the fuzzy index; persistence is
        // best-effort
        let built_fuzzy = fuzzy_builder
            .lock()
            .take()
            .map(|builder| Arc::new(builder.finalize(fingerprint.clone(), summary.bytes_parsed)));
        if let Some(index) = &built_fuzzy {
            if let Err(e) = fuzzy::persist_snapshot(&backend, index).await {
                warn!("could not persist fuzzy snapshot: {}", e);
            }
        }

        let column_types: HashMap<String, ColumnType> = summary
            .columns
            .iter()
            .zip(&summary.column_types)
            .map(|(name, resolution)| (name.clone(), resolution.column_type))
            .collect();

        {
            let mut guard = inner.dataset.write().await;
            if let Some(ds) = guard.as_mut() {
                if ds.generation == generation {
                    ds.header = summary.columns.clone();
                    ds.column_types = column_types.clone();
                    ds.column_resolutions = summary.column_types.clone();
                    ds.column_inference = parser.inference().to_vec();
                    ds.total_rows = store.total_rows();
                    ds.bytes_parsed = summary.bytes_parsed;
                    ds.eof = true;
                    if let Some(index) = built_fuzzy {
                        ds.fuzzy = Some(index);
                    }
                }
            }
        }

        let load_summary = LoadSummary {
            columns: summary.columns,
            column_types,
            total_rows: store.total_rows(),
            bytes_parsed: summary.bytes_parsed,
            fuzzy_reused,
        };
        sink.on_complete(&load_summary).await;
        Ok(load_summary)
    }

    /// Fetch a window of the active view
    pub async fn fetch_rows(&self, offset: u64, limit: usize) -> Result<RowPage> {
        let guard = self.inner.dataset.read().await;
        let Some(ds) = guard.as_ref() else {
            return Ok(RowPage {
                rows: Vec::new(),
                total_rows: 0,
                matched_rows: 0,
            });
        };
        let ids = ds.window(offset, limit);
        let store = ds.store.clone();
        let total_rows = ds.total_rows;
        let matched_rows = ds.matched_rows();
        drop(guard);

        Ok(RowPage {
            rows: store.materialize_rows(&ids).await?,
            total_rows,
            matched_rows,
        })
    }

    /// Materialize specific rows in the caller's order
    pub async fn fetch_rows_by_ids(&self, ids: &[u32]) -> Result<Vec<Row>> {
        let guard = self.inner.dataset.read().await;
        let Some(ds) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        let store = ds.store.clone();
        drop(guard);
        store.materialize_rows(ids).await
    }

    /// Apply (or clear) the dataset filter and return the first window
    pub async fn apply_filter(&self, request: ApplyFilterRequest) -> Result<FilterOutcome> {
        let config = self.config();
        let limit = request.limit.unwrap_or(config.query.default_page_size);
        let offset = request.offset.unwrap_or(0);

        let mut guard = self.inner.dataset.write().await;
        let Some(ds) = guard.as_mut() else {
            return Ok(FilterOutcome {
                rows: Vec::new(),
                total_rows: 0,
                matched_rows: 0,
                expression: request.expression,
                fuzzy_used: None,
                predicate_match_counts: None,
            });
        };

        let Some(expression) = request.expression else {
            ds.filter_expression = None;
            ds.filter_row_ids = None;
            ds.sorted_row_ids = None;
            let ids = ds.window(offset, limit);
            let store = ds.store.clone();
            let total_rows = ds.total_rows;
            drop(guard);
            return Ok(FilterOutcome {
                rows: store.materialize_rows(&ids).await?,
                total_rows,
                matched_rows: total_rows,
                expression: None,
                fuzzy_used: None,
                predicate_match_counts: None,
            });
        };

        let compiled = compile_filter(&expression, &ds.column_types, &config.query)?;
        let tags = {
            let annotations = self.inner.annotations.read().await;
            annotations.as_ref().map(|store| store.tags_snapshot())
        };
        let fuzzy = ds.fuzzy.clone();
        let ctx = FilterContext {
            tags: tags.as_ref(),
            fuzzy: fuzzy.as_deref(),
        };

        let mut counts = vec![0u64; compiled.leaf_count];
        let mut matched = Vec::new();
        for batch_index in 0..ds.store.batch_count() {
            let batch = ds.store.load_batch(batch_index).await?;
            let mut counts_ref = Some(&mut counts);
            let mask = evaluate_batch(&compiled, &batch, &ctx, None, &mut counts_ref);
            for (i, &pass) in mask.iter().enumerate() {
                if pass != 0 {
                    matched.push(batch.row_ids[i]);
                }
            }
        }

        // fuzzy salvage: a second pass when the exact pass came up
        // empty and a predicate opted in
        let mut fuzzy_used = None;
        if matched.is_empty() && !compiled.fuzzy_leaves().is_empty() {
            let (plan, uses) = build_salvage_plan(
                &compiled,
                &ctx,
                config.fuzzy.max_distance,
                config.fuzzy.max_suggestions,
            );
            if !plan.is_empty() {
                counts.iter_mut().for_each(|c| *c = 0);
                for batch_index in 0..ds.store.batch_count() {
                    let batch = ds.store.load_batch(batch_index).await?;
                    let mut counts_ref = Some(&mut counts);
                    let mask =
                        evaluate_batch(&compiled, &batch, &ctx, Some(&plan), &mut counts_ref);
                    for (i, &pass) in mask.iter().enumerate() {
                        if pass != 0 {
                            matched.push(batch.row_ids[i]);
                        }
                    }
                }
                fuzzy_used = Some(uses);
            }
        }

        let matched_rows = matched.len() as u64;
        ds.filter_expression = Some(expression.clone());
        ds.filter_row_ids = Some(matched);
        ds.sorted_row_ids = None;

        let ids = ds.window(offset, limit);
        let store = ds.store.clone();
        let total_rows = ds.total_rows;
        drop(guard);

        Ok(FilterOutcome {
            rows: store.materialize_rows(&ids).await?,
            total_rows,
            matched_rows,
            expression: Some(expression),
            fuzzy_used,
            predicate_match_counts: Some(counts),
        })
    }

    /// Apply (or clear) the dataset sorts and return the first window
    pub async fn apply_sorts(&self, request: ApplySortsRequest) -> Result<SortOutcome> {
        let config = self.config();
        let limit = request.limit.unwrap_or(config.query.default_page_size);
        let offset = request.offset.unwrap_or(0);

        let mut guard = self.inner.dataset.write().await;
        let Some(ds) = guard.as_mut() else {
            return Ok(SortOutcome {
                rows: Vec::new(),
                total_rows: 0,
                matched_rows: 0,
                sorts: request.sorts,
                sort_complete: true,
                sorted_row_count: 0,
            });
        };

        for spec in &request.sorts {
            if !ds.column_types.contains_key(&spec.column) {
                return Err(Error::invalid_input(format!(
                    "unknown sort column: {}",
                    spec.column
                )));
            }
        }

        if request.sorts.is_empty() {
            ds.sorts = Vec::new();
            ds.sorted_row_ids = None;
        } else {
            let base_ids: Vec<u32> = match &ds.filter_row_ids {
                Some(ids) => ids.clone(),
                None => (0..ds.total_rows as u32).collect(),
            };
            let keys =
                sort::extract_sort_keys(&ds.store, &base_ids, &request.sorts, &ds.column_types)
                    .await?;

            let visible = request.visible_rows.unwrap_or(config.query.default_page_size);
            let progressive =
                request.progressive && sort::progressive_applies(base_ids.len(), visible);

            if progressive {
                // sort the visible head now, finish the rest deferred
                let head_keys: Vec<Vec<sort::SortKey>> = keys
                    .iter()
                    .map(|column| column[..visible].to_vec())
                    .collect();
                let mut partial =
                    sort::sort_row_ids(&base_ids[..visible], &head_keys, &request.sorts);
                partial.extend_from_slice(&base_ids[visible..]);

                ds.sorts = request.sorts.clone();
                ds.sorted_row_ids = Some(partial);

                let engine = self.clone();
                let specs = request.sorts.clone();
                let generation = ds.generation;
                tokio::spawn(async move {
                    let full = sort::sort_row_ids(&base_ids, &keys, &specs);
                    let mut guard = engine.inner.dataset.write().await;
                    if let Some(ds) = guard.as_mut() {
                        // a reload or a newer sort invalidates this result
                        if ds.generation == generation && ds.sorts == specs {
                            ds.sorted_row_ids = Some(full);
                        }
                    }
                });

                let ids = ds.window(offset, limit);
                let store = ds.store.clone();
                let total_rows = ds.total_rows;
                let matched_rows = ds.matched_rows();
                drop(guard);
                return Ok(SortOutcome {
                    rows: store.materialize_rows(&ids).await?,
                    total_rows,
                    matched_rows,
                    sorts: request.sorts,
                    sort_complete: false,
                    sorted_row_count: visible as u64,
                });
            }

            let sorted = sort::sort_row_ids(&base_ids, &keys, &request.sorts);
            ds.sorts = request.sorts.clone();
            ds.sorted_row_ids = Some(sorted);
        }

        let ids = ds.window(offset, limit);
        let store = ds.store.clone();
        let total_rows = ds.total_rows;
        let matched_rows = ds.matched_rows();
        let sorted_row_count = ds
            .sorted_row_ids
            .as_ref()
            .map(|ids| ids.len() as u64)
            .unwrap_or(0);
        drop(guard);

        Ok(SortOutcome {
            rows: store.materialize_rows(&ids).await?,
            total_rows,
            matched_rows,
            sorts: request.sorts,
            sort_complete: true,
            sorted_row_count,
        })
    }

    /// Group the active row set
    pub async fn group_by(&self, request: GroupByRequest) -> Result<GroupOutcome> {
        let config = self.config();
        let guard = self.inner.dataset.read().await;
        let Some(ds) = guard.as_ref() else {
            return Ok(GroupOutcome {
                groups: Vec::new(),
                total_groups: 0,
                total_rows: 0,
            });
        };
        let store = ds.store.clone();
        let types = ds.column_types.clone();
        let active = ds.filter_row_ids.clone();
        drop(guard);

        run_group_by(
            &store,
            active.as_deref(),
            &types,
            &request,
            config.query.fast_group_engine,
        )
        .await
    }

    /// Substring (and short-needle fuzzy) search across columns
    pub async fn global_search(&self, request: SearchRequest) -> Result<SearchOutcome> {
        let config = self.config();
        let guard = self.inner.dataset.read().await;
        let Some(ds) = guard.as_ref() else {
            return Ok(SearchOutcome {
                rows: Vec::new(),
                total_rows: 0,
                matched_rows: 0,
            });
        };
        let store = ds.store.clone();
        let types = ds.column_types.clone();
        let fuzzy = ds.fuzzy.clone();
        drop(guard);

        let tags = {
            let annotations = self.inner.annotations.read().await;
            annotations.as_ref().map(|store| store.tags_snapshot())
        };
        let ctx = FilterContext {
            tags: tags.as_ref(),
            fuzzy: fuzzy.as_deref(),
        };
        run_search(&store, &ctx, &types, &request, &config.query).await
    }

    /// Current dataset summary, when one is loaded
    pub async fn dataset_summary(&self) -> Option<DatasetSummary> {
        let guard = self.inner.dataset.read().await;
        guard.as_ref().map(|ds| DatasetSummary {
            fingerprint: ds.fingerprint.clone(),
            columns: ds.header.clone(),
            column_types: ds.column_types.clone(),
            column_resolutions: ds.column_resolutions.clone(),
            column_inference: ds.column_inference.clone(),
            total_rows: ds.total_rows,
            bytes_parsed: ds.bytes_parsed,
            eof: ds.eof,
            filter_expression: ds.filter_expression.clone(),
            sorts: ds.sorts.clone(),
        })
    }

    /// Aggregate engine statistics
    pub async fn stats(&self) -> EngineStats {
        let dataset = {
            let guard = self.inner.dataset.read().await;
            guard.as_ref().map(|ds| DatasetStats {
                total_rows: ds.total_rows,
                bytes_parsed: ds.bytes_parsed,
                eof: ds.eof,
                store: ds.store.stats(),
                fuzzy_tokens: ds
                    .fuzzy
                    .as_ref()
                    .map(|f| f.columns.iter().map(|c| c.tokens.len() as u64).sum())
                    .unwrap_or(0),
                fuzzy_truncated: ds
                    .fuzzy
                    .as_ref()
                    .is_some_and(|f| f.columns.iter().any(|c| c.truncated)),
            })
        };
        let annotations = {
            let guard = self.inner.annotations.read().await;
            guard.as_ref().map(|store| {
                let snapshot = store.export();
                AnnotationStats {
                    labels: snapshot.labels.len(),
                    tagged_rows: snapshot.tags.len(),
                    status: store.save_status(),
                }
            })
        };
        EngineStats {
            dataset,
            annotations,
        }
    }

    async fn annotation_store(&self) -> Result<Arc<AnnotationStore>> {
        self.inner
            .annotations
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::not_ready("no dataset loaded"))
    }

    /// Current labels and per-row records
    pub async fn load_tags(&self) -> Result<TagSnapshot> {
        match self.inner.annotations.read().await.as_ref() {
            Some(store) => Ok(store.export()),
            None => Ok(TagSnapshot::default()),
        }
    }

    /// Apply labels and/or a note to rows
    pub async fn tag_rows(&self, request: TagRowsRequest) -> Result<()> {
        self.annotation_store().await?.tag_rows(&request);
        Ok(())
    }

    /// Drop the records of the given rows
    pub async fn clear_tag(&self, row_ids: &[u32]) -> Result<()> {
        self.annotation_store().await?.clear_tag(row_ids);
        Ok(())
    }

    /// Create or update a label
    pub async fn update_label(&self, label: Label) -> Result<()> {
        self.annotation_store().await?.upsert_label(label);
        Ok(())
    }

    /// Delete a label, cascading through tag records
    pub async fn delete_label(&self, label_id: &str) -> Result<()> {
        self.annotation_store().await?.delete_label(label_id);
        Ok(())
    }

    /// Export labels and tags
    pub async fn export_tags(&self) -> Result<TagSnapshot> {
        Ok(self.annotation_store().await?.export())
    }

    /// Import labels and tags
    pub async fn import_tags(&self, snapshot: TagSnapshot, strategy: MergeStrategy) -> Result<()> {
        self.annotation_store().await?.import(snapshot, strategy);
        Ok(())
    }

    /// Write the annotation snapshot now
    pub async fn persist_tags(&self) -> Result<()> {
        self.annotation_store().await?.persist().await
    }

    /// The live fuzzy index snapshot, when one exists
    pub async fn fuzzy_index_snapshot(&self) -> Option<Arc<FuzzyIndex>> {
        self.inner
            .dataset
            .read()
            .await
            .as_ref()
            .and_then(|ds| ds.fuzzy.clone())
    }

    /// Persist the live fuzzy index snapshot now
    pub async fn persist_fuzzy_index_snapshot(&self) -> Result<()> {
        let Some(index) = self.fuzzy_index_snapshot().await else {
            return Err(Error::not_ready("no fuzzy index built"));
        };
        fuzzy::persist_snapshot(self.inner.platform.backend(), &index).await
    }

    /// Remove the cached fuzzy snapshot for the current dataset
    pub async fn clear_fuzzy_index_snapshot(&self) -> Result<()> {
        let guard = self.inner.dataset.read().await;
        let Some(ds) = guard.as_ref() else {
            return Err(Error::not_ready("no dataset loaded"));
        };
        let key = ds.store_key.clone();
        drop(guard);
        fuzzy::clear_snapshot(self.inner.platform.backend(), &key).await
    }

    /// Load the row-offset index recorded for a source file
    pub async fn load_row_index(&self, path: &std::path::Path) -> Result<Option<RowOffsetIndex>> {
        let fingerprint = self.inner.platform.fingerprint(path).await?;
        read_row_index(self.inner.platform.backend(), &fingerprint.store_key()).await
    }

    /// Checkpoints serving a row window of a source file
    ///
    /// Returns the nearest preceding checkpoint first, then every
    /// checkpoint strictly inside the window; empty when no index has
    /// been recorded.
    pub async fn seek_rows(
        &self,
        path: &std::path::Path,
        start_row: u32,
        row_count: u32,
    ) -> Result<Vec<CheckpointEntry>> {
        Ok(self
            .load_row_index(path)
            .await?
            .map(|index| index.seek(start_row, row_count))
            .unwrap_or_default())
    }
}

/// Observer adapter feeding the shared fuzzy builder per row
struct SharedFuzzyObserver(Arc<parking_lot::Mutex<Option<FuzzyIndexBuilder>>>);

impl RowObserver for SharedFuzzyObserver {
    fn observe_row(&mut self, row_id: u64, values: &[String]) {
        if let Some(builder) = self.0.lock().as_mut() {
            builder.observe_row(row_id, values);
        }
    }
}

/// ParseSink wiring the parser into the store, row index, fuzzy
/// builder and the caller's ingestion callbacks
struct IngestDriver {
    engine: Arc<EngineInner>,
    generation: u64,
    sink: Arc<dyn IngestSink>,
    store: Arc<BatchStore>,
    row_index: RowIndexWriter,
    fuzzy_builder: Arc<parking_lot::Mutex<Option<FuzzyIndexBuilder>>>,
    build_fuzzy: bool,
    fuzzy_config: config::FuzzyConfig,
    batches_stored: u64,
    slow_threshold: std::time::Duration,
    debug_logging: bool,
}

#[async_trait]
impl ParseSink for IngestDriver {
    async fn on_header(&mut self, columns: &[String]) -> Result<()> {
        if self.build_fuzzy {
            *self.fuzzy_builder.lock() = Some(FuzzyIndexBuilder::new(
                columns,
                self.fuzzy_config.clone(),
            ));
        }
        {
            let mut guard = self.engine.dataset.write().await;
            if let Some(ds) = guard.as_mut() {
                if ds.generation == self.generation {
                    ds.header = columns.to_vec();
                }
            }
        }
        self.sink.on_start(columns).await;
        Ok(())
    }

    async fn on_batch(&mut self, batch: RowBatch, inference: &[ColumnInference]) -> Result<()> {
        if self.engine.generation.load(Ordering::SeqCst) != self.generation {
            return Err(Error::cancelled("a newer load pre-empted this ingestion"));
        }

        let started = Instant::now();
        let stats = batch.stats;
        let batch = Arc::new(batch);
        self.store.store_batch_arc(batch.clone()).await?;
        self.batches_stored += 1;

        {
            let mut guard = self.engine.dataset.write().await;
            if let Some(ds) = guard.as_mut() {
                if ds.generation == self.generation {
                    ds.total_rows = self.store.total_rows();
                    ds.bytes_parsed = stats.bytes_parsed;
                    ds.eof = stats.eof;
                    if ds.column_types.is_empty() {
                        ds.column_types = batch.column_types();
                    }
                    ds.column_inference = inference.to_vec();
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.slow_threshold {
            warn!(
                "slow batch: {} rows stored in {:?}",
                batch.row_count(),
                elapsed
            );
        } else if self.debug_logging {
            debug!("stored batch of {} rows in {:?}", batch.row_count(), elapsed);
        }

        self.sink.on_batch(&batch).await;
        self.sink
            .on_progress(&LoadProgress {
                rows_parsed: stats.rows_parsed,
                bytes_parsed: stats.bytes_parsed,
                batches_stored: self.batches_stored,
            })
            .await;
        Ok(())
    }

    async fn on_checkpoint(&mut self, row_index: u64, byte_offset: u64) -> Result<()> {
        self.row_index.record(row_index, byte_offset);
        Ok(())
    }
}
