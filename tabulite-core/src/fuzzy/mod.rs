//! Typo-tolerant token index
//!
//! During ingestion every cell is lower-cased, NFC-normalized and
//! split into tokens; each column keeps a frequency inventory under
//! two joint budgets (token count and approximate bytes). Finalizing
//! assigns dense token ids by descending frequency and builds trigram
//! posting lists. Lookup unions the posting lists of the query's
//! trigrams and keeps candidates within a bounded Damerau-Levenshtein
//! distance.

pub mod distance;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::FuzzyConfig;
use crate::parser::RowObserver;
use crate::platform::StorageBackend;
use crate::types::FileFingerprint;
use crate::Result;

pub use distance::bounded_damerau_levenshtein;

/// Snapshot format version
pub const FUZZY_SNAPSHOT_VERSION: u32 = 1;

/// Trigram width
pub const TRIGRAM_SIZE: usize = 3;

/// Backend directory holding fuzzy snapshots
pub const FUZZY_DIR: &str = "fuzzy";

/// Fixed per-token bookkeeping estimate added to the token bytes
const TOKEN_OVERHEAD_BYTES: usize = 16;

/// Lower-case + NFC normalization applied to cells, tokens and queries
pub fn normalize_text(raw: &str) -> String {
    raw.to_lowercase().nfc().collect()
}

/// Split a normalized cell into tokens
///
/// Splits on everything non-alphanumeric, drops tokens shorter than
/// two characters, caps the token count per cell.
pub fn tokenize(normalized: &str, max_tokens: usize) -> impl Iterator<Item = &str> {
    normalized
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .take(max_tokens)
}

/// Trigrams of a token; tokens shorter than three characters are
/// right-padded with spaces
pub fn trigrams(token: &str) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() < TRIGRAM_SIZE {
        let mut padded: String = chars.iter().collect();
        while padded.chars().count() < TRIGRAM_SIZE {
            padded.push(' ');
        }
        return vec![padded];
    }
    chars
        .windows(TRIGRAM_SIZE)
        .map(|w| w.iter().collect())
        .collect()
}

/// One token in a finalized column inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    /// Dense id, ordered by descending frequency
    pub id: u32,
    /// The token text
    pub token: String,
    /// Occurrences observed during the build
    pub frequency: u32,
}

/// Finalized per-column index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzyColumn {
    /// Column name
    pub key: String,
    /// Whether the budgets forced tokens to be dropped
    pub truncated: bool,
    /// Token inventory in id order
    pub tokens: Vec<TokenEntry>,
    /// Posting lists: trigram -> sorted token ids
    pub trigram_index: HashMap<String, Vec<u32>>,
}

/// A near-match returned by [`FuzzyIndex::lookup`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    /// Suggested token
    pub token: String,
    /// Edit distance from the query
    pub distance: u32,
    /// Token frequency in the column
    pub frequency: u32,
}

/// Finalized fuzzy index, also the persisted snapshot payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzyIndex {
    /// Snapshot format version
    pub version: u32,
    /// Snapshot creation time, epoch milliseconds
    pub created_at: i64,
    /// Rows observed during the build
    pub row_count: u64,
    /// Bytes parsed when the build finished
    pub bytes_parsed: u64,
    /// Per-column token budget in force during the build
    pub token_limit: usize,
    /// Trigram width
    pub trigram_size: usize,
    /// Source file identity
    pub fingerprint: FileFingerprint,
    /// Per-column indexes
    pub columns: Vec<FuzzyColumn>,
}

impl FuzzyIndex {
    /// Whether a cached snapshot may serve a file about to be loaded
    pub fn is_reusable_for(&self, fingerprint: &FileFingerprint) -> bool {
        self.fingerprint == *fingerprint && self.bytes_parsed == fingerprint.file_size
    }

    fn column(&self, key: &str) -> Option<&FuzzyColumn> {
        self.columns.iter().find(|c| c.key == key)
    }

    /// Tokens of a column within `max_distance` of the query
    ///
    /// Results are sorted by distance, then descending frequency, and
    /// capped at `limit`.
    pub fn lookup(
        &self,
        column_key: &str,
        query: &str,
        max_distance: u32,
        limit: usize,
    ) -> Vec<Suggestion> {
        let Some(column) = self.column(column_key) else {
            return Vec::new();
        };
        let needle = normalize_text(query.trim());
        if needle.is_empty() {
            return Vec::new();
        }

        let mut candidates: HashSet<u32> = HashSet::new();
        for trigram in trigrams(&needle) {
            if let Some(ids) = column.trigram_index.get(&trigram) {
                candidates.extend(ids.iter().copied());
            }
        }

        let mut suggestions: Vec<Suggestion> = candidates
            .into_iter()
            .filter_map(|id| {
                let entry = &column.tokens[id as usize];
                bounded_damerau_levenshtein(&needle, &entry.token, max_distance).map(|distance| {
                    Suggestion {
                        token: entry.token.clone(),
                        distance,
                        frequency: entry.frequency,
                    }
                })
            })
            .collect();

        suggestions.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then(b.frequency.cmp(&a.frequency))
                .then(a.token.cmp(&b.token))
        });
        suggestions.truncate(limit);
        suggestions
    }
}

#[derive(Debug)]
struct ColumnTokens {
    key: String,
    tokens: HashMap<String, u32>,
    approximate_bytes: usize,
    truncated: bool,
}

impl ColumnTokens {
    fn new(key: String) -> Self {
        Self {
            key,
            tokens: HashMap::new(),
            approximate_bytes: 0,
            truncated: false,
        }
    }

    fn observe(&mut self, token: &str) {
        if let Some(frequency) = self.tokens.get_mut(token) {
            *frequency += 1;
        } else {
            self.approximate_bytes += token.len() + TOKEN_OVERHEAD_BYTES;
            self.tokens.insert(token.to_string(), 1);
        }
    }

    /// Keep the `keep` highest-frequency tokens, alphabetical on ties
    fn prune_to(&mut self, keep: usize) {
        if self.tokens.len() <= keep {
            return;
        }
        let mut ordered: Vec<(String, u32)> = self.tokens.drain().collect();
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.truncate(keep);
        self.approximate_bytes = ordered
            .iter()
            .map(|(token, _)| token.len() + TOKEN_OVERHEAD_BYTES)
            .sum();
        self.tokens = ordered.into_iter().collect();
        self.truncated = true;
    }
}

/// Streaming builder fed one row at a time during ingestion
#[derive(Debug)]
pub struct FuzzyIndexBuilder {
    config: FuzzyConfig,
    columns: Vec<ColumnTokens>,
    rows_observed: u64,
}

impl FuzzyIndexBuilder {
    /// Builder for the given header columns
    pub fn new(column_keys: &[String], config: FuzzyConfig) -> Self {
        Self {
            columns: column_keys
                .iter()
                .map(|key| ColumnTokens::new(key.clone()))
                .collect(),
            config,
            rows_observed: 0,
        }
    }

    fn enforce_budgets(&mut self) {
        // count budget, with slack so pruning stays occasional
        let count_budget = self.config.max_tokens_per_column;
        for column in &mut self.columns {
            if column.tokens.len() > count_budget * 2 {
                column.prune_to(count_budget);
            }
        }

        // joint byte budget across all columns
        let total_bytes: usize = self.columns.iter().map(|c| c.approximate_bytes).sum();
        if total_bytes > self.config.max_memory_bytes {
            let share = self.config.max_memory_bytes / self.columns.len().max(1);
            for column in &mut self.columns {
                while column.approximate_bytes > share && !column.tokens.is_empty() {
                    let keep = column.tokens.len() * 3 / 4;
                    column.prune_to(keep.max(1));
                }
            }
        }
    }

    /// Finalize into a searchable, persistable index
    pub fn finalize(mut self, fingerprint: FileFingerprint, bytes_parsed: u64) -> FuzzyIndex {
        let token_limit = self.config.max_tokens_per_column;
        let columns = self
            .columns
            .drain(..)
            .map(|mut column| {
                column.prune_to(token_limit);
                let mut ordered: Vec<(String, u32)> = column.tokens.into_iter().collect();
                ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

                let tokens: Vec<TokenEntry> = ordered
                    .into_iter()
                    .enumerate()
                    .map(|(id, (token, frequency))| TokenEntry {
                        id: id as u32,
                        token,
                        frequency,
                    })
                    .collect();

                let mut trigram_index: HashMap<String, Vec<u32>> = HashMap::new();
                for entry in &tokens {
                    for trigram in trigrams(&entry.token) {
                        // ids are assigned in ascending order, so each
                        // posting list stays sorted
                        trigram_index.entry(trigram).or_default().push(entry.id);
                    }
                }

                FuzzyColumn {
                    key: column.key,
                    truncated: column.truncated,
                    tokens,
                    trigram_index,
                }
            })
            .collect();

        FuzzyIndex {
            version: FUZZY_SNAPSHOT_VERSION,
            created_at: Utc::now().timestamp_millis(),
            row_count: self.rows_observed,
            bytes_parsed,
            token_limit,
            trigram_size: TRIGRAM_SIZE,
            fingerprint,
            columns,
        }
    }
}

impl RowObserver for FuzzyIndexBuilder {
    fn observe_row(&mut self, _row_id: u64, values: &[String]) {
        self.rows_observed += 1;
        let max_tokens = self.config.max_tokens_per_cell;
        for (column, raw) in self.columns.iter_mut().zip(values) {
            if raw.is_empty() {
                continue;
            }
            let normalized = normalize_text(raw);
            for token in tokenize(&normalized, max_tokens) {
                column.observe(token);
            }
        }
        if self.rows_observed % 4096 == 0 {
            self.enforce_budgets();
        }
    }
}

/// Persist a snapshot keyed by the source file
pub async fn persist_snapshot(
    backend: &Arc<dyn StorageBackend>,
    index: &FuzzyIndex,
) -> Result<()> {
    let name = format!("{}.json", index.fingerprint.store_key());
    let payload = serde_json::to_vec(index)?;
    backend.write_atomic(FUZZY_DIR, &name, &payload).await
}

/// Load the cached snapshot for a fingerprint key, if any
pub async fn load_snapshot(
    backend: &Arc<dyn StorageBackend>,
    store_key: &str,
) -> Result<Option<FuzzyIndex>> {
    match backend.read(FUZZY_DIR, &format!("{}.json", store_key)).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Remove the cached snapshot for a fingerprint key
pub async fn clear_snapshot(backend: &Arc<dyn StorageBackend>, store_key: &str) -> Result<()> {
    backend.remove(FUZZY_DIR, &format!("{}.json", store_key)).await
}
