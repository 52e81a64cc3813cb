//! Global substring search
//!
//! Scans batches in row-id order, honoring an optional pre-filter.
//! Cells and the needle are NFC-normalized and case-folded unless the
//! request is case-sensitive. Short needles that miss everywhere get a
//! bounded edit-distance fallback per cell.

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::config::QueryConfig;
use crate::fuzzy::bounded_damerau_levenshtein;
use crate::query::filter::{compile_filter, evaluate_batch};
use crate::query::{FilterContext, FilterNode};
use crate::storage::BatchStore;
use crate::types::ColumnType;
use crate::Result;
use std::collections::HashMap;

/// Edit distance allowed by the short-needle fallback
const FUZZY_SEARCH_DISTANCE: u32 = 2;

/// Global search request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    /// Needle
    pub query: String,
    /// Columns to scan; empty means every column
    #[serde(default)]
    pub columns: Vec<String>,
    /// Optional pre-restricting filter
    #[serde(default)]
    pub filter: Option<FilterNode>,
    /// Match cap; the engine default applies when omitted
    #[serde(default)]
    pub limit: Option<usize>,
    /// Case-sensitive matching (default: off)
    #[serde(default)]
    pub case_sensitive: bool,
}

/// Global search response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchOutcome {
    /// Matching row ids in row order, cut at the limit
    pub rows: Vec<u32>,
    /// Rows in the dataset
    pub total_rows: u64,
    /// Matches returned
    pub matched_rows: u64,
}

fn normalize(text: &str, case_sensitive: bool) -> String {
    let normalized: String = text.trim().nfc().collect();
    if case_sensitive {
        normalized
    } else {
        normalized.to_lowercase()
    }
}

/// Run a search over the store
pub async fn run_search(
    store: &BatchStore,
    ctx: &FilterContext<'_>,
    column_types: &HashMap<String, ColumnType>,
    request: &SearchRequest,
    config: &QueryConfig,
) -> Result<SearchOutcome> {
    let total_rows = store.total_rows();
    let needle = normalize(&request.query, request.case_sensitive);
    let limit = request.limit.unwrap_or(config.search_limit);

    let mut rows = Vec::new();
    if needle.is_empty() || limit == 0 {
        return Ok(SearchOutcome {
            rows,
            total_rows,
            matched_rows: 0,
        });
    }

    let compiled = match &request.filter {
        Some(node) => Some(compile_filter(node, column_types, config)?),
        None => None,
    };
    let try_fuzzy = needle.chars().count() <= config.fuzzy_search_max_needle;

    'batches: for batch_index in 0..store.batch_count() {
        let batch = store.load_batch(batch_index).await?;
        let mask = compiled
            .as_ref()
            .map(|filter| evaluate_batch(filter, &batch, ctx, None, &mut None));

        let columns: Vec<_> = if request.columns.is_empty() {
            batch.columns.iter().map(|(_, data)| data).collect()
        } else {
            request
                .columns
                .iter()
                .filter_map(|name| batch.column(name))
                .collect()
        };

        for i in 0..batch.row_count() {
            if mask.as_ref().is_some_and(|m| m[i] == 0) {
                continue;
            }

            let cells = columns
                .iter()
                .map(|data| normalize(&data.value_at(i).display_string(), request.case_sensitive));

            let mut hit = false;
            let mut seen: Vec<String> = Vec::with_capacity(columns.len());
            for cell in cells {
                if cell.contains(&needle) {
                    hit = true;
                    break;
                }
                seen.push(cell);
            }
            if !hit && try_fuzzy {
                hit = seen.iter().any(|cell| {
                    bounded_damerau_levenshtein(cell, &needle, FUZZY_SEARCH_DISTANCE).is_some()
                });
            }

            if hit {
                rows.push(batch.row_ids[i]);
                if rows.len() >= limit {
                    break 'batches;
                }
            }
        }
    }

    let matched_rows = rows.len() as u64;
    Ok(SearchOutcome {
        rows,
        total_rows,
        matched_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DiskBackend;
    use crate::query::FilterOperator;
    use crate::storage::batch::{BatchStats, ColumnData, RowBatch};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn sample_store(temp: &TempDir) -> (BatchStore, HashMap<String, ColumnType>) {
        let backend = DiskBackend::open(temp.path().to_path_buf()).await.unwrap();
        let store = BatchStore::new(Arc::new(backend), "s".to_string(), 4);
        let names = ["Alice", "Bob", "Carol", "alina"];
        let cities = ["Paris", "London", "Paris", "Oslo"];
        let batch = RowBatch {
            row_ids: vec![0, 1, 2, 3],
            columns: vec![
                (
                    "name".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Text,
                        &names.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    ),
                ),
                (
                    "city".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Text,
                        &cities.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    ),
                ),
            ],
            stats: BatchStats::default(),
        };
        store.store_batch(batch).await.unwrap();
        let types = HashMap::from([
            ("name".to_string(), ColumnType::Text),
            ("city".to_string(), ColumnType::Text),
        ]);
        (store, types)
    }

    fn request(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.to_string(),
            columns: vec![],
            filter: None,
            limit: None,
            case_sensitive: false,
        }
    }

    #[tokio::test]
    async fn test_substring_across_columns() {
        let temp = TempDir::new().unwrap();
        let (store, types) = sample_store(&temp).await;
        let outcome = run_search(
            &store,
            &FilterContext::default(),
            &types,
            &request("ali"),
            &QueryConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.rows, vec![0, 3]);
        assert_eq!(outcome.total_rows, 4);
        assert_eq!(outcome.matched_rows, 2);
    }

    #[tokio::test]
    async fn test_filter_restricts_search() {
        let temp = TempDir::new().unwrap();
        let (store, types) = sample_store(&temp).await;
        let mut req = request("ali");
        req.filter = Some(FilterNode::predicate(
            "city",
            FilterOperator::Eq,
            json!("Paris"),
        ));
        let outcome = run_search(
            &store,
            &FilterContext::default(),
            &types,
            &req,
            &QueryConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.rows, vec![0]);
    }

    #[tokio::test]
    async fn test_short_needle_fuzzy_fallback() {
        let temp = TempDir::new().unwrap();
        let (store, types) = sample_store(&temp).await;
        // "alcie" is not a substring of anything, but it is within
        // distance 2 of "alice"
        let outcome = run_search(
            &store,
            &FilterContext::default(),
            &types,
            &request("alcie"),
            &QueryConfig::default(),
        )
        .await
        .unwrap();
        assert!(outcome.rows.contains(&0));
    }

    #[tokio::test]
    async fn test_limit_stops_the_scan() {
        let temp = TempDir::new().unwrap();
        let (store, types) = sample_store(&temp).await;
        let mut req = request("a");
        req.limit = Some(2);
        let outcome = run_search(
            &store,
            &FilterContext::default(),
            &types,
            &req,
            &QueryConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_column_scoped_search() {
        let temp = TempDir::new().unwrap();
        let (store, types) = sample_store(&temp).await;
        let mut req = request("paris");
        req.columns = vec!["name".to_string()];
        let outcome = run_search(
            &store,
            &FilterContext::default(),
            &types,
            &req,
            &QueryConfig::default(),
        )
        .await
        .unwrap();
        assert!(outcome.rows.is_empty());
    }
}
