//! Stable multi-key row sorting
//!
//! Sort keys are extracted once per request into per-column vectors,
//! then a single permutation sort runs over them. Text keys are
//! case- and accent-folded and compared with natural numeric
//! awareness; missing or unparseable keys sort after present ones.
//! Ties fall through subsequent keys and finally to ascending row id,
//! which keeps the permutation stable.

use std::cmp::Ordering;
use std::collections::HashMap;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::storage::BatchStore;
use crate::types::{ColumnType, SortDirection, SortSpec, Value};
use crate::Result;

/// One extracted sort key
#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    /// Missing, unparseable, or non-finite; sorts after everything
    Null,
    /// Boolean key; false before true
    Bool(bool),
    /// Numeric key (numbers and datetime milliseconds), always finite
    Num(f64),
    /// Folded text key
    Text(String),
}

/// Case- and accent-insensitive fold applied to text keys
pub fn fold_text(raw: &str) -> String {
    raw.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Extract the sort key for one cell under its column type
pub fn key_for_value(value: &Value, column_type: ColumnType) -> SortKey {
    match (column_type, value) {
        (ColumnType::Text, Value::Text(s)) => SortKey::Text(fold_text(s)),
        (ColumnType::Number, Value::Number(n)) if n.is_finite() => SortKey::Num(*n),
        (ColumnType::Boolean, Value::Boolean(b)) => SortKey::Bool(*b),
        (ColumnType::Datetime, Value::Datetime(ms)) => SortKey::Num(*ms as f64),
        _ => SortKey::Null,
    }
}

/// Ascending comparison; nulls order last
fn compare_keys(a: &SortKey, b: &SortKey) -> Ordering {
    match (a, b) {
        (SortKey::Null, SortKey::Null) => Ordering::Equal,
        (SortKey::Null, _) => Ordering::Greater,
        (_, SortKey::Null) => Ordering::Less,
        (SortKey::Bool(x), SortKey::Bool(y)) => x.cmp(y),
        (SortKey::Num(x), SortKey::Num(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (SortKey::Text(x), SortKey::Text(y)) => natord::compare(x, y),
        // mixed variants cannot arise from one column; order them
        // deterministically anyway
        (SortKey::Bool(_), _) => Ordering::Less,
        (_, SortKey::Bool(_)) => Ordering::Greater,
        (SortKey::Num(_), _) => Ordering::Less,
        (_, SortKey::Num(_)) => Ordering::Greater,
    }
}

/// Sort a row-id list by the extracted keys
///
/// `key_columns[k]` holds the key of sort spec `k` for every id, in
/// `base_ids` order. Returns the permuted ids.
pub fn sort_row_ids(
    base_ids: &[u32],
    key_columns: &[Vec<SortKey>],
    specs: &[SortSpec],
) -> Vec<u32> {
    let mut order: Vec<usize> = (0..base_ids.len()).collect();
    order.sort_unstable_by(|&i, &j| {
        for (keys, spec) in key_columns.iter().zip(specs) {
            let mut ordering = compare_keys(&keys[i], &keys[j]);
            if spec.direction == SortDirection::Desc {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        base_ids[i].cmp(&base_ids[j])
    });
    order.into_iter().map(|i| base_ids[i]).collect()
}

/// Extract per-spec key vectors for the given ids
///
/// Ids are binned by batch so every needed batch loads exactly once.
pub async fn extract_sort_keys(
    store: &BatchStore,
    ids: &[u32],
    specs: &[SortSpec],
    column_types: &HashMap<String, ColumnType>,
) -> Result<Vec<Vec<SortKey>>> {
    let mut keys: Vec<Vec<SortKey>> = specs
        .iter()
        .map(|_| vec![SortKey::Null; ids.len()])
        .collect();

    let mut by_batch: HashMap<usize, Vec<usize>> = HashMap::new();
    for (pos, &id) in ids.iter().enumerate() {
        if let Some(batch_index) = store.batch_index_for_row(id) {
            by_batch.entry(batch_index).or_default().push(pos);
        }
    }

    let mut batch_indexes: Vec<usize> = by_batch.keys().copied().collect();
    batch_indexes.sort_unstable();
    for batch_index in batch_indexes {
        let batch = store.load_batch(batch_index).await?;
        let row_start = batch.row_start();
        for (k, spec) in specs.iter().enumerate() {
            let Some(column_type) = column_types.get(&spec.column).copied() else {
                continue;
            };
            let Some(data) = batch.column(&spec.column) else {
                continue;
            };
            for &pos in &by_batch[&batch_index] {
                let local = (ids[pos] - row_start) as usize;
                keys[k][pos] = key_for_value(&data.value_at(local), column_type);
            }
        }
    }

    Ok(keys)
}

/// Progressive threshold: only lists longer than twice the visible
/// window are worth a deferred full sort
pub fn progressive_applies(base_len: usize, visible_rows: usize) -> bool {
    base_len > visible_rows.saturating_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_keys(cells: &[&str]) -> Vec<SortKey> {
        cells.iter().map(|s| SortKey::Text(fold_text(s))).collect()
    }

    #[test]
    fn test_fold_text() {
        assert_eq!(fold_text("Crème BRÛLÉE"), "creme brulee");
        assert_eq!(fold_text("Straße"), "straße");
    }

    #[test]
    fn test_natural_numeric_ordering() {
        let ids = vec![0, 1, 2];
        let keys = vec![text_keys(&["item10", "item2", "item1"])];
        let sorted = sort_row_ids(&ids, &keys, &[SortSpec::asc("c")]);
        assert_eq!(sorted, vec![2, 1, 0]);
    }

    #[test]
    fn test_stability_via_row_id_tiebreak() {
        // rows with equal keys keep input order
        let ids = vec![0, 1, 2];
        let keys = vec![vec![SortKey::Num(1.0), SortKey::Num(1.0), SortKey::Num(0.0)]];
        let sorted = sort_row_ids(&ids, &keys, &[SortSpec::asc("s")]);
        assert_eq!(sorted, vec![2, 0, 1]);
    }

    #[test]
    fn test_nulls_sort_last_and_desc_reverses() {
        let ids = vec![0, 1, 2];
        let keys = vec![vec![SortKey::Num(5.0), SortKey::Null, SortKey::Num(1.0)]];
        assert_eq!(sort_row_ids(&ids, &keys, &[SortSpec::asc("n")]), vec![2, 0, 1]);
        // desc negates the whole comparator, nulls first
        assert_eq!(sort_row_ids(&ids, &keys, &[SortSpec::desc("n")]), vec![1, 0, 2]);
    }

    #[test]
    fn test_multi_key_tie_falls_through() {
        let ids = vec![0, 1, 2, 3];
        let keys = vec![
            vec![
                SortKey::Bool(true),
                SortKey::Bool(false),
                SortKey::Bool(true),
                SortKey::Bool(false),
            ],
            vec![
                SortKey::Num(2.0),
                SortKey::Num(9.0),
                SortKey::Num(1.0),
                SortKey::Num(3.0),
            ],
        ];
        let specs = [SortSpec::asc("flag"), SortSpec::desc("n")];
        assert_eq!(sort_row_ids(&ids, &keys, &specs), vec![1, 3, 0, 2]);
    }

    #[test]
    fn test_progressive_threshold() {
        assert!(!progressive_applies(100, 50));
        assert!(!progressive_applies(100, 60));
        assert!(progressive_applies(101, 50));
    }
}
