//! Multi-column group-by with a fixed aggregate set
//!
//! Group keys are tuples of raw cell values encoded canonically as
//! `type:value` segments joined by `|`, so a number `1` and a string
//! `"1"` never land in the same group. Groups keep first-encounter
//! order; pagination slices that order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::storage::BatchStore;
use crate::types::{ColumnType, Value};
use crate::Result;

/// Aggregate operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggOperator {
    /// Row count, or non-null count when a column is given
    Count,
    /// Sum of finite numbers
    Sum,
    /// Type-aware minimum
    Min,
    /// Type-aware maximum
    Max,
    /// Mean of finite numbers
    Avg,
}

impl AggOperator {
    fn name(&self) -> &'static str {
        match self {
            AggOperator::Count => "count",
            AggOperator::Sum => "sum",
            AggOperator::Min => "min",
            AggOperator::Max => "max",
            AggOperator::Avg => "avg",
        }
    }
}

/// One requested aggregation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Operator
    pub operator: AggOperator,
    /// Source column; `count` may omit it
    #[serde(default)]
    pub column: Option<String>,
    /// Output name; defaulted when omitted
    #[serde(default)]
    pub alias: Option<String>,
}

impl AggregationSpec {
    /// The output alias: `count` without a column is `"count"`,
    /// otherwise `"<operator>(<column|*>)"`
    pub fn resolved_alias(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match (&self.operator, &self.column) {
            (AggOperator::Count, None) => "count".to_string(),
            (op, column) => format!(
                "{}({})",
                op.name(),
                column.as_deref().unwrap_or("*")
            ),
        }
    }
}

/// Group-by columns: a single name or an ordered list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupByColumns {
    /// One column
    Single(String),
    /// Several columns, keyed in order
    Multiple(Vec<String>),
}

impl GroupByColumns {
    /// The columns in key order
    pub fn columns(&self) -> Vec<String> {
        match self {
            GroupByColumns::Single(name) => vec![name.clone()],
            GroupByColumns::Multiple(names) => names.clone(),
        }
    }
}

/// Group-by request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByRequest {
    /// Grouping columns
    pub group_by: GroupByColumns,
    /// Aggregations to compute per group
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,
    /// Groups skipped before the returned page
    #[serde(default)]
    pub offset: Option<u64>,
    /// Page size
    #[serde(default)]
    pub limit: Option<usize>,
}

/// The key of one group: singleton or tuple of raw values
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey(pub Vec<Value>);

impl Serialize for GroupKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            self.0[0].serialize(serializer)
        } else {
            self.0.serialize(serializer)
        }
    }
}

/// One output group
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRow {
    /// Group key values in `groupBy` column order
    pub key: GroupKey,
    /// Rows in the group
    pub row_count: u64,
    /// Aggregate values keyed by alias
    pub aggregates: HashMap<String, Value>,
}

/// Group-by response
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupOutcome {
    /// The requested page of groups
    pub groups: Vec<GroupRow>,
    /// Group count before pagination
    pub total_groups: u64,
    /// Input row count
    pub total_rows: u64,
}

/// Canonical `type:value` segment for one key part
fn canonical_segment(value: &Value) -> String {
    match value {
        Value::Null => "null:".to_string(),
        Value::Boolean(b) => format!("boolean:{}", b),
        Value::Number(n) => format!("number:{}", n),
        Value::Text(s) => format!("string:{}", s),
        Value::Datetime(ms) => format!("datetime:{}", ms),
    }
}

/// Type-aware value ordering for min/max
fn compare_for_minmax(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Datetime(x), Value::Datetime(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        _ => a.display_string().cmp(&b.display_string()),
    }
}

#[derive(Debug)]
enum AggState {
    Count { column: bool, count: u64 },
    Sum { sum: f64, seen: bool },
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AggState {
    fn new(spec: &AggregationSpec) -> Self {
        match spec.operator {
            AggOperator::Count => AggState::Count {
                column: spec.column.is_some(),
                count: 0,
            },
            AggOperator::Sum => AggState::Sum { sum: 0.0, seen: false },
            AggOperator::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggOperator::Min => AggState::Min(None),
            AggOperator::Max => AggState::Max(None),
        }
    }

    fn update(&mut self, value: Option<&Value>) {
        match self {
            AggState::Count { column, count } => {
                let counted = if *column {
                    value.is_some_and(|v| !v.is_null())
                } else {
                    true
                };
                if counted {
                    *count += 1;
                }
            }
            AggState::Sum { sum, seen } => {
                if let Some(Value::Number(n)) = value {
                    if n.is_finite() {
                        *sum += n;
                        *seen = true;
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(Value::Number(n)) = value {
                    if n.is_finite() {
                        *sum += n;
                        *count += 1;
                    }
                }
            }
            AggState::Min(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .map_or(true, |b| compare_for_minmax(v, b) == Ordering::Less)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
            AggState::Max(best) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && best
                            .as_ref()
                            .map_or(true, |b| compare_for_minmax(v, b) == Ordering::Greater)
                    {
                        *best = Some(v.clone());
                    }
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            AggState::Count { count, .. } => Value::Number(count as f64),
            AggState::Sum { sum, seen } => {
                if seen {
                    Value::Number(sum)
                } else {
                    Value::Null
                }
            }
            AggState::Avg { sum, count } => {
                if count > 0 {
                    Value::Number(sum / count as f64)
                } else {
                    Value::Null
                }
            }
            AggState::Min(best) | AggState::Max(best) => best.unwrap_or(Value::Null),
        }
    }
}

struct GroupState {
    key: Vec<Value>,
    row_count: u64,
    aggs: Vec<AggState>,
}

/// Run a group-by over the active row set
///
/// `active` is the current filtered id list (sorted ascending);
/// `None` means every row. The fast path skips canonical key encoding
/// for single-column count-only requests.
pub async fn run_group_by(
    store: &BatchStore,
    active: Option<&[u32]>,
    column_types: &HashMap<String, ColumnType>,
    request: &GroupByRequest,
    fast_path: bool,
) -> Result<GroupOutcome> {
    let group_columns = request.group_by.columns();
    if group_columns.is_empty() {
        return Err(Error::invalid_input("groupBy needs at least one column"));
    }
    for column in &group_columns {
        if !column_types.contains_key(column) {
            return Err(Error::invalid_input(format!(
                "unknown groupBy column: {}",
                column
            )));
        }
    }
    for spec in &request.aggregations {
        if let Some(column) = &spec.column {
            let Some(column_type) = column_types.get(column).copied() else {
                return Err(Error::invalid_input(format!(
                    "unknown aggregation column: {}",
                    column
                )));
            };
            if matches!(spec.operator, AggOperator::Sum | AggOperator::Avg)
                && column_type != ColumnType::Number
            {
                return Err(Error::invalid_input(format!(
                    "{} requires a number column, {} is {}",
                    spec.operator.name(),
                    column,
                    column_type
                )));
            }
        } else if spec.operator != AggOperator::Count {
            return Err(Error::invalid_input(format!(
                "{} requires a column",
                spec.operator.name()
            )));
        }
    }

    let use_fast_keys = fast_path
        && group_columns.len() == 1
        && request
            .aggregations
            .iter()
            .all(|spec| spec.operator == AggOperator::Count && spec.column.is_none());

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<GroupState> = Vec::new();
    let mut total_rows = 0u64;

    let mut active_cursor = 0usize;
    let batch_count = store.batch_count();
    for batch_index in 0..batch_count {
        let batch = store.load_batch(batch_index).await?;
        let row_start = batch.row_start();
        let row_count = batch.row_count();

        // local indexes of the rows this request covers
        let locals: Vec<usize> = match active {
            None => (0..row_count).collect(),
            Some(ids) => {
                let mut locals = Vec::new();
                while active_cursor < ids.len() {
                    let id = ids[active_cursor];
                    if id < row_start {
                        active_cursor += 1;
                        continue;
                    }
                    if id >= row_start + row_count as u32 {
                        break;
                    }
                    locals.push((id - row_start) as usize);
                    active_cursor += 1;
                }
                locals
            }
        };

        let key_data: Vec<_> = group_columns
            .iter()
            .map(|name| batch.column(name))
            .collect();
        let agg_data: Vec<_> = request
            .aggregations
            .iter()
            .map(|spec| spec.column.as_ref().and_then(|name| batch.column(name)))
            .collect();

        for local in locals {
            total_rows += 1;
            let key_values: Vec<Value> = key_data
                .iter()
                .map(|data| data.map_or(Value::Null, |d| d.value_at(local)))
                .collect();
            let canonical = if use_fast_keys {
                key_values[0].display_string()
            } else {
                key_values
                    .iter()
                    .map(canonical_segment)
                    .collect::<Vec<_>>()
                    .join("|")
            };

            let group_index = match index.get(&canonical) {
                Some(&i) => i,
                None => {
                    let i = groups.len();
                    groups.push(GroupState {
                        key: key_values.clone(),
                        row_count: 0,
                        aggs: request.aggregations.iter().map(AggState::new).collect(),
                    });
                    index.insert(canonical, i);
                    i
                }
            };

            let group = &mut groups[group_index];
            group.row_count += 1;
            for (state, data) in group.aggs.iter_mut().zip(&agg_data) {
                let cell = data.map(|d| d.value_at(local));
                state.update(cell.as_ref());
            }
        }
    }

    let total_groups = groups.len() as u64;
    let offset = request.offset.unwrap_or(0) as usize;
    let limit = request.limit.unwrap_or(usize::MAX);
    let aliases: Vec<String> = request
        .aggregations
        .iter()
        .map(AggregationSpec::resolved_alias)
        .collect();

    let page: Vec<GroupRow> = groups
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|group| GroupRow {
            key: GroupKey(group.key),
            row_count: group.row_count,
            aggregates: aliases
                .iter()
                .cloned()
                .zip(group.aggs.into_iter().map(AggState::finish))
                .collect(),
        })
        .collect();

    Ok(GroupOutcome {
        groups: page,
        total_groups,
        total_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DiskBackend;
    use crate::storage::batch::{BatchStats, ColumnData, RowBatch};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_with(
        temp: &TempDir,
        rows: &[(&str, &str)],
    ) -> (BatchStore, HashMap<String, ColumnType>) {
        let backend = DiskBackend::open(temp.path().to_path_buf()).await.unwrap();
        let store = BatchStore::new(Arc::new(backend), "g".to_string(), 4);
        let categories: Vec<String> = rows.iter().map(|(c, _)| c.to_string()).collect();
        let amounts: Vec<String> = rows.iter().map(|(_, a)| a.to_string()).collect();
        let batch = RowBatch {
            row_ids: (0..rows.len() as u32).collect(),
            columns: vec![
                (
                    "category".to_string(),
                    ColumnData::from_raw(ColumnType::Text, &categories),
                ),
                (
                    "amount".to_string(),
                    ColumnData::from_raw(ColumnType::Number, &amounts),
                ),
            ],
            stats: BatchStats::default(),
        };
        store.store_batch(batch).await.unwrap();
        let types = HashMap::from([
            ("category".to_string(), ColumnType::Text),
            ("amount".to_string(), ColumnType::Number),
        ]);
        (store, types)
    }

    fn request(aggregations: Vec<AggregationSpec>) -> GroupByRequest {
        GroupByRequest {
            group_by: GroupByColumns::Single("category".to_string()),
            aggregations,
            offset: None,
            limit: None,
        }
    }

    #[tokio::test]
    async fn test_count_sum_avg_with_nulls() {
        let temp = TempDir::new().unwrap();
        let (store, types) = store_with(&temp, &[("A", "10"), ("A", ""), ("B", "5")]).await;

        let outcome = run_group_by(
            &store,
            None,
            &types,
            &request(vec![
                AggregationSpec {
                    operator: AggOperator::Count,
                    column: None,
                    alias: None,
                },
                AggregationSpec {
                    operator: AggOperator::Sum,
                    column: Some("amount".to_string()),
                    alias: Some("sum".to_string()),
                },
                AggregationSpec {
                    operator: AggOperator::Avg,
                    column: Some("amount".to_string()),
                    alias: Some("avg".to_string()),
                },
            ]),
            false,
        )
        .await
        .unwrap();

        assert_eq!(outcome.total_groups, 2);
        assert_eq!(outcome.total_rows, 3);
        let a = &outcome.groups[0];
        assert_eq!(a.key, GroupKey(vec![Value::Text("A".to_string())]));
        assert_eq!(a.row_count, 2);
        assert_eq!(a.aggregates["count"], Value::Number(2.0));
        assert_eq!(a.aggregates["sum"], Value::Number(10.0));
        assert_eq!(a.aggregates["avg"], Value::Number(10.0));
        let b = &outcome.groups[1];
        assert_eq!(b.aggregates["count"], Value::Number(1.0));
        assert_eq!(b.aggregates["sum"], Value::Number(5.0));
        assert_eq!(b.aggregates["avg"], Value::Number(5.0));
    }

    #[tokio::test]
    async fn test_count_with_column_skips_nulls() {
        let temp = TempDir::new().unwrap();
        let (store, types) = store_with(&temp, &[("A", "10"), ("A", ""), ("B", "5")]).await;

        let outcome = run_group_by(
            &store,
            None,
            &types,
            &request(vec![AggregationSpec {
                operator: AggOperator::Count,
                column: Some("amount".to_string()),
                alias: None,
            }]),
            false,
        )
        .await
        .unwrap();
        assert_eq!(outcome.groups[0].aggregates["count(amount)"], Value::Number(1.0));
    }

    #[tokio::test]
    async fn test_min_max_preserve_source_type() {
        let temp = TempDir::new().unwrap();
        let (store, types) = store_with(&temp, &[("A", "10"), ("A", "3"), ("B", "")]).await;

        let outcome = run_group_by(
            &store,
            None,
            &types,
            &request(vec![
                AggregationSpec {
                    operator: AggOperator::Min,
                    column: Some("amount".to_string()),
                    alias: None,
                },
                AggregationSpec {
                    operator: AggOperator::Max,
                    column: Some("amount".to_string()),
                    alias: None,
                },
            ]),
            false,
        )
        .await
        .unwrap();
        assert_eq!(outcome.groups[0].aggregates["min(amount)"], Value::Number(3.0));
        assert_eq!(outcome.groups[0].aggregates["max(amount)"], Value::Number(10.0));
        // a group with only nulls aggregates to null
        assert_eq!(outcome.groups[1].aggregates["min(amount)"], Value::Null);
    }

    #[tokio::test]
    async fn test_active_subset_and_pagination() {
        let temp = TempDir::new().unwrap();
        let (store, types) =
            store_with(&temp, &[("A", "1"), ("B", "2"), ("C", "3"), ("A", "4")]).await;

        let active = vec![1, 2, 3];
        let mut req = request(vec![]);
        req.offset = Some(1);
        req.limit = Some(1);
        let outcome = run_group_by(&store, Some(&active), &types, &req, false)
            .await
            .unwrap();
        assert_eq!(outcome.total_rows, 3);
        assert_eq!(outcome.total_groups, 3);
        assert_eq!(outcome.groups.len(), 1);
        assert_eq!(
            outcome.groups[0].key,
            GroupKey(vec![Value::Text("C".to_string())])
        );
    }

    #[tokio::test]
    async fn test_sum_on_string_column_is_invalid() {
        let temp = TempDir::new().unwrap();
        let (store, types) = store_with(&temp, &[("A", "1")]).await;
        let err = run_group_by(
            &store,
            None,
            &types,
            &request(vec![AggregationSpec {
                operator: AggOperator::Sum,
                column: Some("category".to_string()),
                alias: None,
            }]),
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_alias_defaults() {
        let spec = AggregationSpec {
            operator: AggOperator::Count,
            column: None,
            alias: None,
        };
        assert_eq!(spec.resolved_alias(), "count");
        let spec = AggregationSpec {
            operator: AggOperator::Avg,
            column: Some("amount".to_string()),
            alias: None,
        };
        assert_eq!(spec.resolved_alias(), "avg(amount)");
    }

    #[test]
    fn test_canonical_segments_keep_types_apart() {
        assert_ne!(
            canonical_segment(&Value::Number(1.0)),
            canonical_segment(&Value::Text("1".to_string()))
        );
    }
}
