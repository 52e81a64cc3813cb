//! Predicate-tree evaluation
//!
//! Filters compile once per request (regexes built, values coerced to
//! the column type) and then evaluate per batch into a byte-per-row
//! bitmask. An invalid regex never fails the request: it logs and
//! matches nothing. Fuzzy salvage is a second evaluation pass that the
//! facade runs when the exact pass matched zero rows.

use std::collections::HashMap;

use log::warn;
use regex::RegexBuilder;

use crate::config::QueryConfig;
use crate::error::Error;
use crate::fuzzy::normalize_text;
use crate::parser::datetime::{parse_datetime, parse_epoch_integer};
use crate::parser::infer::parse_boolean;
use crate::query::{CompositeOp, FilterContext, FilterNode, FilterOperator, FuzzyUse, Predicate};
use crate::storage::RowBatch;
use crate::types::{ColumnType, Value, NO_LABEL_SENTINEL, TAG_COLUMN_ID};
use crate::Result;

/// A leaf compiled against its column type
#[derive(Debug)]
pub struct CompiledPredicate {
    /// Leaf index for per-predicate match counting
    pub index: usize,
    /// Column name
    pub column: String,
    /// Fuzzy salvage opt-in
    pub fuzzy: bool,
    operator: FilterOperator,
    case_sensitive: bool,
    test: PredicateTest,
}

#[derive(Debug)]
enum PredicateTest {
    /// String comparison against a case-folded needle
    Text {
        needle: String,
        regex: Option<regex::Regex>,
    },
    /// Numeric comparison (also datetimes, in epoch milliseconds)
    Numeric { low: f64, high: f64 },
    /// Boolean comparison
    Boolean { value: bool },
    /// Reserved tag column; `None` is the no-label sentinel
    Tag { label: Option<String> },
    /// Matches nothing (unparseable value, invalid regex)
    Never,
}

/// A compiled filter tree
#[derive(Debug)]
pub enum CompiledNode {
    /// Inner node
    Composite(CompositeOp, Vec<CompiledNode>),
    /// Leaf
    Predicate(CompiledPredicate),
}

/// Compiled filter plus leaf bookkeeping
#[derive(Debug)]
pub struct CompiledFilter {
    /// Root node
    pub root: CompiledNode,
    /// Number of leaves, for match-count vectors
    pub leaf_count: usize,
}

impl CompiledFilter {
    /// Leaves that opted into fuzzy salvage with a usable needle
    pub fn fuzzy_leaves(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        collect_fuzzy_leaves(&self.root, &mut out);
        out
    }
}

fn collect_fuzzy_leaves<'a>(node: &'a CompiledNode, out: &mut Vec<(&'a str, &'a str)>) {
    match node {
        CompiledNode::Composite(_, children) => {
            for child in children {
                collect_fuzzy_leaves(child, out);
            }
        }
        CompiledNode::Predicate(leaf) => {
            if leaf.fuzzy
                && matches!(leaf.operator, FilterOperator::Eq | FilterOperator::Neq)
            {
                if let PredicateTest::Text { needle, .. } = &leaf.test {
                    out.push((leaf.column.as_str(), needle.as_str()));
                }
            }
        }
    }
}

/// Compile a filter tree against the dataset's column types
pub fn compile_filter(
    node: &FilterNode,
    column_types: &HashMap<String, ColumnType>,
    config: &QueryConfig,
) -> Result<CompiledFilter> {
    let mut leaf_count = 0;
    let root = compile_node(node, column_types, config, &mut leaf_count)?;
    Ok(CompiledFilter { root, leaf_count })
}

fn compile_node(
    node: &FilterNode,
    column_types: &HashMap<String, ColumnType>,
    config: &QueryConfig,
    leaf_count: &mut usize,
) -> Result<CompiledNode> {
    match node {
        FilterNode::Composite { op, children } => {
            let compiled = children
                .iter()
                .map(|child| compile_node(child, column_types, config, leaf_count))
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledNode::Composite(*op, compiled))
        }
        FilterNode::Predicate(predicate) => {
            let index = *leaf_count;
            *leaf_count += 1;
            compile_predicate(predicate, column_types, config, index)
                .map(CompiledNode::Predicate)
        }
    }
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_millis(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_epoch_integer(s)
            .or_else(|| parse_datetime(s))
            .map(|ms| ms as f64),
        _ => None,
    }
}

fn value_as_bool(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::String(s) => parse_boolean(s.trim()),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(x) if x == 0.0 => Some(false),
            Some(x) if x == 1.0 => Some(true),
            _ => None,
        },
        _ => None,
    }
}

fn compile_predicate(
    predicate: &Predicate,
    column_types: &HashMap<String, ColumnType>,
    config: &QueryConfig,
    index: usize,
) -> Result<CompiledPredicate> {
    use FilterOperator::*;

    let make = |test: PredicateTest| CompiledPredicate {
        index,
        column: predicate.column.clone(),
        fuzzy: predicate.fuzzy,
        operator: predicate.operator,
        case_sensitive: predicate.case_sensitive,
        test,
    };

    if predicate.column == TAG_COLUMN_ID {
        if !matches!(predicate.operator, Eq | Neq) {
            return Err(Error::invalid_input(format!(
                "operator {:?} is not valid for the tag column",
                predicate.operator
            )));
        }
        let raw = predicate
            .value
            .as_ref()
            .map(value_as_string)
            .unwrap_or_default();
        let label = if raw == NO_LABEL_SENTINEL {
            None
        } else {
            Some(raw)
        };
        return Ok(make(PredicateTest::Tag { label }));
    }

    let column_type = column_types.get(&predicate.column).copied().ok_or_else(|| {
        Error::invalid_input(format!("unknown filter column: {}", predicate.column))
    })?;

    match column_type {
        ColumnType::Text => {
            if !matches!(
                predicate.operator,
                Eq | Neq | Contains | StartsWith | Regex | Matches | NotMatches
            ) {
                return Err(Error::invalid_input(format!(
                    "operator {:?} is not valid for string column {}",
                    predicate.operator, predicate.column
                )));
            }
            let raw = predicate
                .value
                .as_ref()
                .map(value_as_string)
                .unwrap_or_default();
            if matches!(predicate.operator, Regex | Matches | NotMatches) {
                if raw.len() > config.max_regex_length {
                    return Err(Error::invalid_input(format!(
                        "regex pattern exceeds {} bytes",
                        config.max_regex_length
                    )));
                }
                let built = RegexBuilder::new(&raw)
                    .case_insensitive(!predicate.case_sensitive)
                    .build();
                return Ok(match built {
                    Ok(regex) => make(PredicateTest::Text {
                        needle: raw,
                        regex: Some(regex),
                    }),
                    Err(e) => {
                        warn!(
                            "invalid regex {:?} on column {}: {}",
                            raw, predicate.column, e
                        );
                        make(PredicateTest::Never)
                    }
                });
            }
            let needle = if predicate.case_sensitive {
                raw
            } else {
                raw.to_lowercase()
            };
            Ok(make(PredicateTest::Text {
                needle,
                regex: None,
            }))
        }
        ColumnType::Number | ColumnType::Datetime => {
            if !matches!(predicate.operator, Eq | Neq | Gt | Lt | Range) {
                return Err(Error::invalid_input(format!(
                    "operator {:?} is not valid for {} column {}",
                    predicate.operator, column_type, predicate.column
                )));
            }
            let coerce = if column_type == ColumnType::Number {
                value_as_f64
            } else {
                value_as_millis
            };
            let low = predicate.value.as_ref().and_then(coerce);
            let high = predicate.value2.as_ref().and_then(coerce);
            if predicate.operator == Range {
                // a missing bound is unbounded on that side
                return Ok(make(PredicateTest::Numeric {
                    low: low.unwrap_or(f64::NEG_INFINITY),
                    high: high.unwrap_or(f64::INFINITY),
                }));
            }
            match low {
                Some(v) if v.is_finite() => Ok(make(PredicateTest::Numeric { low: v, high: v })),
                _ => Ok(make(PredicateTest::Never)),
            }
        }
        ColumnType::Boolean => {
            if !matches!(predicate.operator, Eq | Neq) {
                return Err(Error::invalid_input(format!(
                    "operator {:?} is not valid for boolean column {}",
                    predicate.operator, predicate.column
                )));
            }
            match predicate.value.as_ref().and_then(value_as_bool) {
                Some(value) => Ok(make(PredicateTest::Boolean { value })),
                None => Ok(make(PredicateTest::Never)),
            }
        }
    }
}

/// Per-column token sets driving a salvage pass
#[derive(Debug, Default)]
pub struct SalvagePlan {
    tokens: HashMap<String, Vec<String>>,
}

impl SalvagePlan {
    /// Whether the plan has anything to apply
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn tokens_for(&self, column: &str) -> Option<&[String]> {
        self.tokens.get(column).map(Vec::as_slice)
    }
}

/// Build the salvage plan for a filter whose exact pass came up empty
///
/// Returns the plan plus the "did you mean" metadata for the caller.
pub fn build_salvage_plan(
    filter: &CompiledFilter,
    ctx: &FilterContext<'_>,
    max_distance: u32,
    max_suggestions: usize,
) -> (SalvagePlan, Vec<FuzzyUse>) {
    let mut plan = SalvagePlan::default();
    let mut uses = Vec::new();
    let Some(fuzzy) = ctx.fuzzy else {
        return (plan, uses);
    };

    for (column, needle) in filter.fuzzy_leaves() {
        if plan.tokens.contains_key(column) {
            continue;
        }
        let mut suggestions: Vec<crate::fuzzy::Suggestion> = Vec::new();
        for word in needle.split_whitespace() {
            for suggestion in fuzzy.lookup(column, word, max_distance, max_suggestions) {
                if !suggestions.iter().any(|s| s.token == suggestion.token) {
                    suggestions.push(suggestion);
                }
            }
        }
        suggestions.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then(b.frequency.cmp(&a.frequency))
        });
        suggestions.truncate(max_suggestions);
        if suggestions.is_empty() {
            continue;
        }
        plan.tokens.insert(
            column.to_string(),
            suggestions.iter().map(|s| s.token.clone()).collect(),
        );
        uses.push(FuzzyUse {
            column: column.to_string(),
            query: needle.to_string(),
            suggestions,
        });
    }
    (plan, uses)
}

/// Evaluate a compiled filter over one batch into a byte bitmask
///
/// `counts`, when given, accumulates per-leaf match totals.
pub fn evaluate_batch(
    filter: &CompiledFilter,
    batch: &RowBatch,
    ctx: &FilterContext<'_>,
    salvage: Option<&SalvagePlan>,
    counts: &mut Option<&mut Vec<u64>>,
) -> Vec<u8> {
    evaluate_node(&filter.root, batch, ctx, salvage, counts)
}

fn evaluate_node(
    node: &CompiledNode,
    batch: &RowBatch,
    ctx: &FilterContext<'_>,
    salvage: Option<&SalvagePlan>,
    counts: &mut Option<&mut Vec<u64>>,
) -> Vec<u8> {
    let rows = batch.row_count();
    match node {
        CompiledNode::Composite(op, children) => {
            // an empty child list evaluates to all-true
            let mut mask = vec![u8::from(*op == CompositeOp::And || children.is_empty()); rows];
            for (i, child) in children.iter().enumerate() {
                let child_mask = evaluate_node(child, batch, ctx, salvage, counts);
                match op {
                    CompositeOp::And => {
                        for (m, c) in mask.iter_mut().zip(&child_mask) {
                            *m &= c;
                        }
                    }
                    CompositeOp::Or => {
                        if i == 0 {
                            mask = child_mask;
                        } else {
                            for (m, c) in mask.iter_mut().zip(&child_mask) {
                                *m |= c;
                            }
                        }
                    }
                }
            }
            mask
        }
        CompiledNode::Predicate(leaf) => {
            let mask = evaluate_predicate(leaf, batch, ctx, salvage);
            if let Some(counts) = counts.as_mut() {
                counts[leaf.index] += mask.iter().filter(|&&m| m != 0).count() as u64;
            }
            mask
        }
    }
}

fn evaluate_predicate(
    leaf: &CompiledPredicate,
    batch: &RowBatch,
    ctx: &FilterContext<'_>,
    salvage: Option<&SalvagePlan>,
) -> Vec<u8> {
    use FilterOperator::*;
    let rows = batch.row_count();

    match &leaf.test {
        PredicateTest::Never => vec![0; rows],
        PredicateTest::Tag { label } => {
            let empty = HashMap::new();
            let tags = ctx.tags.unwrap_or(&empty);
            let mut mask = vec![0u8; rows];
            for (i, &row_id) in batch.row_ids.iter().enumerate() {
                let record = tags.get(&row_id);
                let hit = match label {
                    None => record.map_or(true, |r| r.label_ids.is_empty()),
                    Some(id) => record.is_some_and(|r| r.label_ids.contains(id)),
                };
                let pass = if leaf.operator == Neq { !hit } else { hit };
                mask[i] = u8::from(pass);
            }
            mask
        }
        PredicateTest::Text { needle, regex } => {
            let Some(data) = batch.column(&leaf.column) else {
                return vec![0; rows];
            };
            let salvage_tokens = if leaf.fuzzy && matches!(leaf.operator, Eq | Neq) {
                salvage.and_then(|plan| plan.tokens_for(&leaf.column))
            } else {
                None
            };
            let mut mask = vec![0u8; rows];
            for (i, slot) in mask.iter_mut().enumerate() {
                let Value::Text(cell) = data.value_at(i) else {
                    continue;
                };
                let folded = if leaf.case_sensitive {
                    cell.clone()
                } else {
                    cell.to_lowercase()
                };
                let hit = match (leaf.operator, regex) {
                    (Regex | Matches, Some(re)) => re.is_match(&cell),
                    (NotMatches, Some(re)) => !re.is_match(&cell),
                    (Eq | Neq, _) => {
                        let mut matched = folded == *needle;
                        if let Some(tokens) = salvage_tokens {
                            if !matched {
                                let normalized = normalize_text(&cell);
                                matched = tokens.iter().any(|t| normalized.contains(t.as_str()));
                            }
                        }
                        if leaf.operator == Neq {
                            !matched
                        } else {
                            matched
                        }
                    }
                    (Contains, _) => folded.contains(needle.as_str()),
                    (StartsWith, _) => folded.starts_with(needle.as_str()),
                    _ => false,
                };
                *slot = u8::from(hit);
            }
            mask
        }
        PredicateTest::Numeric { low, high } => {
            let Some(data) = batch.column(&leaf.column) else {
                return vec![0; rows];
            };
            let mut mask = vec![0u8; rows];
            for (i, slot) in mask.iter_mut().enumerate() {
                let cell = match data.value_at(i) {
                    Value::Number(n) => n,
                    Value::Datetime(ms) => ms as f64,
                    _ => continue, // nulls and non-numerics never match
                };
                if !cell.is_finite() {
                    continue;
                }
                let hit = match leaf.operator {
                    Eq => cell == *low,
                    Neq => cell != *low,
                    Gt => cell > *low,
                    Lt => cell < *low,
                    Range => cell >= *low && cell <= *high,
                    _ => false,
                };
                *slot = u8::from(hit);
            }
            mask
        }
        PredicateTest::Boolean { value } => {
            let Some(data) = batch.column(&leaf.column) else {
                return vec![0; rows];
            };
            let mut mask = vec![0u8; rows];
            for (i, slot) in mask.iter_mut().enumerate() {
                let Value::Boolean(cell) = data.value_at(i) else {
                    continue;
                };
                let hit = if leaf.operator == Neq {
                    cell != *value
                } else {
                    cell == *value
                };
                *slot = u8::from(hit);
            }
            mask
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::TagRecord;
    use crate::storage::batch::{BatchStats, ColumnData};
    use serde_json::json;
    use std::collections::HashSet;

    fn types() -> HashMap<String, ColumnType> {
        HashMap::from([
            ("city".to_string(), ColumnType::Text),
            ("age".to_string(), ColumnType::Number),
            ("active".to_string(), ColumnType::Boolean),
            ("seen".to_string(), ColumnType::Datetime),
        ])
    }

    fn batch() -> RowBatch {
        let raw = |cells: &[&str]| cells.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        RowBatch {
            row_ids: vec![0, 1, 2, 3],
            columns: vec![
                (
                    "city".to_string(),
                    ColumnData::from_raw(ColumnType::Text, &raw(&["Paris", "London", "paris", "Oslo"])),
                ),
                (
                    "age".to_string(),
                    ColumnData::from_raw(ColumnType::Number, &raw(&["30", "25", "", "41"])),
                ),
                (
                    "active".to_string(),
                    ColumnData::from_raw(ColumnType::Boolean, &raw(&["yes", "no", "yes", ""])),
                ),
                (
                    "seen".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Datetime,
                        &raw(&["2021-01-01", "2021-06-01", "", "2022-01-01"]),
                    ),
                ),
            ],
            stats: BatchStats::default(),
        }
    }

    fn run(node: &FilterNode) -> Vec<u8> {
        let filter = compile_filter(node, &types(), &QueryConfig::default()).unwrap();
        evaluate_batch(&filter, &batch(), &FilterContext::default(), None, &mut None)
    }

    #[test]
    fn test_string_eq_defaults_case_insensitive() {
        let mask = run(&FilterNode::predicate("city", FilterOperator::Eq, json!("Paris")));
        assert_eq!(mask, vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_string_eq_case_sensitive() {
        let node = FilterNode::Predicate(Predicate {
            column: "city".into(),
            operator: FilterOperator::Eq,
            value: Some(json!("Paris")),
            value2: None,
            case_sensitive: true,
            fuzzy: false,
        });
        assert_eq!(run(&node), vec![1, 0, 0, 0]);
    }

    #[test]
    fn test_numeric_operators_skip_nulls() {
        let mask = run(&FilterNode::predicate("age", FilterOperator::Gt, json!(26)));
        assert_eq!(mask, vec![1, 0, 0, 1]);
        // neq also treats null as non-matching
        let mask = run(&FilterNode::predicate("age", FilterOperator::Neq, json!(30)));
        assert_eq!(mask, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_range_with_one_sided_bounds() {
        let node = FilterNode::Predicate(Predicate {
            column: "age".into(),
            operator: FilterOperator::Range,
            value: None,
            value2: Some(json!(30)),
            case_sensitive: false,
            fuzzy: false,
        });
        // unbounded below, inclusive above
        assert_eq!(run(&node), vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_datetime_values_parse_liberally() {
        let node = FilterNode::predicate("seen", FilterOperator::Gt, json!("2021-03-01"));
        assert_eq!(run(&node), vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_composite_and_or_and_empty() {
        let node = FilterNode::and(vec![
            FilterNode::predicate("city", FilterOperator::Eq, json!("paris")),
            FilterNode::predicate("age", FilterOperator::Gt, json!(26)),
        ]);
        assert_eq!(run(&node), vec![1, 0, 0, 0]);

        let node = FilterNode::or(vec![
            FilterNode::predicate("city", FilterOperator::Eq, json!("oslo")),
            FilterNode::predicate("age", FilterOperator::Eq, json!(25)),
        ]);
        assert_eq!(run(&node), vec![0, 1, 0, 1]);

        assert_eq!(run(&FilterNode::and(vec![])), vec![1, 1, 1, 1]);
        assert_eq!(run(&FilterNode::or(vec![])), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_invalid_regex_matches_nothing_without_failing() {
        let node = FilterNode::predicate("city", FilterOperator::Regex, json!("(unclosed"));
        assert_eq!(run(&node), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_regex_include_and_exclude() {
        let node = FilterNode::predicate("city", FilterOperator::Matches, json!("^pa"));
        assert_eq!(run(&node), vec![1, 0, 1, 0]);
        let node = FilterNode::predicate("city", FilterOperator::NotMatches, json!("^pa"));
        assert_eq!(run(&node), vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_unknown_column_and_bad_operator_are_invalid_input() {
        let node = FilterNode::predicate("nope", FilterOperator::Eq, json!(1));
        assert!(matches!(
            compile_filter(&node, &types(), &QueryConfig::default()),
            Err(Error::InvalidInput(_))
        ));

        let node = FilterNode::predicate("age", FilterOperator::Contains, json!(1));
        assert!(matches!(
            compile_filter(&node, &types(), &QueryConfig::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_regex_length_cap() {
        let long = "a".repeat(600);
        let node = FilterNode::predicate("city", FilterOperator::Regex, json!(long));
        assert!(matches!(
            compile_filter(&node, &types(), &QueryConfig::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_tag_column_semantics() {
        let tags = HashMap::from([
            (
                0u32,
                TagRecord {
                    label_ids: HashSet::from(["bug".to_string()]),
                    note: None,
                    updated_at: 0,
                },
            ),
            (
                2u32,
                TagRecord {
                    label_ids: HashSet::new(),
                    note: Some("note only".to_string()),
                    updated_at: 0,
                },
            ),
        ]);
        let ctx = FilterContext {
            tags: Some(&tags),
            fuzzy: None,
        };

        let eval = |operator, value: &str| {
            let node = FilterNode::predicate(TAG_COLUMN_ID, operator, json!(value));
            let filter = compile_filter(&node, &types(), &QueryConfig::default()).unwrap();
            evaluate_batch(&filter, &batch(), &ctx, None, &mut None)
        };

        assert_eq!(eval(FilterOperator::Eq, "bug"), vec![1, 0, 0, 0]);
        // untagged rows and label-less records match the sentinel
        assert_eq!(eval(FilterOperator::Eq, NO_LABEL_SENTINEL), vec![0, 1, 1, 1]);
        // neq fails exactly the rows carrying the label
        assert_eq!(eval(FilterOperator::Neq, "bug"), vec![0, 1, 1, 1]);
    }

    #[test]
    fn test_per_predicate_match_counts() {
        let node = FilterNode::and(vec![
            FilterNode::predicate("city", FilterOperator::Eq, json!("paris")),
            FilterNode::predicate("age", FilterOperator::Gt, json!(26)),
        ]);
        let filter = compile_filter(&node, &types(), &QueryConfig::default()).unwrap();
        let mut counts = vec![0u64; filter.leaf_count];
        let mut counts_opt = Some(&mut counts);
        evaluate_batch(&filter, &batch(), &FilterContext::default(), None, &mut counts_opt);
        assert_eq!(counts, vec![2, 2]);
    }
}
