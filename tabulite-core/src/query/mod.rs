//! Query engine over materialized batches
//!
//! Filter, sort, search and group all read batches through the store
//! iterator and share the request/response types defined here. No
//! operator suspends mid-batch: predicates, comparators and
//! aggregators work on fully loaded batches.

pub mod filter;
pub mod group;
pub mod search;
pub mod sort;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::annotations::TagRecord;
use crate::fuzzy::{FuzzyIndex, Suggestion};

pub use filter::{build_salvage_plan, compile_filter, evaluate_batch, CompiledFilter, SalvagePlan};
pub use group::{
    AggOperator, AggregationSpec, GroupByColumns, GroupByRequest, GroupKey, GroupOutcome, GroupRow,
};
pub use search::{SearchOutcome, SearchRequest};
pub use sort::{sort_row_ids, SortKey};

/// Composite combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeOp {
    /// Every child must pass
    And,
    /// Any child may pass
    Or,
}

/// Predicate operator; the legal set depends on the column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Equality
    #[serde(rename = "eq")]
    Eq,
    /// Inequality
    #[serde(rename = "neq")]
    Neq,
    /// Substring containment (string columns)
    #[serde(rename = "contains")]
    Contains,
    /// Prefix match (string columns)
    #[serde(rename = "startsWith")]
    StartsWith,
    /// Regex match (string columns)
    #[serde(rename = "regex")]
    Regex,
    /// Regex include (string columns)
    #[serde(rename = "matches")]
    Matches,
    /// Regex exclude (string columns)
    #[serde(rename = "notMatches")]
    NotMatches,
    /// Greater-than (number/datetime columns)
    #[serde(rename = "gt")]
    Gt,
    /// Less-than (number/datetime columns)
    #[serde(rename = "lt")]
    Lt,
    /// Inclusive range; a missing bound is unbounded on that side
    #[serde(rename = "range", alias = "between")]
    Range,
}

/// One leaf predicate of a filter tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    /// Column name, or the reserved tag column id
    pub column: String,
    /// Operator
    pub operator: FilterOperator,
    /// Comparison value
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Upper bound for `range`
    #[serde(default)]
    pub value2: Option<serde_json::Value>,
    /// Case-sensitive string comparison (default: off)
    #[serde(default)]
    pub case_sensitive: bool,
    /// Opt into fuzzy salvage when the exact pass matches nothing
    #[serde(default)]
    pub fuzzy: bool,
}

/// Filter tree: leaves are predicates, inner nodes combine children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    /// Inner node
    Composite {
        /// Combinator
        op: CompositeOp,
        /// Child nodes; an empty list evaluates to all-true
        children: Vec<FilterNode>,
    },
    /// Leaf predicate
    Predicate(Predicate),
}

impl FilterNode {
    /// Convenience leaf constructor
    pub fn predicate(
        column: impl Into<String>,
        operator: FilterOperator,
        value: serde_json::Value,
    ) -> Self {
        FilterNode::Predicate(Predicate {
            column: column.into(),
            operator,
            value: Some(value),
            value2: None,
            case_sensitive: false,
            fuzzy: false,
        })
    }

    /// Convenience conjunction constructor
    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::Composite {
            op: CompositeOp::And,
            children,
        }
    }

    /// Convenience disjunction constructor
    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Composite {
            op: CompositeOp::Or,
            children,
        }
    }
}

/// Shared read-only context consulted during evaluation
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterContext<'a> {
    /// Per-row tag records for the reserved tag column
    pub tags: Option<&'a HashMap<u32, TagRecord>>,
    /// Fuzzy index for salvage lookups
    pub fuzzy: Option<&'a FuzzyIndex>,
}

/// "Did you mean" metadata reported when fuzzy salvage fired
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FuzzyUse {
    /// Column the salvage ran against
    pub column: String,
    /// The query value that had no exact matches
    pub query: String,
    /// Nearest tokens, closest first
    pub suggestions: Vec<Suggestion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_tree_wire_shape() {
        let json = r#"{
            "op": "and",
            "children": [
                {"column": "city", "operator": "eq", "value": "Paris"},
                {"column": "age", "operator": "between", "value": 20, "value2": 40}
            ]
        }"#;
        let node: FilterNode = serde_json::from_str(json).unwrap();
        let FilterNode::Composite { op, children } = node else {
            panic!("expected composite");
        };
        assert_eq!(op, CompositeOp::And);
        assert_eq!(children.len(), 2);
        let FilterNode::Predicate(p) = &children[1] else {
            panic!("expected predicate");
        };
        assert_eq!(p.operator, FilterOperator::Range);
        assert!(!p.case_sensitive);
    }

    #[test]
    fn test_operator_names_round_trip() {
        for (op, name) in [
            (FilterOperator::StartsWith, "\"startsWith\""),
            (FilterOperator::NotMatches, "\"notMatches\""),
            (FilterOperator::Range, "\"range\""),
        ] {
            assert_eq!(serde_json::to_string(&op).unwrap(), name);
            let back: FilterOperator = serde_json::from_str(name).unwrap();
            assert_eq!(back, op);
        }
    }
}
