//! Per-column type inference
//!
//! Every non-null raw value is classified into exactly one shape via a
//! fixed priority: boolean literal, epoch integer, finite number,
//! parseable timestamp, otherwise string. Resolution checks candidates
//! in order boolean -> datetime -> number against per-type ratio
//! thresholds over the non-null sample.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::parser::datetime::{parse_datetime, parse_epoch_integer};
use crate::types::ColumnType;

/// Ratio threshold a boolean candidate must meet
const BOOLEAN_THRESHOLD: f64 = 0.9;
/// Ratio threshold a datetime candidate must meet
const DATETIME_THRESHOLD: f64 = 0.6;
/// Ratio threshold a number candidate must meet
const NUMBER_THRESHOLD: f64 = 0.85;

/// Distinct raw examples retained per column
const MAX_EXAMPLES: usize = 5;

/// Shape of a single classified value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueShape {
    /// Empty or whitespace-only
    Null,
    /// Boolean literal
    Boolean(bool),
    /// Timestamp, milliseconds since epoch
    Datetime(i64),
    /// Finite number
    Number(f64),
    /// Anything else
    Text,
}

/// Classify one raw value into exactly one shape
pub fn classify(raw: &str) -> ValueShape {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return ValueShape::Null;
    }

    if let Some(b) = parse_boolean(trimmed) {
        return ValueShape::Boolean(b);
    }

    if let Some(ms) = parse_epoch_integer(trimmed) {
        return ValueShape::Datetime(ms);
    }

    if let Ok(n) = trimmed.parse::<f64>() {
        if n.is_finite() {
            return ValueShape::Number(n);
        }
    }

    if let Some(ms) = parse_datetime(trimmed) {
        return ValueShape::Datetime(ms);
    }

    ValueShape::Text
}

/// Parse the accepted boolean literal set (case-insensitive)
pub fn parse_boolean(trimmed: &str) -> Option<bool> {
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Per-column inference tally
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInference {
    /// Values observed, nulls included
    pub samples: u64,
    /// Empty/whitespace values observed
    pub null_count: u64,
    /// Shape counts over non-null values
    pub type_counts: HashMap<ColumnType, u64>,
    /// Up to five distinct non-null raw strings
    pub examples: Vec<String>,
    /// Smallest timestamp seen, when any value classified as datetime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_datetime: Option<i64>,
    /// Largest timestamp seen
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_datetime: Option<i64>,
}

impl ColumnInference {
    /// Feed one raw value into the tally
    pub fn observe(&mut self, raw: &str) {
        self.samples += 1;

        let shape = classify(raw);
        let counted_type = match shape {
            ValueShape::Null => {
                self.null_count += 1;
                return;
            }
            ValueShape::Boolean(_) => ColumnType::Boolean,
            ValueShape::Datetime(ms) => {
                self.min_datetime = Some(self.min_datetime.map_or(ms, |m| m.min(ms)));
                self.max_datetime = Some(self.max_datetime.map_or(ms, |m| m.max(ms)));
                ColumnType::Datetime
            }
            ValueShape::Number(_) => ColumnType::Number,
            ValueShape::Text => ColumnType::Text,
        };
        *self.type_counts.entry(counted_type).or_insert(0) += 1;

        if self.examples.len() < MAX_EXAMPLES {
            let trimmed = raw.trim();
            if !self.examples.iter().any(|e| e == trimmed) {
                self.examples.push(trimmed.to_string());
            }
        }
    }

    /// Non-null sample count
    pub fn non_null(&self) -> u64 {
        self.samples - self.null_count
    }

    /// Resolve the column type with a confidence ratio
    ///
    /// Candidates are checked in order boolean -> datetime -> number;
    /// the first whose ratio over non-null samples meets its threshold
    /// wins. Otherwise the column is a string with confidence
    /// `1 - best_ratio`.
    pub fn resolve(&self) -> TypeResolution {
        let non_null = self.non_null();
        if non_null == 0 {
            return TypeResolution {
                column_type: ColumnType::Text,
                confidence: 1.0,
            };
        }

        let candidates = [
            (ColumnType::Boolean, BOOLEAN_THRESHOLD),
            (ColumnType::Datetime, DATETIME_THRESHOLD),
            (ColumnType::Number, NUMBER_THRESHOLD),
        ];

        let mut best_ratio: f64 = 0.0;
        for (candidate, threshold) in candidates {
            let count = self.type_counts.get(&candidate).copied().unwrap_or(0);
            let ratio = count as f64 / non_null as f64;
            if ratio >= threshold {
                return TypeResolution {
                    column_type: candidate,
                    confidence: ratio,
                };
            }
            best_ratio = best_ratio.max(ratio);
        }

        TypeResolution {
            column_type: ColumnType::Text,
            confidence: 1.0 - best_ratio,
        }
    }
}

/// Outcome of a type resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeResolution {
    /// The resolved column type
    pub column_type: ColumnType,
    /// Ratio backing the decision
    pub confidence: f64,
}
