//! Core data types for Tabulite

use std::collections::HashMap;
use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Reserved virtual column id addressing per-row annotation label sets
pub const TAG_COLUMN_ID: &str = "__tag__";

/// Sentinel filter value matching rows with an empty label set
pub const NO_LABEL_SENTINEL: &str = "__no_label__";

/// Column type resolved by inference, fixed for the lifetime of a parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// UTF-8 text
    #[serde(rename = "string")]
    Text,
    /// IEEE-754 double
    #[serde(rename = "number")]
    Number,
    /// Milliseconds since the Unix epoch
    #[serde(rename = "datetime")]
    Datetime,
    /// True/false
    #[serde(rename = "boolean")]
    Boolean,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Text => "string",
            ColumnType::Number => "number",
            ColumnType::Datetime => "datetime",
            ColumnType::Boolean => "boolean",
        };
        write!(f, "{}", name)
    }
}

/// Cell value materialized from a columnar batch
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Boolean(bool),
    /// 64-bit floating point number
    Number(f64),
    /// UTF-8 string
    Text(String),
    /// Timestamp (milliseconds since the Unix epoch)
    Datetime(i64),
}

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to view this value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to view this value as a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Datetime(ms) => Some(*ms as f64),
            _ => None,
        }
    }

    /// Try to view this value as a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to view this value as epoch milliseconds
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            Value::Datetime(ms) => Some(*ms),
            _ => None,
        }
    }

    /// Render the value the way the grid displays it
    ///
    /// Datetimes render as ISO-8601 UTC with an all-zero millisecond
    /// suffix stripped; nulls render as the empty string.
    pub fn display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Text(s) => s.clone(),
            Value::Datetime(ms) => format_iso_datetime(*ms),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_string())
    }
}

impl Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Datetime(ms) => serializer.serialize_str(&format_iso_datetime(*ms)),
        }
    }
}

/// Format an f64 without a trailing `.0` for integral values
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// ISO-8601 UTC rendering with `.000` stripped
pub fn format_iso_datetime(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => {
            let rendered = dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
            rendered.replace(".000Z", "Z")
        }
        None => String::new(),
    }
}

/// A materialized row: dense row id plus field-name keyed values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// Zero-based dense row identifier, stable for the loaded dataset
    #[serde(rename = "__rowId")]
    pub row_id: u32,
    /// Cell values keyed by column name
    #[serde(flatten)]
    pub values: HashMap<String, Value>,
}

impl Row {
    /// Create a row from its id and cells
    pub fn new(row_id: u32, values: HashMap<String, Value>) -> Self {
        Self { row_id, values }
    }

    /// Get a cell by column name (missing columns read as null)
    pub fn get(&self, column: &str) -> &Value {
        self.values.get(column).unwrap_or(&Value::Null)
    }
}

/// `(fileName, fileSize, lastModified)` triple keying per-file stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFingerprint {
    /// Source file name (no directory components)
    pub file_name: String,
    /// Source file size in bytes
    pub file_size: u64,
    /// Last-modified time, milliseconds since the Unix epoch
    pub last_modified: i64,
}

impl FileFingerprint {
    /// Derive the key under which per-file auxiliary stores live
    ///
    /// The key must be filesystem-safe; everything outside
    /// `[A-Za-z0-9._-]` in the file name is mapped to `_`.
    pub fn store_key(&self) -> String {
        let safe: String = self
            .file_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}-{}", safe, self.file_size, self.last_modified)
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// One sort key: column plus direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    /// Column name
    pub column: String,
    /// Sort direction
    pub direction: SortDirection,
}

impl SortSpec {
    /// Ascending sort on a column
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on a column
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Desc,
        }
    }
}
