//! Columnar row batches and their stable binary format
//!
//! A batch holds one typed buffer per column for a contiguous run of
//! rows. On disk each batch serializes as a little-endian u32 header
//! length, a JSON header, the row-id array, then per-column payloads
//! in `columnOrder`. Null masks mark nulls with 1 and win over the
//! value buffer on decode.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::parser::datetime::{parse_datetime, parse_epoch_integer};
use crate::parser::infer::parse_boolean;
use crate::types::{ColumnType, Row, Value};
use crate::Result;

/// On-disk batch format version
pub const BATCH_FORMAT_VERSION: u32 = 1;

/// Typed column buffer for one batch
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// UTF-8 bytes plus an (n+1)-entry offset array of byte positions
    Text {
        /// Monotonically non-decreasing byte positions; `offsets[n]`
        /// equals the total byte length
        offsets: Vec<u32>,
        /// Concatenated UTF-8 cell bytes
        bytes: Vec<u8>,
    },
    /// IEEE-754 doubles plus an optional null mask
    Number {
        /// Cell values
        values: Vec<f64>,
        /// Per-row null mask (1 = null), same length as `values`
        nulls: Option<Vec<u8>>,
    },
    /// Byte-per-row booleans plus an optional null mask
    Boolean {
        /// Cell values, 0 or 1
        values: Vec<u8>,
        /// Per-row null mask (1 = null)
        nulls: Option<Vec<u8>>,
    },
    /// Milliseconds-since-epoch doubles plus an optional null mask
    Datetime {
        /// Cell values in epoch milliseconds
        millis: Vec<f64>,
        /// Per-row null mask (1 = null)
        nulls: Option<Vec<u8>>,
    },
}

impl ColumnData {
    /// Build a typed buffer from raw cell strings under a resolved type
    ///
    /// Cells that fail the typed conversion become nulls; string
    /// columns keep the raw text verbatim (empty stays empty).
    pub fn from_raw(column_type: ColumnType, raw: &[String]) -> Self {
        match column_type {
            ColumnType::Text => {
                let mut offsets = Vec::with_capacity(raw.len() + 1);
                let mut bytes = Vec::new();
                offsets.push(0u32);
                for cell in raw {
                    bytes.extend_from_slice(cell.as_bytes());
                    offsets.push(bytes.len() as u32);
                }
                ColumnData::Text { offsets, bytes }
            }
            ColumnType::Number => {
                let mut values = Vec::with_capacity(raw.len());
                let mut nulls = vec![0u8; raw.len()];
                let mut any_null = false;
                for (i, cell) in raw.iter().enumerate() {
                    match cell.trim().parse::<f64>() {
                        Ok(n) if n.is_finite() => values.push(n),
                        _ => {
                            values.push(0.0);
                            nulls[i] = 1;
                            any_null = true;
                        }
                    }
                }
                ColumnData::Number {
                    values,
                    nulls: any_null.then_some(nulls),
                }
            }
            ColumnType::Boolean => {
                let mut values = Vec::with_capacity(raw.len());
                let mut nulls = vec![0u8; raw.len()];
                let mut any_null = false;
                for (i, cell) in raw.iter().enumerate() {
                    match parse_boolean(cell.trim()) {
                        Some(b) => values.push(b as u8),
                        None => {
                            values.push(0);
                            nulls[i] = 1;
                            any_null = true;
                        }
                    }
                }
                ColumnData::Boolean {
                    values,
                    nulls: any_null.then_some(nulls),
                }
            }
            ColumnType::Datetime => {
                let mut millis = Vec::with_capacity(raw.len());
                let mut nulls = vec![0u8; raw.len()];
                let mut any_null = false;
                for (i, cell) in raw.iter().enumerate() {
                    let trimmed = cell.trim();
                    let parsed = parse_epoch_integer(trimmed).or_else(|| parse_datetime(trimmed));
                    match parsed {
                        Some(ms) => millis.push(ms as f64),
                        None => {
                            millis.push(0.0);
                            nulls[i] = 1;
                            any_null = true;
                        }
                    }
                }
                ColumnData::Datetime {
                    millis,
                    nulls: any_null.then_some(nulls),
                }
            }
        }
    }

    /// Row count in this buffer
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Text { offsets, .. } => offsets.len().saturating_sub(1),
            ColumnData::Number { values, .. } => values.len(),
            ColumnData::Boolean { values, .. } => values.len(),
            ColumnData::Datetime { millis, .. } => millis.len(),
        }
    }

    /// Whether the buffer has no rows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The column type this buffer encodes
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Text { .. } => ColumnType::Text,
            ColumnData::Number { .. } => ColumnType::Number,
            ColumnData::Boolean { .. } => ColumnType::Boolean,
            ColumnData::Datetime { .. } => ColumnType::Datetime,
        }
    }

    /// Decode one cell; the null mask wins over the value buffer
    pub fn value_at(&self, index: usize) -> Value {
        match self {
            ColumnData::Text { offsets, bytes } => {
                let start = offsets[index] as usize;
                let end = offsets[index + 1] as usize;
                Value::Text(String::from_utf8_lossy(&bytes[start..end]).into_owned())
            }
            ColumnData::Number { values, nulls } => {
                if is_null(nulls, index) {
                    Value::Null
                } else {
                    Value::Number(values[index])
                }
            }
            ColumnData::Boolean { values, nulls } => {
                if is_null(nulls, index) {
                    Value::Null
                } else {
                    Value::Boolean(values[index] != 0)
                }
            }
            ColumnData::Datetime { millis, nulls } => {
                if is_null(nulls, index) {
                    Value::Null
                } else {
                    Value::Datetime(millis[index] as i64)
                }
            }
        }
    }

    /// Approximate heap footprint, used for cache accounting
    pub fn approximate_size(&self) -> usize {
        match self {
            ColumnData::Text { offsets, bytes } => offsets.len() * 4 + bytes.len(),
            ColumnData::Number { values, nulls } => {
                values.len() * 8 + nulls.as_ref().map_or(0, Vec::len)
            }
            ColumnData::Boolean { values, nulls } => {
                values.len() + nulls.as_ref().map_or(0, Vec::len)
            }
            ColumnData::Datetime { millis, nulls } => {
                millis.len() * 8 + nulls.as_ref().map_or(0, Vec::len)
            }
        }
    }

    fn data_byte_length(&self) -> usize {
        match self {
            ColumnData::Text { bytes, .. } => bytes.len(),
            ColumnData::Number { values, .. } => values.len() * 8,
            ColumnData::Boolean { values, .. } => values.len(),
            ColumnData::Datetime { millis, .. } => millis.len() * 8,
        }
    }

    fn offsets_byte_length(&self) -> Option<usize> {
        match self {
            ColumnData::Text { offsets, .. } => Some(offsets.len() * 4),
            _ => None,
        }
    }

    fn null_mask_byte_length(&self) -> Option<usize> {
        match self {
            ColumnData::Text { .. } => None,
            ColumnData::Number { nulls, .. }
            | ColumnData::Boolean { nulls, .. }
            | ColumnData::Datetime { millis: _, nulls } => nulls.as_ref().map(Vec::len),
        }
    }
}

fn is_null(nulls: &Option<Vec<u8>>, index: usize) -> bool {
    nulls.as_ref().is_some_and(|mask| mask[index] != 0)
}

/// Cumulative ingestion counters carried on every batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    /// Rows parsed so far, this batch included
    pub rows_parsed: u64,
    /// Bytes consumed from the (decompressed) source so far
    pub bytes_parsed: u64,
    /// Whether this is the final flush
    pub eof: bool,
}

/// A contiguous run of rows stored as one typed buffer per column
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    /// Row ids, strictly increasing and contiguous
    pub row_ids: Vec<u32>,
    /// Column buffers in header order
    pub columns: Vec<(String, ColumnData)>,
    /// Cumulative ingestion counters
    pub stats: BatchStats,
}

impl RowBatch {
    /// First row id in the batch
    pub fn row_start(&self) -> u32 {
        self.row_ids.first().copied().unwrap_or(0)
    }

    /// Row count
    pub fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    /// Column types keyed by name
    pub fn column_types(&self) -> HashMap<String, ColumnType> {
        self.columns
            .iter()
            .map(|(name, data)| (name.clone(), data.column_type()))
            .collect()
    }

    /// Find a column buffer by name
    pub fn column(&self, name: &str) -> Option<&ColumnData> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, data)| data)
    }

    /// Materialize the row at a batch-local index
    pub fn row_at(&self, index: usize) -> Row {
        let mut values = HashMap::with_capacity(self.columns.len());
        for (name, data) in &self.columns {
            values.insert(name.clone(), data.value_at(index));
        }
        Row::new(self.row_ids[index], values)
    }

    /// Approximate heap footprint
    pub fn approximate_size(&self) -> usize {
        self.row_ids.len() * 4
            + self
                .columns
                .iter()
                .map(|(name, data)| name.len() + data.approximate_size())
                .sum::<usize>()
    }

    /// Validate the contiguity invariants
    pub fn validate(&self) -> Result<()> {
        for window in self.row_ids.windows(2) {
            if window[1] != window[0] + 1 {
                return Err(Error::corruption(format!(
                    "row ids are not contiguous at {}..{}",
                    window[0], window[1]
                )));
            }
        }
        for (name, data) in &self.columns {
            if data.len() != self.row_ids.len() {
                return Err(Error::corruption(format!(
                    "column {} has {} rows, batch has {}",
                    name,
                    data.len(),
                    self.row_ids.len()
                )));
            }
        }
        Ok(())
    }
}

/// JSON header preceding the binary payloads
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchHeader {
    version: u32,
    row_start: u32,
    row_count: u32,
    column_order: Vec<String>,
    columns: Vec<ColumnHeader>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ColumnHeader {
    name: String,
    #[serde(rename = "type")]
    column_type: ColumnType,
    data_byte_length: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    offsets_byte_length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    null_mask_byte_length: Option<u64>,
}

/// Serialize a batch into the stable on-disk layout
pub fn encode_batch(batch: &RowBatch) -> Result<Vec<u8>> {
    let header = BatchHeader {
        version: BATCH_FORMAT_VERSION,
        row_start: batch.row_start(),
        row_count: batch.row_count() as u32,
        column_order: batch.columns.iter().map(|(name, _)| name.clone()).collect(),
        columns: batch
            .columns
            .iter()
            .map(|(name, data)| ColumnHeader {
                name: name.clone(),
                column_type: data.column_type(),
                data_byte_length: data.data_byte_length() as u64,
                offsets_byte_length: data.offsets_byte_length().map(|n| n as u64),
                null_mask_byte_length: data.null_mask_byte_length().map(|n| n as u64),
            })
            .collect(),
    };
    let header_json = serde_json::to_vec(&header)?;

    let mut buf = BytesMut::with_capacity(
        4 + header_json.len() + batch.row_ids.len() * 4 + batch.approximate_size(),
    );
    buf.put_u32_le(header_json.len() as u32);
    buf.put_slice(&header_json);
    for row_id in &batch.row_ids {
        buf.put_u32_le(*row_id);
    }

    for (_, data) in &batch.columns {
        match data {
            ColumnData::Text { offsets, bytes } => {
                for offset in offsets {
                    buf.put_u32_le(*offset);
                }
                buf.put_slice(bytes);
            }
            ColumnData::Number { values, nulls } => {
                for value in values {
                    buf.put_f64_le(*value);
                }
                if let Some(mask) = nulls {
                    buf.put_slice(mask);
                }
            }
            ColumnData::Boolean { values, nulls } => {
                buf.put_slice(values);
                if let Some(mask) = nulls {
                    buf.put_slice(mask);
                }
            }
            ColumnData::Datetime { millis, nulls } => {
                for value in millis {
                    buf.put_f64_le(*value);
                }
                if let Some(mask) = nulls {
                    buf.put_slice(mask);
                }
            }
        }
    }

    Ok(buf.to_vec())
}

/// Deserialize a batch written by [`encode_batch`]
pub fn decode_batch(data: &[u8], stats: BatchStats) -> Result<RowBatch> {
    let mut buf = data;
    if buf.remaining() < 4 {
        return Err(Error::corruption("batch shorter than its header length"));
    }
    let header_len = buf.get_u32_le() as usize;
    if buf.remaining() < header_len {
        return Err(Error::corruption("batch header truncated"));
    }
    let header: BatchHeader = serde_json::from_slice(&buf[..header_len])?;
    buf.advance(header_len);

    if header.version != BATCH_FORMAT_VERSION {
        return Err(Error::corruption(format!(
            "unsupported batch format version {}",
            header.version
        )));
    }

    let row_count = header.row_count as usize;
    if buf.remaining() < row_count * 4 {
        return Err(Error::corruption("row-id array truncated"));
    }
    let mut row_ids = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        row_ids.push(buf.get_u32_le());
    }

    let mut columns = Vec::with_capacity(header.columns.len());
    for column in &header.columns {
        let data_len = column.data_byte_length as usize;
        let data = match column.column_type {
            ColumnType::Text => {
                let offsets_len = column.offsets_byte_length.unwrap_or(0) as usize;
                if offsets_len != (row_count + 1) * 4 || buf.remaining() < offsets_len + data_len {
                    return Err(Error::corruption(format!(
                        "string column {} payload truncated",
                        column.name
                    )));
                }
                let mut offsets = Vec::with_capacity(row_count + 1);
                for _ in 0..row_count + 1 {
                    offsets.push(buf.get_u32_le());
                }
                let bytes = buf[..data_len].to_vec();
                buf.advance(data_len);
                ColumnData::Text { offsets, bytes }
            }
            ColumnType::Number | ColumnType::Datetime => {
                if data_len != row_count * 8 || buf.remaining() < data_len {
                    return Err(Error::corruption(format!(
                        "numeric column {} payload truncated",
                        column.name
                    )));
                }
                let mut values = Vec::with_capacity(row_count);
                for _ in 0..row_count {
                    values.push(buf.get_f64_le());
                }
                let nulls = read_null_mask(&mut buf, column, row_count)?;
                if column.column_type == ColumnType::Number {
                    ColumnData::Number { values, nulls }
                } else {
                    ColumnData::Datetime {
                        millis: values,
                        nulls,
                    }
                }
            }
            ColumnType::Boolean => {
                if data_len != row_count || buf.remaining() < data_len {
                    return Err(Error::corruption(format!(
                        "boolean column {} payload truncated",
                        column.name
                    )));
                }
                let values = buf[..data_len].to_vec();
                buf.advance(data_len);
                let nulls = read_null_mask(&mut buf, column, row_count)?;
                ColumnData::Boolean { values, nulls }
            }
        };
        columns.push((column.name.clone(), data));
    }

    let batch = RowBatch {
        row_ids,
        columns,
        stats,
    };
    batch.validate()?;
    Ok(batch)
}

fn read_null_mask(
    buf: &mut &[u8],
    column: &ColumnHeader,
    row_count: usize,
) -> Result<Option<Vec<u8>>> {
    match column.null_mask_byte_length {
        None => Ok(None),
        Some(len) => {
            let len = len as usize;
            if len != row_count || buf.remaining() < len {
                return Err(Error::corruption(format!(
                    "null mask for column {} truncated",
                    column.name
                )));
            }
            let mask = buf[..len].to_vec();
            buf.advance(len);
            Ok(Some(mask))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch() -> RowBatch {
        RowBatch {
            row_ids: vec![10, 11, 12],
            columns: vec![
                (
                    "name".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Text,
                        &["Alice".to_string(), "".to_string(), "Carol".to_string()],
                    ),
                ),
                (
                    "age".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Number,
                        &["30".to_string(), "n/a".to_string(), "41.5".to_string()],
                    ),
                ),
                (
                    "active".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Boolean,
                        &["yes".to_string(), "no".to_string(), "".to_string()],
                    ),
                ),
                (
                    "seen".to_string(),
                    ColumnData::from_raw(
                        ColumnType::Datetime,
                        &[
                            "2021-01-02T03:04:05Z".to_string(),
                            "garbage".to_string(),
                            "2021-01-03".to_string(),
                        ],
                    ),
                ),
            ],
            stats: BatchStats {
                rows_parsed: 13,
                bytes_parsed: 512,
                eof: false,
            },
        }
    }

    #[test]
    fn test_typed_builders_null_out_failures() {
        let batch = sample_batch();
        assert_eq!(batch.column("age").unwrap().value_at(0), Value::Number(30.0));
        assert_eq!(batch.column("age").unwrap().value_at(1), Value::Null);
        assert_eq!(
            batch.column("active").unwrap().value_at(0),
            Value::Boolean(true)
        );
        assert_eq!(batch.column("active").unwrap().value_at(2), Value::Null);
        assert_eq!(
            batch.column("seen").unwrap().value_at(0),
            Value::Datetime(1_609_556_645_000)
        );
        assert_eq!(batch.column("seen").unwrap().value_at(1), Value::Null);
        // empty string cells stay empty text, not null
        assert_eq!(
            batch.column("name").unwrap().value_at(1),
            Value::Text(String::new())
        );
    }

    #[test]
    fn test_offsets_invariants() {
        let batch = sample_batch();
        if let Some(ColumnData::Text { offsets, bytes }) = batch.column("name") {
            assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(*offsets.last().unwrap() as usize, bytes.len());
        } else {
            panic!("name is a text column");
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch).unwrap();
        let decoded = decode_batch(&encoded, batch.stats).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_header_is_length_prefixed_json() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch).unwrap();
        let header_len = u32::from_le_bytes(encoded[..4].try_into().unwrap()) as usize;
        let header: serde_json::Value = serde_json::from_slice(&encoded[4..4 + header_len]).unwrap();
        assert_eq!(header["version"], 1);
        assert_eq!(header["rowStart"], 10);
        assert_eq!(header["rowCount"], 3);
        assert_eq!(header["columnOrder"][0], "name");
        assert_eq!(header["columns"][0]["type"], "string");
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch).unwrap();
        let err = decode_batch(&encoded[..encoded.len() - 4], batch.stats).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_row_materialization() {
        let batch = sample_batch();
        let row = batch.row_at(0);
        assert_eq!(row.row_id, 10);
        assert_eq!(row.get("name"), &Value::Text("Alice".to_string()));
        assert_eq!(row.get("age"), &Value::Number(30.0));
        assert_eq!(row.get("missing"), &Value::Null);
    }

    #[test]
    fn test_validate_catches_gaps() {
        let mut batch = sample_batch();
        batch.row_ids[2] = 99;
        assert!(batch.validate().is_err());
    }

    mod codec_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_text_codec_round_trips(cells in proptest::collection::vec(".*", 1..20)) {
                let batch = RowBatch {
                    row_ids: (0..cells.len() as u32).collect(),
                    columns: vec![(
                        "c".to_string(),
                        ColumnData::from_raw(ColumnType::Text, &cells),
                    )],
                    stats: BatchStats::default(),
                };
                let encoded = encode_batch(&batch).unwrap();
                let decoded = decode_batch(&encoded, batch.stats).unwrap();
                prop_assert_eq!(decoded, batch);
            }

            #[test]
            fn prop_number_cells_survive_or_null(cells in proptest::collection::vec("-?[0-9]{0,12}", 1..20)) {
                let data = ColumnData::from_raw(ColumnType::Number, &cells);
                for (i, cell) in cells.iter().enumerate() {
                    match cell.trim().parse::<f64>() {
                        Ok(n) if n.is_finite() => prop_assert_eq!(data.value_at(i), Value::Number(n)),
                        _ => prop_assert_eq!(data.value_at(i), Value::Null),
                    }
                }
            }
        }
    }
}
