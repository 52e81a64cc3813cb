//! Streaming delimited-text parser
//!
//! A byte-level state machine over an async chunk source. Fields are
//! accumulated as raw bytes and decoded per field, so malformed UTF-8
//! degrades to replacement characters and multi-byte characters may
//! split across chunks freely. The parser owns type inference and
//! batching: completed rows feed the per-column inferencers, and every
//! `batch_size` rows a typed [`RowBatch`] goes to the sink. Checkpoint
//! events carry the byte offset at which a row's first field began.

pub mod datetime;
pub mod infer;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use flate2::write::MultiGzDecoder;
use std::io::Write;
use tokio::io::AsyncReadExt;

use crate::config::ParserConfig;
use crate::error::Error;
use crate::storage::batch::{BatchStats, ColumnData, RowBatch};
use crate::Result;

pub use infer::{ColumnInference, TypeResolution};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Delimiters considered by autodetection, in tie-break order
const DELIMITER_CANDIDATES: [u8; 3] = [b',', b'\t', b';'];

/// Async byte-chunk source
#[async_trait]
pub trait ByteSource: Send {
    /// Next chunk, `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Chunked reads from a file on disk
#[derive(Debug)]
pub struct FileSource {
    file: tokio::fs::File,
    chunk_size: usize,
}

impl FileSource {
    /// Open a file for chunked reading
    pub async fn open(path: &std::path::Path, chunk_size: usize) -> Result<Self> {
        Ok(Self {
            file: tokio::fs::File::open(path).await?,
            chunk_size: chunk_size.max(1),
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        while buf.len() < self.chunk_size {
            let read = self.file.read_buf(&mut buf).await?;
            if read == 0 {
                break;
            }
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

/// In-memory source for tests and non-file transports
#[derive(Debug)]
pub struct MemorySource {
    chunks: std::collections::VecDeque<Bytes>,
}

impl MemorySource {
    /// Source yielding the given bytes as one chunk
    pub fn new(data: impl Into<Bytes>) -> Self {
        let mut chunks = std::collections::VecDeque::new();
        let data = data.into();
        if !data.is_empty() {
            chunks.push_back(data);
        }
        Self { chunks }
    }

    /// Source yielding each piece as its own chunk
    pub fn chunked(pieces: Vec<Vec<u8>>) -> Self {
        Self {
            chunks: pieces.into_iter().map(Bytes::from).collect(),
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Decompressing wrapper for gzip sources, fed chunk by chunk
pub struct GzipSource<S> {
    inner: S,
    decoder: Option<MultiGzDecoder<Vec<u8>>>,
}

impl<S: ByteSource> GzipSource<S> {
    /// Wrap a compressed source
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: Some(MultiGzDecoder::new(Vec::new())),
        }
    }
}

#[async_trait]
impl<S: ByteSource> ByteSource for GzipSource<S> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.inner.next_chunk().await? {
                Some(chunk) => {
                    let Some(decoder) = self.decoder.as_mut() else {
                        return Ok(None);
                    };
                    decoder
                        .write_all(&chunk)
                        .map_err(|e| Error::parse(format!("gzip decode failed: {}", e)))?;
                    let out = std::mem::take(decoder.get_mut());
                    if !out.is_empty() {
                        return Ok(Some(Bytes::from(out)));
                    }
                    // not enough compressed input yet, read more
                }
                None => {
                    let Some(decoder) = self.decoder.take() else {
                        return Ok(None);
                    };
                    let tail = decoder
                        .finish()
                        .map_err(|e| Error::parse(format!("gzip stream truncated: {}", e)))?;
                    if tail.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(Bytes::from(tail)));
                }
            }
        }
    }
}

/// Whether a file name announces a gzip-compressed source
pub fn is_gzip_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".csv.gz") || lower.ends_with(".tsv.gz") || lower.ends_with(".gzip")
}

/// Receiver of parse events, in strict order: one header, then
/// batches with interleaved checkpoints
#[async_trait]
pub trait ParseSink: Send {
    /// The normalized header, exactly once, before any batch
    async fn on_header(&mut self, columns: &[String]) -> Result<()>;

    /// A flushed batch plus the inference states behind it, in header
    /// column order
    async fn on_batch(&mut self, batch: RowBatch, inference: &[ColumnInference]) -> Result<()>;

    /// A row-offset checkpoint
    async fn on_checkpoint(&mut self, row_index: u64, byte_offset: u64) -> Result<()>;
}

/// Synchronous per-row tap, fed normalized cells during parsing
pub trait RowObserver: Send {
    /// Observe one data row
    fn observe_row(&mut self, row_id: u64, values: &[String]);
}

/// Per-parse options resolved from the load request
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Explicit delimiter; autodetected from the first line when unset
    pub delimiter: Option<u8>,
    /// Rows per flushed batch
    pub batch_size: usize,
    /// Rows between checkpoints
    pub checkpoint_interval: u32,
}

impl ParseOptions {
    /// Resolve options against the engine configuration
    pub fn resolve(
        config: &ParserConfig,
        delimiter: Option<u8>,
        batch_size: Option<usize>,
        checkpoint_interval: Option<u32>,
    ) -> Self {
        Self {
            delimiter,
            batch_size: batch_size.unwrap_or(config.batch_size).max(1),
            checkpoint_interval: checkpoint_interval.unwrap_or(config.checkpoint_interval).max(1),
        }
    }
}

/// Parse totals returned by [`DelimitedParser::run`]
#[derive(Debug, Clone)]
pub struct ParseSummary {
    /// Normalized header (empty when the source had no rows)
    pub columns: Vec<String>,
    /// Resolved type per column, in header order
    pub column_types: Vec<TypeResolution>,
    /// Data rows parsed
    pub rows_parsed: u64,
    /// Bytes consumed from the (decompressed) source
    pub bytes_parsed: u64,
}

/// A completed raw row and where it began
#[derive(Debug)]
struct RowEvent {
    cells: Vec<String>,
    start_offset: u64,
}

/// Streaming state machine over one source
pub struct DelimitedParser {
    options: ParseOptions,

    // byte-level state
    delimiter: Option<u8>,
    in_quotes: bool,
    quote_escape_pending: bool,
    skip_next_lf: bool,
    at_start: bool,
    start_buf: Vec<u8>,
    detect_buf: Vec<u8>,
    field: Vec<u8>,
    row: Vec<String>,
    current_row_start: Option<u64>,
    bytes_parsed: u64,

    // row-level state
    header: Option<Vec<String>>,
    inference: Vec<ColumnInference>,
    raw_columns: Vec<Vec<String>>,
    frozen_types: Option<Vec<TypeResolution>>,
    batch_start_row: u64,
    rows_parsed: u64,
}

impl DelimitedParser {
    /// Create a parser with the given options
    pub fn new(options: ParseOptions) -> Self {
        Self {
            delimiter: options.delimiter,
            options,
            in_quotes: false,
            quote_escape_pending: false,
            skip_next_lf: false,
            at_start: true,
            start_buf: Vec::new(),
            detect_buf: Vec::new(),
            field: Vec::new(),
            row: Vec::new(),
            current_row_start: None,
            bytes_parsed: 0,
            header: None,
            inference: Vec::new(),
            raw_columns: Vec::new(),
            frozen_types: None,
            batch_start_row: 0,
            rows_parsed: 0,
        }
    }

    /// Drive the source to EOF, emitting events into the sink
    pub async fn run(
        &mut self,
        source: &mut dyn ByteSource,
        sink: &mut dyn ParseSink,
        mut observer: Option<&mut dyn RowObserver>,
    ) -> Result<ParseSummary> {
        let mut events = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            self.push_chunk(&chunk, &mut events);
            self.dispatch(&mut events, sink, &mut observer).await?;
        }
        self.finish_bytes(&mut events);
        self.dispatch(&mut events, sink, &mut observer).await?;
        self.flush(sink, true).await?;

        if self.frozen_types.is_none() {
            if let Some(header) = &self.header {
                self.frozen_types = Some(
                    (0..header.len())
                        .map(|i| self.inference[i].resolve())
                        .collect(),
                );
            }
        }

        Ok(ParseSummary {
            columns: self.header.clone().unwrap_or_default(),
            column_types: self.frozen_types.clone().unwrap_or_default(),
            rows_parsed: self.rows_parsed,
            bytes_parsed: self.bytes_parsed,
        })
    }

    /// Inference states in header column order
    pub fn inference(&self) -> &[ColumnInference] {
        &self.inference
    }

    fn push_chunk(&mut self, chunk: &[u8], events: &mut Vec<RowEvent>) {
        if self.at_start {
            self.start_buf.extend_from_slice(chunk);
            if self.start_buf.len() < UTF8_BOM.len() {
                return;
            }
            self.consume_start(events);
            return;
        }
        self.ingest(chunk.to_vec(), events);
    }

    fn consume_start(&mut self, events: &mut Vec<RowEvent>) {
        self.at_start = false;
        let buffered = std::mem::take(&mut self.start_buf);
        if buffered.starts_with(&UTF8_BOM) {
            // the BOM is skipped but its bytes still count
            self.bytes_parsed += UTF8_BOM.len() as u64;
            self.ingest(buffered[UTF8_BOM.len()..].to_vec(), events);
        } else {
            self.ingest(buffered, events);
        }
    }

    fn ingest(&mut self, data: Vec<u8>, events: &mut Vec<RowEvent>) {
        if self.delimiter.is_some() {
            self.scan(&data, events);
            return;
        }
        self.detect_buf.extend_from_slice(&data);
        let has_break = self
            .detect_buf
            .iter()
            .any(|&b| b == b'\n' || b == b'\r');
        if has_break {
            self.freeze_delimiter();
            let buffered = std::mem::take(&mut self.detect_buf);
            self.scan(&buffered, events);
        }
    }

    /// Tally candidate delimiters up to the first line break; the
    /// maximum wins, comma on ties
    fn freeze_delimiter(&mut self) {
        let first_line = self
            .detect_buf
            .iter()
            .position(|&b| b == b'\n' || b == b'\r')
            .map(|pos| &self.detect_buf[..pos])
            .unwrap_or(&self.detect_buf);
        let mut best = b',';
        let mut best_count = 0usize;
        for candidate in DELIMITER_CANDIDATES {
            let count = first_line.iter().filter(|&&b| b == candidate).count();
            if count > best_count {
                best = candidate;
                best_count = count;
            }
        }
        self.delimiter = Some(best);
    }

    fn scan(&mut self, bytes: &[u8], events: &mut Vec<RowEvent>) {
        let delimiter = self.delimiter.unwrap_or(b',');
        for &b in bytes {
            if self.skip_next_lf {
                self.skip_next_lf = false;
                if b == b'\n' {
                    self.bytes_parsed += 1;
                    continue;
                }
            }
            if self.current_row_start.is_none() {
                self.current_row_start = Some(self.bytes_parsed);
            }
            self.bytes_parsed += 1;

            if self.quote_escape_pending {
                self.quote_escape_pending = false;
                if b == b'"' {
                    // doubled quote inside a quoted field
                    self.field.push(b'"');
                    continue;
                }
                self.in_quotes = false;
            }

            if self.in_quotes {
                if b == b'"' {
                    self.quote_escape_pending = true;
                } else {
                    self.field.push(b);
                }
                continue;
            }

            if b == b'"' {
                self.in_quotes = true;
            } else if b == delimiter {
                self.end_field();
            } else if b == b'\n' {
                self.end_row(events);
            } else if b == b'\r' {
                self.end_row(events);
                self.skip_next_lf = true;
            } else {
                self.field.push(b);
            }
        }
    }

    fn finish_bytes(&mut self, events: &mut Vec<RowEvent>) {
        if self.at_start {
            self.consume_start(events);
        }
        if self.delimiter.is_none() {
            // sources with no line break at all still get a delimiter
            self.freeze_delimiter();
            let buffered = std::mem::take(&mut self.detect_buf);
            self.scan(&buffered, events);
        }
        // an unterminated quote at EOF closes silently
        self.quote_escape_pending = false;
        self.in_quotes = false;
        if !self.field.is_empty() || !self.row.is_empty() {
            self.end_row(events);
        }
    }

    fn end_field(&mut self) {
        let cell = String::from_utf8_lossy(&self.field).into_owned();
        self.field.clear();
        self.row.push(cell);
    }

    fn end_row(&mut self, events: &mut Vec<RowEvent>) {
        self.end_field();
        let cells = std::mem::take(&mut self.row);
        let start_offset = self.current_row_start.take().unwrap_or(self.bytes_parsed);
        events.push(RowEvent {
            cells,
            start_offset,
        });
    }

    async fn dispatch(
        &mut self,
        events: &mut Vec<RowEvent>,
        sink: &mut dyn ParseSink,
        observer: &mut Option<&mut dyn RowObserver>,
    ) -> Result<()> {
        for event in events.drain(..) {
            let Some(header_len) = self.header.as_ref().map(Vec::len) else {
                let header = normalize_header(&event.cells);
                self.inference = vec![ColumnInference::default(); header.len()];
                self.raw_columns = vec![Vec::new(); header.len()];
                sink.on_header(&header).await?;
                self.header = Some(header);
                continue;
            };

            // pad short rows, truncate long ones; nothing is dropped
            let mut cells = event.cells;
            cells.truncate(header_len);
            cells.resize(header_len, String::new());

            let row_id = self.rows_parsed;
            if row_id % self.options.checkpoint_interval as u64 == 0 {
                sink.on_checkpoint(row_id, event.start_offset).await?;
            }

            for (inference, cell) in self.inference.iter_mut().zip(&cells) {
                inference.observe(cell);
            }
            if let Some(observer) = observer.as_mut() {
                observer.observe_row(row_id, &cells);
            }
            for (column, cell) in self.raw_columns.iter_mut().zip(cells) {
                column.push(cell);
            }
            self.rows_parsed += 1;

            if self.raw_columns[0].len() >= self.options.batch_size {
                self.flush(sink, false).await?;
            }
        }
        Ok(())
    }

    async fn flush(&mut self, sink: &mut dyn ParseSink, eof: bool) -> Result<()> {
        let Some(header) = self.header.clone() else {
            return Ok(());
        };
        let count = self.raw_columns.first().map_or(0, Vec::len);
        if count == 0 {
            return Ok(());
        }

        // types freeze at the first flush and hold for the parse
        let types: Vec<TypeResolution> = match &self.frozen_types {
            Some(types) => types.clone(),
            None => {
                let resolved: Vec<TypeResolution> = (0..header.len())
                    .map(|i| self.inference[i].resolve())
                    .collect();
                self.frozen_types = Some(resolved.clone());
                resolved
            }
        };

        let columns = header
            .iter()
            .zip(types)
            .zip(self.raw_columns.iter_mut())
            .map(|((name, resolution), raw)| {
                let data = ColumnData::from_raw(resolution.column_type, raw);
                raw.clear();
                (name.clone(), data)
            })
            .collect();

        let batch = RowBatch {
            row_ids: (self.batch_start_row as u32..(self.batch_start_row + count as u64) as u32)
                .collect(),
            columns,
            stats: BatchStats {
                rows_parsed: self.rows_parsed,
                bytes_parsed: self.bytes_parsed,
                eof,
            },
        };
        self.batch_start_row += count as u64;
        sink.on_batch(batch, &self.inference).await
    }
}

/// Normalize header cells: blank names become `column_{n}` (1-based),
/// duplicates get deterministic `_2`, `_3`, ... suffixes
pub fn normalize_header(cells: &[String]) -> Vec<String> {
    let mut used: HashMap<String, u32> = HashMap::new();
    let mut names = Vec::with_capacity(cells.len());
    for (i, cell) in cells.iter().enumerate() {
        let trimmed = cell.trim();
        let base = if trimmed.is_empty() {
            format!("column_{}", i + 1)
        } else {
            trimmed.to_string()
        };
        let name = match used.get(&base) {
            None => base.clone(),
            Some(_) => {
                let mut n = 2;
                loop {
                    let candidate = format!("{}_{}", base, n);
                    if !used.contains_key(&candidate) {
                        break candidate;
                    }
                    n += 1;
                }
            }
        };
        used.insert(base, 1);
        used.insert(name.clone(), 1);
        names.push(name);
    }
    names
}
