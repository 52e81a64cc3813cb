//! Row-offset checkpoint index
//!
//! Periodic `(rowIndex, byteOffset)` checkpoints let a caller seek to
//! the nearest preceding row without re-parsing the whole file. The
//! on-disk format is a little-endian u32 array: a five-word header
//! `[version, checkpointInterval, rowCount, entryCount, bytesParsed]`
//! followed by the entry pairs.

use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::platform::StorageBackend;
use crate::Result;

/// On-disk row-index format version
pub const ROW_INDEX_VERSION: u32 = 1;

/// Backend directory holding row-offset indexes
pub const ROW_INDEX_DIR: &str = "row-index";

/// One checkpoint: a row and the byte position where it starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    /// Row index the checkpoint refers to
    pub row_index: u32,
    /// Byte position at which that row's first field began
    pub byte_offset: u32,
}

/// A loaded row-offset index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOffsetIndex {
    /// Rows between checkpoints when the index was written
    pub checkpoint_interval: u32,
    /// Total rows parsed when the index was finalized
    pub row_count: u32,
    /// Total bytes parsed when the index was finalized
    pub bytes_parsed: u32,
    /// Checkpoints, strictly increasing in both fields
    pub entries: Vec<CheckpointEntry>,
}

impl RowOffsetIndex {
    /// Serialize into the stable u32-LE layout
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(20 + self.entries.len() * 8);
        buf.put_u32_le(ROW_INDEX_VERSION);
        buf.put_u32_le(self.checkpoint_interval);
        buf.put_u32_le(self.row_count);
        buf.put_u32_le(self.entries.len() as u32);
        buf.put_u32_le(self.bytes_parsed);
        for entry in &self.entries {
            buf.put_u32_le(entry.row_index);
            buf.put_u32_le(entry.byte_offset);
        }
        buf.to_vec()
    }

    /// Deserialize an index written by [`RowOffsetIndex::encode`]
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        if buf.remaining() < 20 {
            return Err(Error::corruption("row index shorter than its header"));
        }
        let version = buf.get_u32_le();
        if version != ROW_INDEX_VERSION {
            return Err(Error::corruption(format!(
                "unsupported row index version {}",
                version
            )));
        }
        let checkpoint_interval = buf.get_u32_le();
        let row_count = buf.get_u32_le();
        let entry_count = buf.get_u32_le() as usize;
        let bytes_parsed = buf.get_u32_le();
        if buf.remaining() < entry_count * 8 {
            return Err(Error::corruption("row index entries truncated"));
        }
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(CheckpointEntry {
                row_index: buf.get_u32_le(),
                byte_offset: buf.get_u32_le(),
            });
        }
        for window in entries.windows(2) {
            if window[1].row_index <= window[0].row_index
                || window[1].byte_offset < window[0].byte_offset
            {
                return Err(Error::corruption("row index entries are not increasing"));
            }
        }
        Ok(Self {
            checkpoint_interval,
            row_count,
            bytes_parsed,
            entries,
        })
    }

    /// Checkpoints serving a read of `row_count` rows from `start_row`:
    /// the nearest preceding checkpoint first, then every checkpoint
    /// strictly inside the window
    pub fn seek(&self, start_row: u32, row_count: u32) -> Vec<CheckpointEntry> {
        let mut out = Vec::new();
        if let Some(start) = find_nearest_checkpoint(&self.entries, start_row) {
            out.push(*start);
        }
        let end = start_row.saturating_add(row_count);
        for entry in &self.entries {
            if entry.row_index > start_row && entry.row_index < end {
                out.push(*entry);
            }
        }
        out
    }
}

/// Greatest checkpoint with `row_index <= target_row`
pub fn find_nearest_checkpoint(
    entries: &[CheckpointEntry],
    target_row: u32,
) -> Option<&CheckpointEntry> {
    let mut lo = 0usize;
    let mut hi = entries.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if entries[mid].row_index <= target_row {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.checked_sub(1).map(|i| &entries[i])
}

/// Buffering writer finalized with one atomic overwrite
#[derive(Debug)]
pub struct RowIndexWriter {
    backend: Arc<dyn StorageBackend>,
    file_name: String,
    checkpoint_interval: u32,
    entries: Vec<CheckpointEntry>,
    finished: bool,
}

/// Totals handed to [`RowIndexWriter::finalize`]
#[derive(Debug, Clone, Copy)]
pub struct RowIndexSummary {
    /// Total rows parsed
    pub row_count: u64,
    /// Total bytes parsed
    pub bytes_parsed: u64,
}

impl RowIndexWriter {
    /// Create a writer for one source file key
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        store_key: &str,
        checkpoint_interval: u32,
    ) -> Self {
        Self {
            backend,
            file_name: format!("{}.bin", store_key),
            checkpoint_interval,
            entries: Vec::new(),
            finished: false,
        }
    }

    /// Buffer one checkpoint
    pub fn record(&mut self, row_index: u64, byte_offset: u64) {
        if self.finished {
            return;
        }
        // the u32 wire format cannot address past 4GiB; later
        // checkpoints are dropped rather than wrapped
        if let (Ok(row), Ok(offset)) = (u32::try_from(row_index), u32::try_from(byte_offset)) {
            self.entries.push(CheckpointEntry {
                row_index: row,
                byte_offset: offset,
            });
        }
    }

    /// Buffered entry count
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Atomically overwrite the index file with the buffered entries
    pub async fn finalize(&mut self, summary: RowIndexSummary) -> Result<()> {
        let index = RowOffsetIndex {
            checkpoint_interval: self.checkpoint_interval,
            row_count: u32::try_from(summary.row_count).unwrap_or(u32::MAX),
            bytes_parsed: u32::try_from(summary.bytes_parsed).unwrap_or(u32::MAX),
            entries: std::mem::take(&mut self.entries),
        };
        self.finished = true;
        self.backend
            .write_atomic(ROW_INDEX_DIR, &self.file_name, &index.encode())
            .await
    }

    /// Drop buffered entries without touching any prior index file
    pub fn abort(&mut self) {
        self.entries.clear();
        self.finished = true;
    }
}

/// Load the row-offset index for a source file key, if one exists
pub async fn load_row_index(
    backend: &Arc<dyn StorageBackend>,
    store_key: &str,
) -> Result<Option<RowOffsetIndex>> {
    match backend
        .read(ROW_INDEX_DIR, &format!("{}.bin", store_key))
        .await?
    {
        Some(bytes) => Ok(Some(RowOffsetIndex::decode(&bytes)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryBackend;

    fn entry(row_index: u32, byte_offset: u32) -> CheckpointEntry {
        CheckpointEntry {
            row_index,
            byte_offset,
        }
    }

    fn sample_index() -> RowOffsetIndex {
        RowOffsetIndex {
            checkpoint_interval: 50_000,
            row_count: 175_000,
            bytes_parsed: 9_000_000,
            entries: vec![
                entry(0, 12),
                entry(50_000, 2_600_000),
                entry(100_000, 5_100_000),
                entry(150_000, 7_700_000),
            ],
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let index = sample_index();
        let decoded = RowOffsetIndex::decode(&index.encode()).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_header_words() {
        let encoded = sample_index().encode();
        let word = |i: usize| u32::from_le_bytes(encoded[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(word(0), 1); // version
        assert_eq!(word(1), 50_000);
        assert_eq!(word(2), 175_000);
        assert_eq!(word(3), 4); // entry count
        assert_eq!(word(4), 9_000_000);
    }

    #[test]
    fn test_nearest_checkpoint() {
        let index = sample_index();
        assert_eq!(
            find_nearest_checkpoint(&index.entries, 120_000),
            Some(&entry(100_000, 5_100_000))
        );
        assert_eq!(
            find_nearest_checkpoint(&index.entries, 50_000),
            Some(&entry(50_000, 2_600_000))
        );
        assert_eq!(find_nearest_checkpoint(&[], 10), None);
    }

    #[test]
    fn test_seek_window() {
        let index = sample_index();
        // nearest preceding first, then interior checkpoints
        let hits = index.seek(120_000, 40_000);
        assert_eq!(
            hits,
            vec![entry(100_000, 5_100_000), entry(150_000, 7_700_000)]
        );
        // window that starts on a checkpoint does not repeat it
        let hits = index.seek(100_000, 100);
        assert_eq!(hits, vec![entry(100_000, 5_100_000)]);
    }

    #[test]
    fn test_decode_rejects_non_increasing() {
        let mut index = sample_index();
        index.entries[2] = entry(40_000, 5_100_000);
        assert!(RowOffsetIndex::decode(&index.encode()).is_err());
    }

    #[tokio::test]
    async fn test_writer_finalize_and_reload() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let mut writer = RowIndexWriter::new(backend.clone(), "data.csv-1-2", 50_000);
        writer.record(0, 12);
        writer.record(50_000, 2_600_000);
        writer
            .finalize(RowIndexSummary {
                row_count: 60_000,
                bytes_parsed: 3_000_000,
            })
            .await
            .unwrap();

        let index = load_row_index(&backend, "data.csv-1-2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index.row_count, 60_000);
        assert_eq!(index.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_abort_preserves_prior_file() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let mut writer = RowIndexWriter::new(backend.clone(), "k", 50_000);
        writer.record(0, 0);
        writer
            .finalize(RowIndexSummary {
                row_count: 10,
                bytes_parsed: 100,
            })
            .await
            .unwrap();

        let mut second = RowIndexWriter::new(backend.clone(), "k", 50_000);
        second.record(0, 0);
        second.record(50_000, 999);
        second.abort();
        assert_eq!(second.entry_count(), 0);

        // the first finalized index is still intact
        let index = load_row_index(&backend, "k").await.unwrap().unwrap();
        assert_eq!(index.row_count, 10);
    }
}
