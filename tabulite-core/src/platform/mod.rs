//! Platform abstraction layer

use std::path::Path;
use std::sync::Arc;

use crate::types::FileFingerprint;
use crate::Result;

pub mod fs;

pub use fs::{DiskBackend, MemoryBackend, StorageBackend};

/// Platform abstraction: the storage capability plus source-file
/// metadata access
#[derive(Debug, Clone)]
pub struct Platform {
    backend: Arc<dyn StorageBackend>,
}

impl Platform {
    /// Platform over a disk-backed private directory
    pub async fn open(private_dir: &Path) -> Result<Self> {
        let backend = DiskBackend::open(private_dir.to_path_buf()).await?;
        Ok(Self {
            backend: Arc::new(backend),
        })
    }

    /// Memory-only platform (nothing survives the process)
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
        }
    }

    /// Platform over an explicit backend
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// The storage capability
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Stat a source file into its fingerprint
    pub async fn fingerprint(&self, path: &Path) -> Result<FileFingerprint> {
        let metadata = tokio::fs::metadata(path).await?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
        Ok(FileFingerprint {
            file_name,
            file_size: metadata.len(),
            last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fingerprint_from_metadata() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("data.csv");
        tokio::fs::write(&file, b"a,b\n1,2\n").await.unwrap();

        let platform = Platform::in_memory();
        let fp = platform.fingerprint(&file).await.unwrap();
        assert_eq!(fp.file_name, "data.csv");
        assert_eq!(fp.file_size, 8);
        assert!(fp.last_modified > 0);
    }
}
