//! Storage backend capability
//!
//! Auxiliary stores (spilled batches, row-offset indexes, fuzzy and
//! annotation snapshots) go through this capability so tests can
//! substitute an in-memory backend. The disk backend writes through a
//! temp file and an atomic rename.

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs;

use crate::{error::Error, Result};

/// Durable key-addressable storage: named files inside named directories
#[async_trait]
pub trait StorageBackend: Debug + Send + Sync {
    /// Read a file, `None` if absent
    async fn read(&self, dir: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Write a file so readers never observe a partial write
    async fn write_atomic(&self, dir: &str, name: &str, contents: &[u8]) -> Result<()>;

    /// Remove a file; absent files are not an error
    async fn remove(&self, dir: &str, name: &str) -> Result<()>;

    /// List file names inside a directory
    async fn list(&self, dir: &str) -> Result<Vec<String>>;

    /// Remove a directory and everything in it
    async fn remove_dir(&self, dir: &str) -> Result<()>;

    /// Whether writes survive the process (memory-only fallback: false)
    fn is_durable(&self) -> bool;
}

/// Disk-backed store rooted at a private directory
#[derive(Debug)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    /// Create a backend rooted at `root`, creating it if needed
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn dir_path(&self, dir: &str) -> PathBuf {
        self.root.join(dir)
    }
}

#[async_trait]
impl StorageBackend for DiskBackend {
    async fn read(&self, dir: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir_path(dir).join(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn write_atomic(&self, dir: &str, name: &str, contents: &[u8]) -> Result<()> {
        let dir_path = self.dir_path(dir);
        fs::create_dir_all(&dir_path).await?;

        let tmp_path = dir_path.join(format!("{}.tmp", name));
        let final_path = dir_path.join(name);

        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn remove(&self, dir: &str, name: &str) -> Result<()> {
        let path = self.dir_path(dir).join(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(self.dir_path(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Error::from(e)),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn remove_dir(&self, dir: &str) -> Result<()> {
        match fs::remove_dir_all(self.dir_path(dir)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

/// Memory-only fallback used when no private filesystem is available
/// and by tests
#[derive(Debug, Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, dir: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .read()
            .get(dir)
            .and_then(|d| d.get(name))
            .cloned())
    }

    async fn write_atomic(&self, dir: &str, name: &str, contents: &[u8]) -> Result<()> {
        self.files
            .write()
            .entry(dir.to_string())
            .or_default()
            .insert(name.to_string(), contents.to_vec());
        Ok(())
    }

    async fn remove(&self, dir: &str, name: &str) -> Result<()> {
        if let Some(d) = self.files.write().get_mut(dir) {
            d.remove(name);
        }
        Ok(())
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .files
            .read()
            .get(dir)
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn remove_dir(&self, dir: &str) -> Result<()> {
        self.files.write().remove(dir);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
