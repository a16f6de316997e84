//! Layer cache file storage
//!
//! Layer builds are written to opaque, uniquely named files in the cache
//! directory. A build without a source map is stored as the raw bytes. A build
//! with a source map is stored as a small record: a magic header and a format
//! version followed by the `bincode` encoding of the record.
//!
//! Superseded files are deleted after a grace period so readers that looked up
//! the old file name just before it was superseded can still open it.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::core::AggrError;
use crate::utils::{atomic_write, ensure_dir};

/// Magic bytes identifying an externalized record.
const RECORD_MAGIC: [u8; 4] = *b"AGLR";

/// Current record format version.
const RECORD_FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = RECORD_MAGIC.len() + 4;

/// Creates, reads and deletes layer cache files.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    dir: PathBuf,
    delete_delay: Duration,
}

impl CacheStorage {
    /// Storage rooted at `dir`. Files superseded via
    /// [`delete_file_delayed`](Self::delete_file_delayed) are removed after
    /// `delete_delay`.
    pub fn new(dir: impl Into<PathBuf>, delete_delay: Duration) -> Self {
        Self {
            dir: dir.into(),
            delete_delay,
        }
    }

    /// Directory holding the cache files.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    /// Grace period for delayed deletes.
    #[must_use]
    pub const fn delete_delay(&self) -> Duration {
        self.delete_delay
    }

    /// Path of a cache file.
    #[must_use]
    pub fn path_of(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn unique_name(prefix: &str) -> String {
        format!("{prefix}{}.cache", uuid::Uuid::new_v4().simple())
    }

    /// Write `data` to a new file and return its name.
    pub async fn create_cache_file(&self, prefix: &str, data: &[u8]) -> Result<String> {
        ensure_dir(&self.dir).await?;
        let filename = Self::unique_name(prefix);
        atomic_write(&self.path_of(&filename), data).await?;
        tracing::trace!(target: "layer_cache", "Created cache file {}", filename);
        Ok(filename)
    }

    /// Serialize `value` into a new record file and return its name.
    pub async fn externalize<T: Serialize>(&self, prefix: &str, value: &T) -> Result<String> {
        let payload = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .context("Failed to encode cache record")?;

        let mut output = Vec::with_capacity(HEADER_LEN + payload.len());
        output.extend_from_slice(&RECORD_MAGIC);
        output.extend_from_slice(&RECORD_FORMAT_VERSION.to_le_bytes());
        output.extend_from_slice(&payload);

        self.create_cache_file(prefix, &output).await
    }

    /// Read a raw cache file.
    pub async fn read_file(&self, filename: &str) -> Result<Vec<u8>> {
        let path = self.path_of(filename);
        fs::read(&path)
            .await
            .with_context(|| format!("Failed to read cache file {}", path.display()))
    }

    /// Read a record written by [`externalize`](Self::externalize).
    ///
    /// A truncated or malformed record is an error; it is never returned as
    /// partial data.
    pub async fn read_externalized<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let raw = self.read_file(filename).await?;
        Ok(decode_record(filename, &raw)?)
    }

    /// Delete `filename` after the grace period.
    ///
    /// Outside a Tokio runtime there is nothing to run the delayed delete on, so
    /// the file is deleted immediately and `None` is returned.
    pub fn delete_file_delayed(&self, filename: String) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            self.delete_file_blocking(&filename);
            return None;
        };
        let storage = self.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(storage.delete_delay).await;
            if let Err(e) = storage.delete_file_now(&filename).await {
                tracing::warn!(target: "layer_cache", "{:#}", e);
            }
        }))
    }

    fn delete_file_blocking(&self, filename: &str) {
        match std::fs::remove_file(self.path_of(filename)) {
            Ok(()) => tracing::debug!(target: "layer_cache", "Deleted cache file {}", filename),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(target: "layer_cache", "Failed to delete cache file {}: {}", filename, e);
            }
        }
    }

    /// Delete `filename` now. A file that is already gone is not an error.
    pub async fn delete_file_now(&self, filename: &str) -> Result<()> {
        let path = self.path_of(filename);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(target: "layer_cache", "Deleted cache file {}", filename);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete cache file {}", path.display()))
            }
        }
    }

    /// Delete every cache file. Returns the number of files removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to list cache dir {}", self.dir.display()));
            }
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "cache") {
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to delete {}", path.display()))?;
                removed += 1;
            }
        }
        tracing::info!(target: "layer_cache", "Removed {} cache files", removed);
        Ok(removed)
    }
}

fn decode_record<T: DeserializeOwned>(filename: &str, raw: &[u8]) -> Result<T, AggrError> {
    let corrupt = |reason: String| AggrError::CorruptCacheRecord {
        filename: filename.to_string(),
        reason,
    };

    if raw.len() < HEADER_LEN {
        return Err(corrupt(format!("record is {} bytes, shorter than its header", raw.len())));
    }
    if raw[..RECORD_MAGIC.len()] != RECORD_MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&raw[RECORD_MAGIC.len()..HEADER_LEN]);
    let version = u32::from_le_bytes(version);
    if version != RECORD_FORMAT_VERSION {
        return Err(corrupt(format!("unsupported format version {version}")));
    }

    let (value, read) = bincode::serde::decode_from_slice(&raw[HEADER_LEN..], bincode::config::standard())
        .map_err(|e| corrupt(e.to_string()))?;
    if read != raw.len() - HEADER_LEN {
        return Err(corrupt("trailing bytes after record".to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        content: Vec<u8>,
        source_map: String,
    }

    fn storage(temp: &TempDir, delay: Duration) -> CacheStorage {
        CacheStorage::new(temp.path().join("layercache"), delay)
    }

    #[tokio::test]
    async fn test_create_and_read() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp, Duration::ZERO);

        let first = storage.create_cache_file("layer.", b"define();").await?;
        let second = storage.create_cache_file("layer.", b"define();").await?;
        assert_ne!(first, second);
        assert!(first.starts_with("layer."));
        assert_eq!(storage.read_file(&first).await?, b"define();");
        Ok(())
    }

    #[tokio::test]
    async fn test_externalized_record_and_corruption() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp, Duration::ZERO);
        let record = Record {
            content: b"x".to_vec(),
            source_map: "{}".to_string(),
        };

        let name = storage.externalize("layer.", &record).await?;
        let loaded: Record = storage.read_externalized(&name).await?;
        assert_eq!(loaded, record);

        // truncate the payload
        let path = storage.path_of(&name);
        let raw = std::fs::read(&path)?;
        std::fs::write(&path, &raw[..raw.len() - 1])?;
        let err = storage.read_externalized::<Record>(&name).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggrError>(),
            Some(AggrError::CorruptCacheRecord { .. })
        ));

        std::fs::write(&path, b"AG")?;
        assert!(storage.read_externalized::<Record>(&name).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_now_and_delayed() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp, Duration::from_millis(20));

        let name = storage.create_cache_file("a.", b"1").await?;
        storage.delete_file_now(&name).await?;
        assert!(!storage.path_of(&name).exists());
        // already gone
        storage.delete_file_now(&name).await?;

        let name = storage.create_cache_file("b.", b"2").await?;
        let handle = storage.delete_file_delayed(name.clone()).unwrap();
        assert!(storage.path_of(&name).exists());
        handle.await?;
        assert!(!storage.path_of(&name).exists());
        Ok(())
    }

    #[test]
    fn test_delayed_delete_outside_runtime_is_immediate() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp, Duration::from_secs(60));
        std::fs::create_dir_all(storage.cache_dir()).unwrap();
        let path = storage.path_of("orphan.cache");
        std::fs::write(&path, b"1").unwrap();

        assert!(storage.delete_file_delayed("orphan.cache".to_string()).is_none());
        assert!(!path.exists());
        // already gone
        assert!(storage.delete_file_delayed("orphan.cache".to_string()).is_none());
    }

    #[tokio::test]
    async fn test_clear_removes_cache_files_only() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp, Duration::ZERO);
        assert_eq!(storage.clear().await?, 0);

        storage.create_cache_file("a.", b"1").await?;
        storage.create_cache_file("b.", b"2").await?;
        std::fs::write(storage.cache_dir().join("layercache.json"), b"{}")?;

        assert_eq!(storage.clear().await?, 2);
        assert!(storage.cache_dir().join("layercache.json").exists());
        Ok(())
    }
}
