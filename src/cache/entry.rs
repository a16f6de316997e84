//! One cached layer build
//!
//! A [`CacheEntry`] holds a build's content in memory until [`CacheEntry::persist`]
//! has written it to a cache file, then only the file name. Both live under one
//! monitor: the file name is published before the in-memory copy is released, so
//! a reader always finds one of them.
//!
//! Deletion composes with persistence. If the entry is deleted while its file is
//! still being written, the completed file is removed immediately instead of being
//! recorded.

use anyhow::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::storage::CacheStorage;
use super::weighted::Weighted;

/// Build output of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerContent {
    /// Response body
    pub content: Vec<u8>,
    /// Source map, if the build produced one
    pub source_map: Option<String>,
}

impl LayerContent {
    /// Content without a source map.
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            source_map: None,
        }
    }

    /// Attach a source map.
    #[must_use]
    pub fn with_source_map(mut self, source_map: impl Into<String>) -> Self {
        self.source_map = Some(source_map.into());
        self
    }

    /// Bytes held in memory by this content.
    #[must_use]
    pub fn size(&self) -> u64 {
        (self.content.len() + self.source_map.as_ref().map_or(0, String::len)) as u64
    }
}

#[derive(Debug, Default)]
struct EntryState {
    content: Option<Arc<LayerContent>>,
    filename: Option<String>,
    has_source_map: bool,
    persisting: bool,
    deleted: bool,
    module_keys: Vec<String>,
}

/// Durable description of a persisted entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    /// Build key within the layer
    pub key: String,
    /// Timestamp of the inputs the build was made from
    pub last_modified: i64,
    /// Cache file holding the content
    pub filename: String,
    /// Whether the file is a content/source-map record
    pub has_source_map: bool,
    /// Content size in bytes
    pub size: u64,
    /// Per-module cache key contributions recorded by the build
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub module_keys: Vec<String>,
}

/// A layer build, in memory or on disk.
#[derive(Debug)]
pub struct CacheEntry {
    layer_id: u64,
    layer_key: String,
    key: String,
    last_modified: i64,
    size: AtomicU64,
    state: Mutex<EntryState>,
    build_lock: tokio::sync::Mutex<()>,
}

impl CacheEntry {
    /// Empty entry for a build that has not run yet.
    pub fn new(layer_id: u64, layer_key: impl Into<String>, key: impl Into<String>, last_modified: i64) -> Self {
        Self {
            layer_id,
            layer_key: layer_key.into(),
            key: key.into(),
            last_modified,
            size: AtomicU64::new(0),
            state: Mutex::new(EntryState::default()),
            build_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Entry backed by an existing cache file.
    pub fn restored(layer_id: u64, layer_key: impl Into<String>, snapshot: EntrySnapshot) -> Self {
        let entry = Self::new(layer_id, layer_key, snapshot.key, snapshot.last_modified);
        entry.size.store(snapshot.size, Ordering::Release);
        {
            let mut state = entry.state.lock();
            state.filename = Some(snapshot.filename);
            state.has_source_map = snapshot.has_source_map;
            state.module_keys = snapshot.module_keys;
        }
        entry
    }

    /// Id of the owning layer.
    #[must_use]
    pub const fn layer_id(&self) -> u64 {
        self.layer_id
    }

    /// Key of the owning layer.
    #[must_use]
    pub fn layer_key(&self) -> &str {
        &self.layer_key
    }

    /// Build key within the layer.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Timestamp of the inputs the build was made from.
    #[must_use]
    pub const fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Content size in bytes (0 before the build completes).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Held by the thread building this entry; waiters lock it to wait for the build.
    pub fn build_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.build_lock
    }

    /// Whether [`delete`](Self::delete) has been called.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Cache file name, once persisted.
    #[must_use]
    pub fn filename(&self) -> Option<String> {
        self.state.lock().filename.clone()
    }

    /// Per-module cache key contributions recorded by the build.
    #[must_use]
    pub fn module_keys(&self) -> Vec<String> {
        self.state.lock().module_keys.clone()
    }

    /// Store the build result. Returns the shared content.
    pub fn set_content(&self, content: LayerContent, module_keys: Vec<String>) -> Arc<LayerContent> {
        let content = Arc::new(content);
        self.size.store(content.size(), Ordering::Release);
        let mut state = self.state.lock();
        state.has_source_map = content.source_map.is_some();
        state.module_keys = module_keys;
        if !state.deleted {
            state.content = Some(Arc::clone(&content));
        }
        content
    }

    /// The build content.
    ///
    /// Returns `Ok(None)` if the entry has no content (the build has not completed
    /// or failed) or has been deleted. A damaged cache file is an error.
    pub async fn read(&self, storage: &CacheStorage) -> Result<Option<Arc<LayerContent>>> {
        let (filename, has_source_map) = {
            let state = self.state.lock();
            if state.deleted {
                return Ok(None);
            }
            if let Some(content) = &state.content {
                return Ok(Some(Arc::clone(content)));
            }
            match &state.filename {
                Some(filename) => (filename.clone(), state.has_source_map),
                None => return Ok(None),
            }
        };

        let content = if has_source_map {
            storage.read_externalized::<LayerContent>(&filename).await?
        } else {
            LayerContent::new(storage.read_file(&filename).await?)
        };
        Ok(Some(Arc::new(content)))
    }

    /// Write the in-memory content to a cache file in the background.
    ///
    /// On success the file name replaces the in-memory copy. On failure the entry
    /// stays valid in memory. Returns `None` if there is nothing to persist or no
    /// runtime to write it from.
    pub fn persist(self: &Arc<Self>, storage: &CacheStorage) -> Option<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            tracing::debug!(target: "layer_cache", "No runtime to persist {} of layer {}", self.key, self.layer_key);
            return None;
        };
        let content = {
            let mut state = self.state.lock();
            if state.deleted || state.persisting || state.filename.is_some() {
                return None;
            }
            let content = state.content.clone()?;
            state.persisting = true;
            content
        };

        let entry = Arc::clone(self);
        let storage = storage.clone();
        Some(runtime.spawn(async move {
            let written = if content.source_map.is_some() {
                storage.externalize("layer.", content.as_ref()).await
            } else {
                storage.create_cache_file("layer.", &content.content).await
            };

            match written {
                Ok(filename) => {
                    let orphan = {
                        let mut state = entry.state.lock();
                        state.persisting = false;
                        if state.deleted {
                            Some(filename)
                        } else {
                            state.filename = Some(filename);
                            state.content = None;
                            None
                        }
                    };
                    if let Some(filename) = orphan
                        && let Err(e) = storage.delete_file_now(&filename).await
                    {
                        tracing::warn!(target: "layer_cache", "{:#}", e);
                    }
                }
                Err(e) => {
                    entry.state.lock().persisting = false;
                    tracing::warn!(
                        target: "layer_cache",
                        "Failed to persist layer build {} of {}: {:#}",
                        entry.key,
                        entry.layer_key,
                        e
                    );
                }
            }
        }))
    }

    /// Mark the entry deleted and schedule removal of its file.
    ///
    /// Idempotent. Returns the handle of the delayed delete, if one was scheduled.
    /// Outside a runtime the file is removed before this returns.
    pub fn delete(&self, storage: &CacheStorage) -> Option<JoinHandle<()>> {
        let filename = {
            let mut state = self.state.lock();
            if state.deleted {
                return None;
            }
            state.deleted = true;
            state.content = None;
            state.filename.take()
        };
        filename.and_then(|filename| storage.delete_file_delayed(filename))
    }

    /// Durable description, if the entry is persisted and not deleted.
    #[must_use]
    pub fn snapshot(&self) -> Option<EntrySnapshot> {
        let state = self.state.lock();
        if state.deleted {
            return None;
        }
        Some(EntrySnapshot {
            key: self.key.clone(),
            last_modified: self.last_modified,
            filename: state.filename.clone()?,
            has_source_map: state.has_source_map,
            size: self.size(),
            module_keys: state.module_keys.clone(),
        })
    }
}

impl Weighted for CacheEntry {
    fn weight(&self) -> u64 {
        self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> CacheStorage {
        CacheStorage::new(temp.path(), Duration::from_millis(10))
    }

    fn cache_files(temp: &TempDir) -> usize {
        std::fs::read_dir(temp.path())
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    #[test]
    fn test_delete_and_persist_outside_runtime() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);
        std::fs::write(storage.path_of("layer.old.cache"), b"abc").unwrap();
        let entry = CacheEntry::restored(
            1,
            "layer",
            EntrySnapshot {
                key: "key".to_string(),
                last_modified: 5,
                filename: "layer.old.cache".to_string(),
                has_source_map: false,
                size: 3,
                module_keys: Vec::new(),
            },
        );

        assert!(entry.delete(&storage).is_none());
        assert!(entry.is_deleted());
        assert_eq!(cache_files(&temp), 0);

        let fresh = Arc::new(CacheEntry::new(1, "layer", "key", 6));
        fresh.set_content(LayerContent::new("define();"), Vec::new());
        assert!(fresh.persist(&storage).is_none());
        assert!(fresh.filename().is_none());
    }

    #[tokio::test]
    async fn test_read_before_and_after_persist() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp);
        let entry = Arc::new(CacheEntry::new(1, "layer", "key", 5));

        assert!(entry.read(&storage).await?.is_none());

        entry.set_content(LayerContent::new("define();"), vec!["m1".to_string()]);
        assert_eq!(entry.size(), 9);
        assert_eq!(entry.read(&storage).await?.unwrap().content, b"define();");

        entry.persist(&storage).unwrap().await?;
        assert!(entry.filename().is_some());
        assert!(entry.persist(&storage).is_none());

        let content = entry.read(&storage).await?.unwrap();
        assert_eq!(content.content, b"define();");
        assert_eq!(content.source_map, None);

        let snapshot = entry.snapshot().unwrap();
        assert_eq!(snapshot.module_keys, vec!["m1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_source_map_record() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp);
        let entry = Arc::new(CacheEntry::new(1, "layer", "key", 5));

        entry.set_content(LayerContent::new("x").with_source_map("{\"version\":3}"), Vec::new());
        entry.persist(&storage).unwrap().await?;

        let restored = CacheEntry::restored(2, "layer", entry.snapshot().unwrap());
        let content = restored.read(&storage).await?.unwrap();
        assert_eq!(content.source_map.as_deref(), Some("{\"version\":3}"));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp);
        let entry = Arc::new(CacheEntry::new(1, "layer", "key", 5));
        entry.set_content(LayerContent::new("x").with_source_map("{}"), Vec::new());
        entry.persist(&storage).unwrap().await?;

        std::fs::write(storage.path_of(&entry.filename().unwrap()), b"AGLR")?;
        assert!(entry.read(&storage).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_delayed() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp);
        let entry = Arc::new(CacheEntry::new(1, "layer", "key", 5));
        entry.set_content(LayerContent::new("x"), Vec::new());
        entry.persist(&storage).unwrap().await?;
        assert_eq!(cache_files(&temp), 1);

        let handle = entry.delete(&storage).unwrap();
        assert!(entry.delete(&storage).is_none());
        assert!(entry.read(&storage).await?.is_none());
        assert!(entry.snapshot().is_none());

        handle.await?;
        assert_eq!(cache_files(&temp), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_during_persist_leaves_no_file() -> Result<()> {
        let temp = TempDir::new()?;
        let storage = storage(&temp);

        for _ in 0..20 {
            let entry = Arc::new(CacheEntry::new(1, "layer", "key", 5));
            entry.set_content(LayerContent::new(vec![b'x'; 4096]), Vec::new());

            let persist = entry.persist(&storage).unwrap();
            let deleter = {
                let entry = Arc::clone(&entry);
                let storage = storage.clone();
                tokio::spawn(async move { entry.delete(&storage) })
            };

            persist.await?;
            if let Some(delayed) = deleter.await? {
                delayed.await?;
            }
            assert!(entry.filename().is_none());
        }

        assert_eq!(cache_files(&temp), 0);
        Ok(())
    }
}
