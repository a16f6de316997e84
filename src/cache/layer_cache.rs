//! Layer directory and shared build map
//!
//! The [`LayerCache`] maps layer keys to [`LayerBuildsAccessor`]s and stores every
//! layer's builds in one [`WeightedMap`], keyed `"{layer id}-{build key}"`. Each
//! accessor counts its live builds with a [`LatchingCounter`]. When eviction
//! removes a layer's last build the counter latches and the layer is dropped from
//! the directory, so layers live exactly as long as they own builds.
//!
//! # Locking
//!
//! Mutations take the read side of one `parking_lot::RwLock`; only
//! [`LayerCache::snapshot`] and [`LayerCache::clear`] take the write side. Slow
//! work such as writing the snapshot to disk happens after the lock is released.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::counter::LatchingCounter;
use super::entry::{CacheEntry, EntrySnapshot};
use super::storage::CacheStorage;
use super::weighted::WeightedMap;
use crate::config::AggregatorConfig;
use crate::utils::{read_json_file, write_json_file};

/// Result of [`LayerBuildsAccessor::put_if_absent`].
#[derive(Debug)]
pub enum PutOutcome {
    /// The candidate was inserted; the caller builds it
    Inserted,
    /// The candidate replaced an older build; the caller builds it
    Replaced,
    /// A build is already present; the caller waits for it and reuses it
    Existing(Arc<CacheEntry>),
    /// The layer was fully evicted concurrently; the candidate was discarded
    LayerEvicted,
}

/// One layer's view of the shared build map.
#[derive(Debug)]
pub struct LayerBuildsAccessor {
    id: u64,
    layer_key: String,
    counter: LatchingCounter,
    cache: Weak<LayerCache>,
}

impl LayerBuildsAccessor {
    /// Unique id of this layer instance.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Key of the layer in the directory.
    #[must_use]
    pub fn layer_key(&self) -> &str {
        &self.layer_key
    }

    /// Number of live builds.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.counter.count()
    }

    /// Whether all of this layer's builds have been evicted.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.counter.is_latched()
    }

    fn map_key(&self, key: &str) -> String {
        format!("{}-{}", self.id, key)
    }

    /// New, unbuilt entry owned by this layer.
    #[must_use]
    pub fn candidate(&self, key: &str, last_modified: i64) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(self.id, self.layer_key.clone(), key, last_modified))
    }

    /// Build stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let cache = self.cache.upgrade()?;
        cache.builds.get(&self.map_key(key))
    }

    /// Insert `candidate` under `key` unless a build is present.
    ///
    /// With `allow_newer_replace`, a present build older than the candidate is
    /// replaced and its backing file deleted.
    pub fn put_if_absent(&self, key: &str, candidate: Arc<CacheEntry>, allow_newer_replace: bool) -> PutOutcome {
        let Some(cache) = self.cache.upgrade() else {
            return PutOutcome::LayerEvicted;
        };
        let _guard = cache.lock.read();
        let map_key = self.map_key(key);

        loop {
            // count the candidate before it becomes visible to eviction
            if !self.counter.increment() {
                candidate.delete(&cache.storage);
                tracing::debug!(
                    target: "layer_cache",
                    "Layer {} was evicted while inserting {}",
                    self.layer_key,
                    key
                );
                return PutOutcome::LayerEvicted;
            }
            let existing = match cache.builds.put_if_absent(&map_key, Arc::clone(&candidate)) {
                Ok(()) => return PutOutcome::Inserted,
                Err(existing) => existing,
            };
            if self.counter.decrement() {
                // the present build was evicted after the lookup
                cache.remove_layer_instance(self.id, &self.layer_key);
                candidate.delete(&cache.storage);
                return PutOutcome::LayerEvicted;
            }

            if !(allow_newer_replace && candidate.last_modified() > existing.last_modified()) {
                return PutOutcome::Existing(existing);
            }
            if cache.builds.replace(&map_key, &existing, Arc::clone(&candidate)) {
                existing.delete(&cache.storage);
                tracing::debug!(
                    target: "layer_cache",
                    "Replaced build {} of layer {} ({} -> {})",
                    key,
                    self.layer_key,
                    existing.last_modified(),
                    candidate.last_modified()
                );
                return PutOutcome::Replaced;
            }
            // changed underneath us
        }
    }

    /// Swap `expected` for `entry` under `key`. Passing the same entry re-weighs it.
    pub fn replace(&self, key: &str, expected: &Arc<CacheEntry>, entry: Arc<CacheEntry>) -> bool {
        let Some(cache) = self.cache.upgrade() else {
            return false;
        };
        let _guard = cache.lock.read();
        let same = Arc::ptr_eq(expected, &entry);
        let replaced = cache.builds.replace(&self.map_key(key), expected, entry);
        if replaced && !same {
            expected.delete(&cache.storage);
        }
        replaced
    }

    /// Remove `entry` from under `key` and delete it.
    ///
    /// Removing the layer's last build drops the layer from the directory.
    pub fn remove(&self, key: &str, entry: &Arc<CacheEntry>) -> bool {
        let Some(cache) = self.cache.upgrade() else {
            return false;
        };
        let _guard = cache.lock.read();
        if !cache.builds.remove(&self.map_key(key), entry) {
            return false;
        }
        entry.delete(&cache.storage);
        if self.counter.decrement() {
            cache.remove_layer_instance(self.id, &self.layer_key);
        }
        true
    }

    /// This layer's builds, keyed by build key.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, Arc<CacheEntry>)> {
        let Some(cache) = self.cache.upgrade() else {
            return Vec::new();
        };
        let prefix = format!("{}-", self.id);
        cache
            .builds
            .entries()
            .into_iter()
            .filter_map(|(key, entry)| key.strip_prefix(&prefix).map(|k| (k.to_string(), entry)))
            .collect()
    }

    /// Account for one evicted build. Returns `true` if it was the last one.
    pub(crate) fn cache_entry_evicted(&self) -> bool {
        self.counter.decrement()
    }
}

/// Build description in a [`CacheDump`].
#[derive(Debug, Clone, Serialize)]
pub struct EntryDump {
    /// Build key
    pub key: String,
    /// Input timestamp of the build
    pub last_modified: i64,
    /// Content size in bytes
    pub size: u64,
    /// Cache file, if persisted
    pub filename: Option<String>,
    /// Per-module cache key contributions
    pub module_keys: Vec<String>,
}

/// Layer description in a [`CacheDump`].
#[derive(Debug, Clone, Serialize)]
pub struct LayerDump {
    /// Layer key
    pub key: String,
    /// Live build count
    pub entry_count: u64,
    /// Builds
    pub entries: Vec<EntryDump>,
}

/// Administrative view of the cache contents.
#[derive(Debug, Clone, Serialize)]
pub struct CacheDump {
    /// When the dump was taken
    pub generated_at: DateTime<Utc>,
    /// Matching layers, sorted by key
    pub layers: Vec<LayerDump>,
    /// Builds across all layers
    pub entry_count: usize,
    /// Evictions since the cache was created
    pub eviction_count: u64,
    /// Bytes accounted
    pub total_weight: u64,
    /// Byte budget
    pub capacity: u64,
}

/// Persisted layer of a [`CacheSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSnapshot {
    /// Layer key
    pub key: String,
    /// Persisted builds
    pub entries: Vec<EntrySnapshot>,
}

/// Durable part of the cache: persisted builds only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Byte budget in effect when the snapshot was taken
    pub capacity: u64,
    /// Layers with at least one persisted build
    pub layers: Vec<LayerSnapshot>,
}

/// Directory of layers sharing one capacity-bounded build map.
#[derive(Debug)]
pub struct LayerCache {
    layers: DashMap<String, Arc<LayerBuildsAccessor>>,
    builds: WeightedMap<CacheEntry>,
    storage: CacheStorage,
    lock: RwLock<()>,
    next_layer_id: AtomicU64,
    evictions: AtomicU64,
    this: Weak<LayerCache>,
}

impl LayerCache {
    /// Empty cache with a budget of `capacity` bytes.
    pub fn new(storage: CacheStorage, capacity: u64) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let listener_ref = this.clone();
            Self {
                layers: DashMap::new(),
                builds: WeightedMap::new(
                    capacity,
                    Box::new(move |key, entry| {
                        if let Some(cache) = listener_ref.upgrade() {
                            cache.on_evicted(&key, &entry);
                        }
                    }),
                ),
                storage,
                lock: RwLock::new(()),
                next_layer_id: AtomicU64::new(1),
                evictions: AtomicU64::new(0),
                this: this.clone(),
            }
        })
    }

    /// Cache from a snapshot.
    ///
    /// Only builds whose files still exist are restored. Layer counters are
    /// re-established from the restored builds, and the current `capacity` is
    /// applied afterwards, evicting if it is smaller than the snapshot's.
    pub fn restore(storage: CacheStorage, capacity: u64, snapshot: CacheSnapshot) -> Arc<Self> {
        let cache = Self::new(storage, u64::MAX);
        let mut restored = 0usize;
        for layer in snapshot.layers {
            let accessor = cache.get_layer(&layer.key);
            for entry in layer.entries {
                if !cache.storage.path_of(&entry.filename).is_file() {
                    tracing::debug!(target: "layer_cache", "Skipping missing cache file {}", entry.filename);
                    continue;
                }
                let key = entry.key.clone();
                let entry = Arc::new(CacheEntry::restored(accessor.id(), layer.key.clone(), entry));
                if matches!(accessor.put_if_absent(&key, Arc::clone(&entry), false), PutOutcome::Inserted) {
                    cache.builds.replace(&accessor.map_key(&key), &entry, Arc::clone(&entry));
                    restored += 1;
                }
            }
            if accessor.counter.latch_if_zero() {
                cache.remove_layer_instance(accessor.id(), accessor.layer_key());
            }
        }
        cache.builds.set_capacity(capacity);
        tracing::info!(
            target: "layer_cache",
            "Restored {} layer builds in {} layers",
            restored,
            cache.layers.len()
        );
        cache
    }

    /// Read a persisted snapshot, or start empty if there is none or it is unreadable.
    pub async fn load(storage: CacheStorage, capacity: u64, path: &Path) -> Arc<Self> {
        match read_json_file::<CacheSnapshot>(path).await {
            Ok(Some(snapshot)) => Self::restore(storage, capacity, snapshot),
            Ok(None) => Self::new(storage, capacity),
            Err(e) => {
                tracing::warn!(target: "layer_cache", "Ignoring layer cache snapshot: {:#}", e);
                Self::new(storage, capacity)
            }
        }
    }

    /// Cache for `config`: its layer cache directory, budget and delete delay,
    /// restored from the persisted snapshot if there is one.
    pub async fn open(config: &AggregatorConfig) -> Arc<Self> {
        let storage = CacheStorage::new(config.layer_cache_dir(), config.options.delete_delay());
        let capacity = config.options.max_layer_cache_capacity_bytes();
        Self::load(storage, capacity, &config.layer_cache_snapshot_path()).await
    }

    /// File storage used by this cache.
    #[must_use]
    pub const fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// The layer for `layer_key`, created if absent.
    ///
    /// A layer that has been fully evicted but not yet dropped is replaced.
    pub fn get_layer(&self, layer_key: &str) -> Arc<LayerBuildsAccessor> {
        let _guard = self.lock.read();
        loop {
            let accessor = self
                .layers
                .entry(layer_key.to_string())
                .or_insert_with(|| {
                    Arc::new(LayerBuildsAccessor {
                        id: self.next_layer_id.fetch_add(1, Ordering::Relaxed),
                        layer_key: layer_key.to_string(),
                        counter: LatchingCounter::new(),
                        cache: self.this.clone(),
                    })
                })
                .clone();
            if !accessor.is_evicted() {
                return accessor;
            }
            self.remove_layer_instance(accessor.id(), layer_key);
        }
    }

    /// The layer for `layer_key`, if present.
    #[must_use]
    pub fn layer(&self, layer_key: &str) -> Option<Arc<LayerBuildsAccessor>> {
        self.layers.get(layer_key).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop `accessor` from the directory if it is still the registered instance.
    pub fn remove_layer(&self, accessor: &LayerBuildsAccessor) -> bool {
        self.remove_layer_instance(accessor.id(), accessor.layer_key())
    }

    fn remove_layer_instance(&self, id: u64, layer_key: &str) -> bool {
        let removed = self.layers.remove_if(layer_key, |_, current| current.id() == id).is_some();
        if removed {
            tracing::debug!(target: "layer_cache", "Removed layer {}", layer_key);
        }
        removed
    }

    fn on_evicted(&self, map_key: &str, entry: &Arc<CacheEntry>) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "layer_cache", "Evicted layer build {}", map_key);
        entry.delete(&self.storage);

        let owner = self
            .layers
            .get(entry.layer_key())
            .map(|a| Arc::clone(a.value()))
            .filter(|a| a.id() == entry.layer_id());
        if let Some(accessor) = owner
            && accessor.cache_entry_evicted()
        {
            self.remove_layer_instance(accessor.id(), accessor.layer_key());
        }
    }

    /// Number of layers in the directory.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Number of builds across all layers.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.builds.len()
    }

    /// Evictions since the cache was created.
    #[must_use]
    pub fn eviction_count(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Bytes currently accounted.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.builds.total_weight()
    }

    /// Change the byte budget, evicting as needed.
    pub fn set_capacity(&self, capacity: u64) {
        let _guard = self.lock.read();
        self.builds.set_capacity(capacity);
    }

    /// Drop every layer and build and delete their files.
    pub fn clear(&self) {
        let drained = {
            let _guard = self.lock.write();
            for accessor in self.layers.iter() {
                accessor.counter.latch();
            }
            self.layers.clear();
            self.builds.drain()
        };
        for (_, entry) in &drained {
            entry.delete(&self.storage);
        }
        tracing::info!(target: "layer_cache", "Cleared {} layer builds", drained.len());
    }

    /// Layers and builds, optionally restricted to layer keys matching `filter`.
    #[must_use]
    pub fn dump(&self, filter: Option<&Regex>) -> CacheDump {
        let mut layers: Vec<LayerDump> = self
            .layers
            .iter()
            .filter(|layer| filter.is_none_or(|re| re.is_match(layer.key())))
            .map(|layer| {
                let mut entries: Vec<EntryDump> = layer
                    .entries()
                    .into_iter()
                    .map(|(key, entry)| EntryDump {
                        key,
                        last_modified: entry.last_modified(),
                        size: entry.size(),
                        filename: entry.filename(),
                        module_keys: entry.module_keys(),
                    })
                    .collect();
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                LayerDump {
                    key: layer.key().clone(),
                    entry_count: layer.entry_count(),
                    entries,
                }
            })
            .collect();
        layers.sort_by(|a, b| a.key.cmp(&b.key));

        CacheDump {
            generated_at: Utc::now(),
            layers,
            entry_count: self.builds.len(),
            eviction_count: self.eviction_count(),
            total_weight: self.builds.total_weight(),
            capacity: self.builds.capacity(),
        }
    }

    /// Consistent copy of the persisted builds.
    #[must_use]
    pub fn snapshot(&self) -> CacheSnapshot {
        let _guard = self.lock.write();
        let mut layers: Vec<LayerSnapshot> = self
            .layers
            .iter()
            .map(|layer| LayerSnapshot {
                key: layer.key().clone(),
                entries: layer
                    .entries()
                    .into_iter()
                    .filter_map(|(_, entry)| entry.snapshot())
                    .collect(),
            })
            .filter(|layer| !layer.entries.is_empty())
            .collect();
        layers.sort_by(|a, b| a.key.cmp(&b.key));

        CacheSnapshot {
            capacity: self.builds.capacity(),
            layers,
        }
    }

    /// Write a snapshot to `path`. The lock is held only while copying.
    pub async fn persist_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        write_json_file(path, &snapshot).await?;
        tracing::debug!(
            target: "layer_cache",
            "Persisted layer cache snapshot with {} layers to {}",
            snapshot.layers.len(),
            path.display()
        );
        Ok(())
    }
}
