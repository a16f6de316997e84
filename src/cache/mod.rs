//! Layer build cache
//!
//! Built layers are cached per layer and per build key. All layers share one
//! capacity-bounded LRU map, so a busy layer can push out the builds of idle ones;
//! a layer disappears from the directory once its last build has been evicted.
//!
//! # Modules
//!
//! - [`storage`] - cache files: creation, records with source maps, delayed deletes
//! - [`entry`] - [`CacheEntry`], one build in memory or on disk
//! - [`counter`] - [`LatchingCounter`] tracking a layer's live builds
//! - [`weighted`] - [`WeightedMap`], the capacity-weighted LRU
//! - [`layer_cache`] - [`LayerCache`] directory and [`LayerBuildsAccessor`]
//!
//! # Entry lifecycle
//!
//! ```text
//! candidate ──put_if_absent──▶ building ──set_content──▶ in memory ──persist──▶ on disk
//!                                  │                                    │
//!                                  └──── failure: removed ◀── evicted / replaced: delete()
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use aggr_core::cache::{CacheStorage, LayerCache};
//! use std::time::Duration;
//!
//! let storage = CacheStorage::new("/var/cache/aggr/layercache", Duration::from_secs(180));
//! let cache = LayerCache::new(storage, 500 * 1024 * 1024);
//! let layer = cache.get_layer("app/main");
//! assert_eq!(layer.entry_count(), 0);
//! ```

pub mod counter;
pub mod entry;
pub mod layer_cache;
pub mod storage;
pub mod weighted;

pub use counter::LatchingCounter;
pub use entry::{CacheEntry, EntrySnapshot, LayerContent};
pub use layer_cache::{
    CacheDump, CacheSnapshot, EntryDump, LayerBuildsAccessor, LayerCache, LayerDump,
    LayerSnapshot, PutOutcome,
};
pub use storage::CacheStorage;
pub use weighted::{EvictionListener, Weighted, WeightedMap};
