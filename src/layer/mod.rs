//! Layers: cached response bodies
//!
//! A [`Layer`] finds or builds the content for one request. Builds are
//! single-flight per (layer, build key): the caller whose candidate entry is
//! inserted runs the build while holding the entry's build lock, and every other
//! caller waits on that lock and reads the finished entry.
//!
//! # Example
//!
//! ```rust,no_run
//! use aggr_core::cache::{CacheStorage, LayerCache};
//! use aggr_core::layer::{Layer, LayerBuildOutput};
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = LayerCache::new(CacheStorage::new("/tmp/layercache", Duration::from_secs(180)), 1 << 20);
//! let layer = Layer::new(cache, "app/main");
//! let content = layer
//!     .get_content("gzip;{!ie}", 0, || async {
//!         Ok(LayerBuildOutput {
//!             content: "define('app/main',[],{});".to_string(),
//!             cacheable: true,
//!             ..Default::default()
//!         })
//!     })
//!     .await?;
//! assert!(!content.content.is_empty());
//! # Ok(())
//! # }
//! ```

pub mod builder;

pub use builder::{
    ContributionType, LayerBuildOutput, LayerBuilder, ModuleBuild, ModuleBuildService, ModuleList,
    ModuleListEntry, ModuleSource, Transport,
};

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;

use crate::cache::{LayerCache, LayerContent, PutOutcome};
use crate::formula::Features;

/// One logical layer in a [`LayerCache`].
#[derive(Debug, Clone)]
pub struct Layer {
    cache: Arc<LayerCache>,
    layer_key: String,
}

impl Layer {
    /// Layer stored under `layer_key`.
    pub fn new(cache: Arc<LayerCache>, layer_key: impl Into<String>) -> Self {
        Self {
            cache,
            layer_key: layer_key.into(),
        }
    }

    /// Key of the layer in the cache directory.
    #[must_use]
    pub fn layer_key(&self) -> &str {
        &self.layer_key
    }

    /// Build key for the inputs that change a layer's bytes.
    #[must_use]
    pub fn build_key(transport: &dyn Transport, features: &Features, debug: bool) -> String {
        let mut key = format!("{};{features}", transport.cache_key());
        if debug {
            key.push_str(";debug");
        }
        key
    }

    /// Cached content for `build_key`, building it with `build` if needed.
    ///
    /// A cached build older than `last_modified` is replaced. A failed build is
    /// removed before waiters are released, so they retry rather than observe it.
    /// Builds that report module errors are returned but not cached.
    ///
    /// # Errors
    ///
    /// Returns the build's error to the caller that ran it, or the read error of
    /// a damaged cache file.
    pub async fn get_content<F, Fut>(
        &self,
        build_key: &str,
        last_modified: i64,
        mut build: F,
    ) -> Result<Arc<LayerContent>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<LayerBuildOutput>>,
    {
        let storage = self.cache.storage();
        loop {
            let accessor = self.cache.get_layer(&self.layer_key);
            let candidate = accessor.candidate(build_key, last_modified);
            let guard = candidate.build_lock().lock().await;

            match accessor.put_if_absent(build_key, Arc::clone(&candidate), true) {
                PutOutcome::Existing(existing) => {
                    drop(guard);
                    drop(existing.build_lock().lock().await);
                    match existing.read(storage).await {
                        Ok(Some(content)) => return Ok(content),
                        Ok(None) => {
                            tracing::debug!(
                                target: "layer",
                                "Build {} of layer {} went away, retrying",
                                build_key,
                                self.layer_key
                            );
                        }
                        Err(e) => {
                            accessor.remove(build_key, &existing);
                            return Err(e);
                        }
                    }
                }
                PutOutcome::Inserted | PutOutcome::Replaced => {
                    tracing::debug!(target: "layer", "Building {} of layer {}", build_key, self.layer_key);
                    let output = match build().await {
                        Ok(output) => output,
                        Err(e) => {
                            accessor.remove(build_key, &candidate);
                            drop(guard);
                            return Err(e);
                        }
                    };

                    let mut content = LayerContent::new(output.content.into_bytes());
                    if let Some(source_map) = output.source_map {
                        content = content.with_source_map(source_map);
                    }
                    let content = candidate.set_content(content, output.module_keys);
                    if output.cacheable {
                        // re-weigh now that the size is known
                        if accessor.replace(build_key, &candidate, Arc::clone(&candidate)) {
                            candidate.persist(storage);
                        }
                    } else {
                        accessor.remove(build_key, &candidate);
                    }
                    drop(guard);
                    return Ok(content);
                }
                PutOutcome::LayerEvicted => {
                    drop(guard);
                    self.cache.remove_layer(&accessor);
                }
            }
        }
    }

    /// Cached content for `build_key`, assembling `modules` with `builder` if needed.
    pub async fn get_or_build(
        &self,
        build_key: &str,
        last_modified: i64,
        builder: &LayerBuilder<'_>,
        modules: &ModuleList,
    ) -> Result<Arc<LayerContent>> {
        self.get_content(build_key, last_modified, || builder.build(modules))
            .await
    }
}
