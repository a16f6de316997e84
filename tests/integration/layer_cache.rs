use aggr_core::cache::{CacheStorage, LayerCache};
use aggr_core::layer::{Layer, LayerBuildOutput};
use aggr_core::test_utils::init_test_logging;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::common::{cache_files, eventually};

fn built(text: &str) -> LayerBuildOutput {
    LayerBuildOutput {
        content: text.to_string(),
        cacheable: true,
        ..Default::default()
    }
}

async fn fill(cache: &Arc<LayerCache>, layer: &str, key: &str, text: &str) -> Result<()> {
    let text = text.to_string();
    Layer::new(Arc::clone(cache), layer)
        .get_content(key, 1, move || {
            let text = text.clone();
            async move { Ok(built(&text)) }
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_layer_removed_after_last_build_evicted() -> Result<()> {
    init_test_logging(None);
    let dir = TempDir::new()?;
    let cache = LayerCache::new(CacheStorage::new(dir.path(), Duration::ZERO), 10);

    for key in ["k1", "k2", "k3"] {
        fill(&cache, "x", key, "aaa").await?;
    }
    assert_eq!(cache.layer("x").map(|l| l.entry_count()), Some(3));

    fill(&cache, "y", "k1", "bbb").await?;
    assert_eq!(cache.layer("x").map(|l| l.entry_count()), Some(2));
    fill(&cache, "y", "k2", "bbb").await?;
    assert_eq!(cache.layer("x").map(|l| l.entry_count()), Some(1));
    fill(&cache, "y", "k3", "bbb").await?;

    assert!(cache.layer("x").is_none());
    assert_eq!(cache.eviction_count(), 3);
    assert_eq!(cache.layer("y").map(|l| l.entry_count()), Some(3));

    // a request for the evicted layer starts a fresh one
    fill(&cache, "x", "k1", "a").await?;
    assert_eq!(cache.layer("x").map(|l| l.entry_count()), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_clear_during_persistence_leaves_no_files() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = LayerCache::new(CacheStorage::new(dir.path(), Duration::from_millis(5)), 1 << 20);

    for round in 0..10 {
        for key in ["a", "b", "c"] {
            fill(&cache, "layer", key, &format!("content {round} {key}")).await?;
        }
        // persistence was scheduled by the builds above and may still be running
        cache.clear();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.layer_count(), 0);
    }

    assert!(eventually(|| cache_files(dir.path()) == 0).await);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_share_one_build() -> Result<()> {
    let dir = TempDir::new()?;
    let cache = LayerCache::new(CacheStorage::new(dir.path(), Duration::ZERO), 1 << 20);
    let builds = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let layer = Layer::new(Arc::clone(&cache), "shared");
            let builds = Arc::clone(&builds);
            tokio::spawn(async move {
                layer
                    .get_content("key", 1, move || {
                        let builds = Arc::clone(&builds);
                        async move {
                            builds.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(built("once"))
                        }
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await??.content, b"once");
    }
    assert_eq!(builds.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(cache.entry_count(), 1);
    Ok(())
}
