use aggr_core::cache::LayerCache;
use aggr_core::deps::{DependencyGraphService, RefreshRequest};
use aggr_core::formula::Features;
use aggr_core::layer::{Layer, LayerBuilder, ModuleList};
use aggr_core::test_utils::{FakeModuleBuilds, SourceTree, TaggingTransport};
use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

use crate::common::{config_for, eventually};

#[tokio::test]
async fn test_request_builds_and_restores_layer() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("app/main", &["./util", "require"], 1_000)?;
    sources.write_define("app/util", &[], 1_000)?;
    sources.write_define("app/extra", &[], 1_000)?;
    let config = config_for(&sources, work.path());

    let service = DependencyGraphService::new(config.clone())?;
    service.refresh(RefreshRequest::default()).await?;
    let graph = service.graph().await?;

    let features = Features::new().with("ie", false);
    let modules = ModuleList::resolve(
        &graph,
        &["app/extra".to_string()],
        &["app/main".to_string()],
        &features,
    )?;
    assert_eq!(
        modules.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        vec!["app/extra", "app/main", "app/util"]
    );

    let builds = Arc::new(FakeModuleBuilds::new());
    let transport = TaggingTransport;
    let builder = LayerBuilder::new(&transport, builds.clone());
    let build_key = Layer::build_key(&transport, &features, false);

    let cache = LayerCache::open(&config).await;
    let layer = Layer::new(Arc::clone(&cache), "app/main");
    let content = layer
        .get_or_build(&build_key, graph.last_modified(), &builder, &modules)
        .await?;
    let text = String::from_utf8(content.content.clone())?;
    assert!(text.starts_with("<BeginResponse><BeginModules><BeforeFirstModule:app/extra>[app/extra]"));
    assert!(text.contains("<EndModules><BeginLayerModules><BeforeFirstLayerModule:app/main>[app/main]"));
    assert!(text.ends_with("<EndLayerModules><EndResponse>"));
    assert_eq!(builds.build_count(), 3);

    // wait for the background write, then persist the directory
    assert!(eventually(|| !cache.snapshot().layers.is_empty()).await);
    cache.persist_snapshot(&config.layer_cache_snapshot_path()).await?;

    let reopened = LayerCache::open(&config).await;
    assert_eq!(reopened.entry_count(), 1);
    let restored = Layer::new(reopened, "app/main")
        .get_content(&build_key, graph.last_modified(), || async {
            Err(anyhow::anyhow!("restored layer must not be rebuilt"))
        })
        .await?;
    assert_eq!(restored.content, content.content);

    // newer sources replace the restored build
    let rebuilt = Layer::new(Arc::clone(&cache), "app/main")
        .get_or_build(&build_key, graph.last_modified() + 1, &builder, &modules)
        .await?;
    assert_eq!(rebuilt.content, content.content);
    assert_eq!(builds.build_count(), 6);
    Ok(())
}
