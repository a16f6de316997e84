use aggr_core::core::AggrError;
use aggr_core::deps::{AmdDependencyParser, DependencyGraphService, RefreshRequest};
use aggr_core::formula::Features;
use aggr_core::resource::{FileSystemProvider, ResourceProvider, WalkEntry};
use aggr_core::test_utils::{SourceTree, init_test_logging};
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::TempDir;

use crate::common::config_for;

async fn expanded(service: &DependencyGraphService, id: &str, features: &Features) -> Result<BTreeSet<String>> {
    let deps = service.expanded_dependencies(id, features).await?;
    Ok(deps.ids().map(ToString::to_string).collect())
}

#[tokio::test]
async fn test_revalidation_picks_up_edited_dependencies() -> Result<()> {
    init_test_logging(None);
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("a", &["b"], 1_000)?;
    sources.write_define("b", &[], 1_000)?;

    let service = DependencyGraphService::new(config_for(&sources, work.path()))?;
    service.refresh(RefreshRequest::default()).await?;
    assert_eq!(expanded(&service, "a", &Features::new()).await?, BTreeSet::from(["b".to_string()]));
    let before = service.last_modified().await?;

    sources.write_define("a", &["b", "c"], 2_000)?;
    sources.write_define("c", &[], 2_000)?;
    let outcome = service.refresh(RefreshRequest::validate()).await?;
    assert_eq!(outcome.sequence, 2);

    assert_eq!(
        expanded(&service, "a", &Features::new()).await?,
        BTreeSet::from(["b".to_string(), "c".to_string()])
    );
    assert!(service.last_modified().await? > before);
    Ok(())
}

#[tokio::test]
async fn test_touch_without_edit_keeps_graph_timestamp() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("a", &["./b"], 1_000)?;
    sources.write_define("b", &[], 1_000)?;

    let service = DependencyGraphService::new(config_for(&sources, work.path()))?;
    service.refresh(RefreshRequest::default()).await?;
    let before = service.last_modified().await?;

    // same declarations, newer file time
    sources.write_define("a", &["./b"], 5_000)?;
    let outcome = service.refresh(RefreshRequest::validate()).await?;
    assert_eq!(outcome.parse_count, 1);
    assert_eq!(service.last_modified().await?, before);
    Ok(())
}

#[tokio::test]
async fn test_feature_conditional_dependencies() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("app/main", &["has!ie?./legacy:./modern"], 1_000)?;
    sources.write_define("app/legacy", &[], 1_000)?;
    sources.write_define("app/modern", &[], 1_000)?;
    sources.write_define("has", &[], 1_000)?;

    let service = DependencyGraphService::new(config_for(&sources, work.path()))?;
    service.refresh(RefreshRequest::default()).await?;

    let ie = expanded(&service, "app/main", &Features::new().with("ie", true)).await?;
    assert!(ie.contains("app/legacy"));
    assert!(!ie.contains("app/modern"));
    assert!(ie.contains("has"));

    let undecided = service.expanded_dependencies("app/main", &Features::new()).await?;
    assert_eq!(undecided.get("app/legacy").map(ToString::to_string).as_deref(), Some("ie"));
    assert_eq!(undecided.get("app/modern").map(ToString::to_string).as_deref(), Some("!ie"));
    Ok(())
}

#[tokio::test]
async fn test_persisted_graph_reused_until_cache_bust() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("a", &["./b"], 1_000)?;
    sources.write_define("b", &[], 1_000)?;

    let first = DependencyGraphService::new(config_for(&sources, work.path()))?;
    let outcome = first.refresh(RefreshRequest::default()).await?;
    assert!(!outcome.reused_persisted);

    let second = DependencyGraphService::new(config_for(&sources, work.path()))?;
    let outcome = second.refresh(RefreshRequest::default()).await?;
    assert!(outcome.reused_persisted);
    assert_eq!(outcome.parse_count, 0);
    assert_eq!(expanded(&second, "a", &Features::new()).await?, BTreeSet::from(["b".to_string()]));

    let mut busted = config_for(&sources, work.path());
    busted.options.cache_bust = Some("release-2".to_string());
    let third = DependencyGraphService::new(busted)?;
    let outcome = third.refresh(RefreshRequest::default()).await?;
    assert!(!outcome.reused_persisted);
    assert_eq!(outcome.parse_count, 2);
    Ok(())
}

#[tokio::test]
async fn test_unknown_module_query() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("a", &[], 1_000)?;

    let service = DependencyGraphService::new(config_for(&sources, work.path()))?;
    service.refresh(RefreshRequest::default()).await?;
    let err = service
        .expanded_dependencies("missing", &Features::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AggrError::ModuleNotFound { ref id } if id == "missing"));
    Ok(())
}

/// Filesystem provider whose next walk fails once armed.
#[derive(Default)]
struct FailingWalks {
    armed: AtomicBool,
    walks: AtomicUsize,
}

impl ResourceProvider for FailingWalks {
    fn exists(&self, path: &Path) -> bool {
        FileSystemProvider.exists(path)
    }

    fn last_modified(&self, path: &Path) -> Result<i64> {
        FileSystemProvider.last_modified(path)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        FileSystemProvider.read_to_string(path)
    }

    fn walk_tree(&self, root: &Path, visitor: &mut dyn FnMut(&WalkEntry) -> bool) -> Result<()> {
        self.walks.fetch_add(1, Ordering::SeqCst);
        if self.armed.swap(false, Ordering::SeqCst) {
            anyhow::bail!("{} is temporarily unreadable", root.display());
        }
        FileSystemProvider.walk_tree(root, visitor)
    }
}

#[tokio::test]
async fn test_failed_cached_build_retried_from_clean() -> Result<()> {
    let sources = SourceTree::new()?;
    let work = TempDir::new()?;
    sources.write_define("a", &["./b"], 1_000)?;
    sources.write_define("b", &[], 1_000)?;

    let provider = Arc::new(FailingWalks::default());
    let service = DependencyGraphService::with_collaborators(
        config_for(&sources, work.path()),
        provider.clone(),
        Arc::new(AmdDependencyParser),
    )?;
    let outcome = service.refresh(RefreshRequest::default()).await?;
    assert!(!outcome.retried_clean);
    assert_eq!(outcome.parse_count, 2);

    sources.write_define("a", &["./b", "./c"], 2_000)?;
    sources.write_define("c", &[], 2_000)?;
    provider.armed.store(true, Ordering::SeqCst);

    let outcome = service.refresh(RefreshRequest::validate()).await?;
    assert!(outcome.retried_clean);
    assert_eq!(provider.walks.load(Ordering::SeqCst), 3);
    // nothing reused from the cached trees: unchanged `b` is parsed again
    assert_eq!(outcome.parse_count, 3);
    assert_eq!(outcome.sequence, 2);
    assert_eq!(
        expanded(&service, "a", &Features::new()).await?,
        BTreeSet::from(["b".to_string(), "c".to_string()])
    );

    // the clean result was persisted and serves the next process as-is
    let restarted = DependencyGraphService::new(config_for(&sources, work.path()))?;
    let outcome = restarted.refresh(RefreshRequest::default()).await?;
    assert!(outcome.reused_persisted);
    assert_eq!(restarted.declared_dependencies("a").await?.len(), 2);
    Ok(())
}
