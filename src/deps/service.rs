//! Dependency graph lifecycle: load, revalidate, persist, publish
//!
//! [`DependencyGraphService`] owns the live [`CompositeGraph`]. A refresh holds the
//! writer side of a `tokio::sync::RwLock` for the whole rebuild, so queries issued
//! while a rebuild runs wait for it and then see the new graph; queries never see a
//! partially built one. In development mode readers give up after a bounded wait
//! with the retryable [`AggrError::ProcessingDependencies`].
//!
//! # Refresh steps
//!
//! 1. Load the persisted [`GraphSnapshot`]. A snapshot for another server name,
//!    another format version or another cache-bust token is discarded. A snapshot
//!    older than the service stamp forces validation.
//! 2. If the configuration fingerprint matches and neither validation nor a clean
//!    rebuild was requested, reuse the persisted trees without walking.
//! 3. Otherwise run one [`DependencyTreeBuilder`] per non-redundant root, at most
//!    `builder_pool_size` at a time, with parses bounded by a shared semaphore of
//!    `parser_pool_size` permits. A failure while cached trees were in use is
//!    retried once from clean.
//! 4. Prune, persist (failures are logged), compose and publish the graph, then
//!    notify listeners.

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock as SyncRwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, Semaphore};
use tokio::task::JoinHandle;

use super::builder::{BuildResult, DependencyTreeBuilder};
use super::graph::{CompositeGraph, ExpandedDependencies, MountPoint};
use super::node::DependencyTree;
use super::parser::{AmdDependencyParser, SourceParser};
use super::paths::{locate_in_roots, remove_redundant_paths};
use super::snapshot::GraphSnapshot;
use crate::config::AggregatorConfig;
use crate::core::AggrError;
use crate::formula::Features;
use crate::resource::{FileSystemProvider, ResourceProvider};

/// Observer of dependency graph publication.
pub trait DependencyListener: Send + Sync {
    /// Called after a refresh published `graph` as generation `sequence`.
    fn dependencies_loaded(&self, graph: &CompositeGraph, sequence: u64);
}

/// What a refresh should do with previously built trees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshRequest {
    /// Walk every root and re-parse changed files even if the persisted trees
    /// look current
    pub validate: bool,
    /// Ignore persisted trees entirely
    pub clean: bool,
}

impl RefreshRequest {
    /// Revalidate against the filesystem.
    #[must_use]
    pub const fn validate() -> Self {
        Self {
            validate: true,
            clean: false,
        }
    }

    /// Rebuild from scratch.
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            validate: true,
            clean: true,
        }
    }
}

/// Summary of a successful refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    /// Generation number of the published graph
    pub sequence: u64,
    /// Files parsed during this refresh
    pub parse_count: usize,
    /// Whether persisted trees were reused without walking
    pub reused_persisted: bool,
    /// Whether the refresh had to fall back to a clean rebuild
    pub retried_clean: bool,
    /// Aggregate dependency timestamp of the published graph
    pub last_modified: i64,
}

#[derive(Default)]
struct GraphState {
    graph: Option<Arc<CompositeGraph>>,
    init_error: Option<String>,
    sequence: u64,
}

struct ServiceInner {
    config: SyncRwLock<Arc<AggregatorConfig>>,
    provider: Arc<dyn ResourceProvider>,
    parser: Arc<dyn SourceParser>,
    state: Arc<RwLock<GraphState>>,
    listeners: SyncRwLock<Vec<Arc<dyn DependencyListener>>>,
    stamp: AtomicI64,
}

/// Builds, persists and serves the dependency graph.
///
/// Cloning is cheap; clones share the same graph.
#[derive(Clone)]
pub struct DependencyGraphService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for DependencyGraphService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyGraphService")
            .field("name", &self.inner.config.read().name)
            .field("stamp", &self.inner.stamp.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DependencyGraphService {
    /// Service reading sources from the filesystem with the AMD parser.
    ///
    /// # Errors
    ///
    /// Returns the [`AggregatorConfig::validate`] error for invalid mount names,
    /// overlapping roots or unusable pool settings.
    pub fn new(config: AggregatorConfig) -> Result<Self, AggrError> {
        Self::with_collaborators(config, Arc::new(FileSystemProvider), Arc::new(AmdDependencyParser))
    }

    /// Service with explicit resource provider and parser.
    ///
    /// # Errors
    ///
    /// Same as [`DependencyGraphService::new`].
    pub fn with_collaborators(
        config: AggregatorConfig,
        provider: Arc<dyn ResourceProvider>,
        parser: Arc<dyn SourceParser>,
    ) -> Result<Self, AggrError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config: SyncRwLock::new(Arc::new(config)),
                provider,
                parser,
                state: Arc::new(RwLock::new(GraphState::default())),
                listeners: SyncRwLock::new(Vec::new()),
                stamp: AtomicI64::new(0),
            }),
        })
    }

    /// Set the deployment stamp. Persisted trees written under an older stamp are
    /// revalidated on the next refresh.
    #[must_use]
    pub fn with_stamp(self, stamp: i64) -> Self {
        self.inner.stamp.store(stamp, Ordering::Relaxed);
        self
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> Arc<AggregatorConfig> {
        self.inner.config.read().clone()
    }

    /// Register a listener notified after every successful refresh.
    pub fn add_listener(&self, listener: Arc<dyn DependencyListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Rebuild the graph and wait for the result.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshOutcome> {
        let guard = Arc::clone(&self.inner.state).write_owned().await;
        self.inner.run_refresh(guard, request).await
    }

    /// Start a rebuild in the background.
    ///
    /// The writer side is acquired before this returns, so any query issued
    /// afterwards waits for (or, in development mode, times out on) this rebuild.
    pub async fn spawn_refresh(&self, request: RefreshRequest) -> JoinHandle<Result<RefreshOutcome>> {
        let guard = Arc::clone(&self.inner.state).write_owned().await;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_refresh(guard, request).await })
    }

    /// Replace the configuration and refresh.
    ///
    /// Root changes alter the fingerprint, so the refresh revalidates using the
    /// persisted trees as a parse cache.
    pub async fn update_config(&self, config: AggregatorConfig) -> Result<RefreshOutcome> {
        config.validate()?;
        let guard = Arc::clone(&self.inner.state).write_owned().await;
        *self.inner.config.write() = Arc::new(config);
        self.inner.run_refresh(guard, RefreshRequest::default()).await
    }

    /// The published graph.
    ///
    /// # Errors
    ///
    /// [`AggrError::ProcessingDependencies`] if a development-mode reader times out
    /// waiting for a rebuild, or [`AggrError::DependenciesUnavailable`] if no graph
    /// has been built.
    pub async fn graph(&self) -> Result<Arc<CompositeGraph>, AggrError> {
        let wait = self.inner.config.read().options.read_lock_wait();
        let state = match wait {
            Some(wait) => tokio::time::timeout(wait, self.inner.state.read())
                .await
                .map_err(|_| AggrError::ProcessingDependencies)?,
            None => self.inner.state.read().await,
        };
        match &state.graph {
            Some(graph) => Ok(Arc::clone(graph)),
            None => Err(AggrError::DependenciesUnavailable {
                reason: state
                    .init_error
                    .clone()
                    .unwrap_or_else(|| "dependency graph has not been built".to_string()),
            }),
        }
    }

    /// Generation number of the published graph (0 before the first refresh).
    pub async fn sequence(&self) -> u64 {
        self.inner.state.read().await.sequence
    }

    /// Modules reachable from `id` under `features`.
    pub async fn expanded_dependencies(
        &self,
        id: &str,
        features: &Features,
    ) -> Result<ExpandedDependencies, AggrError> {
        self.graph().await?.expanded_dependencies(id, features)
    }

    /// Normalized `define` dependencies of `id`.
    pub async fn declared_dependencies(&self, id: &str) -> Result<Vec<String>, AggrError> {
        Ok(self.graph().await?.declared_dependencies(id)?.to_vec())
    }

    /// Normalized `require([...])` dependencies of `id`.
    pub async fn require_dependencies(&self, id: &str) -> Result<Vec<String>, AggrError> {
        Ok(self.graph().await?.require_dependencies(id)?.to_vec())
    }

    /// Features tested by `id`.
    pub async fn dependent_features(&self, id: &str) -> Result<Vec<String>, AggrError> {
        Ok(self.graph().await?.dependent_features(id)?.to_vec())
    }

    /// Source URI of `id`.
    pub async fn module_uri(&self, id: &str) -> Result<Option<String>, AggrError> {
        Ok(self.graph().await?.module_uri(id).map(str::to_string))
    }

    /// All module ids in the graph.
    pub async fn module_names(&self) -> Result<Vec<String>, AggrError> {
        Ok(self.graph().await?.module_names())
    }

    /// Aggregate dependency timestamp of the published graph.
    pub async fn last_modified(&self) -> Result<i64, AggrError> {
        Ok(self.graph().await?.last_modified())
    }
}

impl ServiceInner {
    async fn run_refresh(
        &self,
        mut state: OwnedRwLockWriteGuard<GraphState>,
        request: RefreshRequest,
    ) -> Result<RefreshOutcome> {
        let config = self.config.read().clone();
        tracing::info!(
            target: "deps",
            "Refreshing dependency graph for '{}' (validate: {}, clean: {})",
            config.name,
            request.validate,
            request.clean
        );

        let rebuilt = match self.rebuild(&config, request).await {
            Ok(rebuilt) => rebuilt,
            Err(e) => {
                tracing::error!(target: "deps", "Dependency graph refresh failed: {:#}", e);
                if state.graph.is_none() {
                    state.init_error = Some(format!("{e:#}"));
                }
                return Err(e);
            }
        };

        let graph = Arc::new(rebuilt.graph);
        state.sequence += 1;
        state.graph = Some(Arc::clone(&graph));
        state.init_error = None;
        let sequence = state.sequence;
        drop(state);

        let outcome = RefreshOutcome {
            sequence,
            parse_count: rebuilt.parse_count,
            reused_persisted: rebuilt.reused_persisted,
            retried_clean: rebuilt.retried_clean,
            last_modified: graph.last_modified(),
        };
        tracing::info!(
            target: "deps",
            "Dependency graph {} published ({} modules, {} parsed)",
            sequence,
            graph.module_names().len(),
            outcome.parse_count
        );

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.dependencies_loaded(&graph, sequence);
        }
        Ok(outcome)
    }

    async fn rebuild(&self, config: &AggregatorConfig, request: RefreshRequest) -> Result<Rebuilt> {
        let fingerprint = config.fingerprint()?;
        let cache_path = config.deps_cache_path();

        let mut validate = request.validate;
        let mut clean = request.clean;
        let mut retried_clean = false;

        let (trees, parse_count, reused_persisted) = loop {
            let persisted = if clean {
                None
            } else {
                self.load_persisted(config, &cache_path, &mut validate).await
            };

            match self.build_trees(config, &fingerprint, persisted, validate).await {
                Ok(built) => break built,
                Err(e) if !clean => {
                    tracing::warn!(
                        target: "deps",
                        "Dependency build using cached trees failed, retrying from clean: {:#}",
                        e
                    );
                    clean = true;
                    validate = true;
                    retried_clean = true;
                }
                Err(e) => return Err(e),
            }
        };

        let roots = config.module_roots();
        let kept: Vec<PathBuf> = trees.keys().cloned().collect();
        let mounts: Vec<MountPoint> = roots
            .iter()
            .filter_map(|root| {
                let (tree_root, relative) = locate_in_roots(&kept, &root.path)?;
                Some(MountPoint {
                    mount: root.mount.clone(),
                    tree_root: tree_root.clone(),
                    relative,
                })
            })
            .collect();

        let graph = CompositeGraph::compose(&trees, &mounts);
        if !reused_persisted {
            let snapshot = GraphSnapshot::new(
                config.name.clone(),
                fingerprint,
                config.options.cache_bust.clone(),
                self.stamp.load(Ordering::Relaxed),
                trees,
            );
            if let Err(e) = snapshot.persist(&cache_path).await {
                tracing::warn!(target: "deps", "Failed to persist dependency trees: {:#}", e);
            }
        }

        Ok(Rebuilt {
            graph,
            parse_count,
            reused_persisted,
            retried_clean,
        })
    }

    async fn load_persisted(
        &self,
        config: &AggregatorConfig,
        path: &std::path::Path,
        validate: &mut bool,
    ) -> Option<GraphSnapshot> {
        let snapshot = match GraphSnapshot::load(path).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(target: "deps", "Ignoring unreadable dependency trees: {:#}", e);
                return None;
            }
        };

        if !snapshot.is_compatible(&config.name, config.options.cache_bust.as_deref()) {
            tracing::info!(
                target: "deps",
                "Discarding persisted dependency trees from {} (stale cache-bust token or format)",
                path.display()
            );
            return None;
        }
        let stamp = self.stamp.load(Ordering::Relaxed);
        if stamp > snapshot.stamp {
            tracing::debug!(target: "deps", "Persisted dependency trees predate stamp {}", stamp);
            *validate = true;
        }
        Some(snapshot)
    }

    async fn build_trees(
        &self,
        config: &AggregatorConfig,
        fingerprint: &str,
        persisted: Option<GraphSnapshot>,
        validate: bool,
    ) -> Result<(BTreeMap<PathBuf, DependencyTree>, usize, bool)> {
        let paths: Vec<PathBuf> = config.module_roots().into_iter().map(|r| r.path).collect();
        let paths = remove_redundant_paths(&paths);

        let mut cached = persisted.map(|s| (s.fingerprint == fingerprint, s.trees));
        if let Some((true, trees)) = &cached
            && !validate
            && paths.iter().all(|p| trees.contains_key(p))
        {
            tracing::debug!(target: "deps", "Reusing persisted dependency trees without validation");
            let trees = paths
                .iter()
                .filter_map(|p| trees.get_key_value(p))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            return Ok((trees, 0, true));
        }

        let parser_pool = Arc::new(Semaphore::new(config.options.parser_pool_size));
        let extensions = Arc::new(config.module_extensions.clone());
        let builders: Vec<DependencyTreeBuilder> = paths
            .into_iter()
            .map(|path| {
                let cached_tree = cached.as_mut().and_then(|(_, trees)| trees.remove(&path));
                DependencyTreeBuilder::new(
                    path,
                    Arc::clone(&self.provider),
                    Arc::clone(&self.parser),
                    Arc::clone(&parser_pool),
                    Arc::clone(&extensions),
                )
                .with_cached(cached_tree)
            })
            .collect();

        let results: Vec<Result<BuildResult>> = stream::iter(builders)
            .map(DependencyTreeBuilder::build)
            .buffer_unordered(config.options.builder_pool_size.max(1))
            .collect()
            .await;

        let mut trees = BTreeMap::new();
        let mut parse_count = 0;
        for result in results {
            let BuildResult {
                root,
                mut tree,
                parse_count: parsed,
            } = result.context("Failed to build dependency tree")?;
            tree.prune();
            parse_count += parsed;
            trees.insert(root, tree);
        }
        Ok((trees, parse_count, false))
    }
}

struct Rebuilt {
    graph: CompositeGraph,
    parse_count: usize,
    reused_persisted: bool,
    retried_clean: bool,
}
