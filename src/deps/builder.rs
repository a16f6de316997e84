//! Incremental dependency tree construction for one source root
//!
//! [`DependencyTreeBuilder`] walks a root directory and produces a
//! [`DependencyTree`] whose module nodes carry the dependencies declared by each
//! file. When a previously built tree for the same root is supplied, nodes whose
//! file modification time is unchanged reuse the cached declarations and are not
//! re-parsed.
//!
//! # Concurrency
//!
//! The walk itself is synchronous filesystem work and runs on the blocking pool.
//! Each changed file then becomes a parse task gated by a shared parser semaphore.
//! The builder awaits its own parse tasks, so the bound on concurrent builders and
//! the bound on concurrent parses are separate resources: builders waiting on
//! parses never hold a permit parses need.
//!
//! # Errors
//!
//! A file that fails to read or parse is logged and recorded as declaring no
//! dependencies. Failures of the walk itself, or a parse task that panics, abort
//! the build.

use anyhow::{Context, Result};
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::node::{DeclaredDeps, DependencyTree, NodeId};
use super::parser::SourceParser;
use crate::resource::{ResourceProvider, WalkEntry};

/// Outcome of building one root.
#[derive(Debug)]
pub struct BuildResult {
    /// The root directory that was walked
    pub root: PathBuf,
    /// The built tree (names relative to the root)
    pub tree: DependencyTree,
    /// Number of files that were parsed (not reused from the cached tree)
    pub parse_count: usize,
}

/// A module file whose declarations must be (re)parsed.
#[derive(Debug)]
struct PendingParse {
    node: NodeId,
    path: PathBuf,
    uri: String,
    last_modified: i64,
}

/// Builds or revalidates the dependency tree of a single source root.
pub struct DependencyTreeBuilder {
    root: PathBuf,
    cached: Option<DependencyTree>,
    provider: Arc<dyn ResourceProvider>,
    parser: Arc<dyn SourceParser>,
    parser_pool: Arc<Semaphore>,
    extensions: Arc<Vec<String>>,
}

impl DependencyTreeBuilder {
    /// Create a builder for `root`.
    ///
    /// `parser_pool` bounds concurrent parse tasks and is normally shared by all
    /// builders of one rebuild.
    pub fn new(
        root: impl Into<PathBuf>,
        provider: Arc<dyn ResourceProvider>,
        parser: Arc<dyn SourceParser>,
        parser_pool: Arc<Semaphore>,
        extensions: Arc<Vec<String>>,
    ) -> Self {
        Self {
            root: root.into(),
            cached: None,
            provider,
            parser,
            parser_pool,
            extensions,
        }
    }

    /// Reuse declarations from a previous build of the same root.
    #[must_use]
    pub fn with_cached(mut self, cached: Option<DependencyTree>) -> Self {
        self.cached = cached;
        self
    }

    /// Walk the root and parse every changed module.
    pub async fn build(self) -> Result<BuildResult> {
        let Self {
            root,
            cached,
            provider,
            parser,
            parser_pool,
            extensions,
        } = self;

        tracing::debug!(target: "deps", "Building dependency tree for {}", root.display());

        let walk_root = root.clone();
        let walk_provider = Arc::clone(&provider);
        let (mut tree, pending) = tokio::task::spawn_blocking(move || {
            walk(&walk_root, cached.as_ref(), walk_provider.as_ref(), &extensions)
        })
        .await
        .context("Tree walk task failed")??;

        let parse_count = pending.len();
        let tasks = pending.into_iter().map(|job| {
            let provider = Arc::clone(&provider);
            let parser = Arc::clone(&parser);
            let pool = Arc::clone(&parser_pool);
            tokio::spawn(async move {
                let _permit = pool.acquire_owned().await?;
                let PendingParse {
                    node,
                    path,
                    uri,
                    last_modified,
                } = job;
                let deps = tokio::task::spawn_blocking(move || {
                    parse_file(provider.as_ref(), parser.as_ref(), &path, &uri)
                })
                .await?;
                anyhow::Ok((node, deps, last_modified))
            })
        });

        let results = try_join_all(tasks)
            .await
            .with_context(|| format!("Parse task failed while building {}", root.display()))?;

        for result in results {
            let (node, deps, last_modified) = result?;
            tree.node_mut(node).update_declared(deps, last_modified);
        }

        tracing::debug!(
            target: "deps",
            "Built dependency tree for {} ({} nodes, {} parsed)",
            root.display(),
            tree.len(),
            parse_count
        );

        Ok(BuildResult {
            root,
            tree,
            parse_count,
        })
    }
}

fn strip_extension<'a>(relative: &'a str, extensions: &[String]) -> Option<&'a str> {
    extensions.iter().find_map(|ext| {
        relative
            .strip_suffix(ext.as_str())
            .and_then(|stem| stem.strip_suffix('.'))
            .filter(|stem| !stem.is_empty() && !stem.ends_with('/'))
    })
}

/// Synchronous tree walk. Runs on the blocking pool.
fn walk(
    root: &Path,
    cached: Option<&DependencyTree>,
    provider: &dyn ResourceProvider,
    extensions: &[String],
) -> Result<(DependencyTree, Vec<PendingParse>)> {
    let mut tree = DependencyTree::new(provider.uri(root));
    let mut pending = Vec::new();

    let mut visit_module = |tree: &mut DependencyTree, name: &str, entry: &WalkEntry| {
        let id = tree.create_or_get(name);
        if let Some(cached) = cached
            && let Some(cached_id) = cached.get_descendant(name)
        {
            tree.node_mut(id).copy_declarations_from(cached.node(cached_id));
        }
        let uri = provider.uri(&entry.path);
        let node = tree.node_mut(id);
        node.set_uri(uri.clone());
        if node.last_modified() != entry.last_modified {
            pending.push(PendingParse {
                node: id,
                path: entry.path.clone(),
                uri,
                last_modified: entry.last_modified,
            });
        }
    };

    provider.walk_tree(root, &mut |entry| {
        if entry.is_dir {
            return true;
        }
        if let Some(name) = strip_extension(&entry.relative, extensions) {
            visit_module(&mut tree, name, entry);
        }
        false
    })?;

    // A package directory `pkg/` may have its main module next to it as `pkg.js`.
    if let (Some(parent), Some(dir_name)) = (root.parent(), root.file_name()) {
        for ext in extensions {
            let sibling = parent.join(format!("{}.{ext}", dir_name.to_string_lossy()));
            if !provider.exists(&sibling) {
                continue;
            }
            let last_modified = provider.last_modified(&sibling)?;
            let entry = WalkEntry {
                path: sibling,
                relative: String::new(),
                is_dir: false,
                last_modified,
            };
            visit_module(&mut tree, "", &entry);
            break;
        }
    }

    Ok((tree, pending))
}

fn parse_file(
    provider: &dyn ResourceProvider,
    parser: &dyn SourceParser,
    path: &Path,
    uri: &str,
) -> DeclaredDeps {
    let source = match provider.read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(target: "deps::parser", "Failed to read {}: {:#}", uri, e);
            return DeclaredDeps::default();
        }
    };
    match parser.parse(&source, uri) {
        Ok(deps) => deps,
        Err(e) => {
            tracing::warn!(target: "deps::parser", "{}", e);
            DeclaredDeps::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::parser::AmdDependencyParser;
    use crate::resource::FileSystemProvider;
    use crate::test_utils::set_mtime;
    use std::fs;
    use tempfile::TempDir;

    fn builder(root: &Path) -> DependencyTreeBuilder {
        DependencyTreeBuilder::new(
            root,
            Arc::new(FileSystemProvider),
            Arc::new(AmdDependencyParser),
            Arc::new(Semaphore::new(2)),
            Arc::new(vec!["js".to_string()]),
        )
    }

    #[tokio::test]
    async fn test_build_parses_modules_and_skips_other_files() -> Result<()> {
        let temp = TempDir::new()?;
        let root = temp.path().join("app");
        fs::create_dir_all(root.join("widgets"))?;
        fs::write(root.join("main.js"), r#"define(["./widgets/button"], f);"#)?;
        fs::write(root.join("widgets/button.js"), "define([], f);")?;
        fs::write(root.join("widgets/button.css"), ".b {}")?;
        fs::write(root.join("broken.js"), "define([\"x], f);")?;

        let result = builder(&root).build().await?;
        assert_eq!(result.parse_count, 3);

        let tree = result.tree;
        let main = tree.get_descendant("main").unwrap();
        assert_eq!(tree.node(main).deps().unwrap().define, vec!["./widgets/button".to_string()]);
        assert!(tree.node(main).uri().unwrap().ends_with("main.js"));

        // parse failures are recorded as modules without dependencies
        let broken = tree.get_descendant("broken").unwrap();
        assert_eq!(tree.node(broken).deps(), Some(&DeclaredDeps::default()));

        assert!(tree.get_descendant("widgets/button.css").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_unchanged_files_are_not_reparsed() -> Result<()> {
        let temp = TempDir::new()?;
        let root = temp.path().join("app");
        fs::create_dir_all(&root)?;
        let a = root.join("a.js");
        fs::write(&a, r#"define(["b"], f);"#)?;
        set_mtime(&a, 1_000);
        fs::write(root.join("b.js"), "define([], f);")?;

        let first = builder(&root).build().await?;
        assert_eq!(first.parse_count, 2);

        let second = builder(&root).with_cached(Some(first.tree.clone())).build().await?;
        assert_eq!(second.parse_count, 0);
        assert_eq!(second.tree, first.tree);

        // touched without changing declarations: parsed again, dependency stamp kept
        set_mtime(&a, 2_000);
        let third = builder(&root).with_cached(Some(second.tree)).build().await?;
        assert_eq!(third.parse_count, 1);
        let node = third.tree.node(third.tree.get_descendant("a").unwrap());
        assert_eq!(node.last_modified(), 2_000);
        assert_eq!(node.last_modified_dep(), 1_000);
        Ok(())
    }

    #[tokio::test]
    async fn test_sibling_package_main() -> Result<()> {
        let temp = TempDir::new()?;
        let root = temp.path().join("pkg");
        fs::create_dir_all(&root)?;
        fs::write(root.join("util.js"), "define([], f);")?;
        fs::write(temp.path().join("pkg.js"), r#"define(["./pkg/util"], f);"#)?;

        let result = builder(&root).build().await?;
        let root_node = result.tree.node(result.tree.root());
        assert_eq!(root_node.deps().unwrap().define, vec!["./pkg/util".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_root_fails() {
        let temp = TempDir::new().unwrap();
        let result = builder(&temp.path().join("nope")).build().await;
        assert!(result.is_err());
    }

    #[test]
    fn test_strip_extension() {
        let exts = vec!["js".to_string(), "mjs".to_string()];
        assert_eq!(strip_extension("a/b.js", &exts), Some("a/b"));
        assert_eq!(strip_extension("a/b.mjs", &exts), Some("a/b"));
        assert_eq!(strip_extension("a/b.json", &exts), None);
    }
}
