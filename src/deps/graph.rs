//! The merged, queryable dependency graph
//!
//! A [`CompositeGraph`] is assembled from the raw per-root trees: each configured
//! mount copies the subtree of its root under its mount name, relative dependency
//! ids are rewritten to absolute ids against the referring module's position, and
//! each dependency is resolved to the node of the module it names where one exists.
//!
//! Composite graphs are immutable once built. The graph service publishes a new
//! one after every rebuild; readers holding an `Arc` to the old one keep a
//! consistent view.
//!
//! # Expanded dependencies
//!
//! [`CompositeGraph::expanded_dependencies`] follows `define` dependencies
//! transitively. Each reached module is tagged with the formula under which it is
//! reached: `has!` expressions on defined features take one branch, on undefined
//! features both branches with the feature's state added to the term. Formulas are
//! minimized before they are returned and modules only reachable under FALSE are
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use super::node::{DeclaredDeps, DependencyTree, NodeId};
use super::paths::normalize_dependency;
use crate::constants::RESERVED_MODULE_IDS;
use crate::core::AggrError;
use crate::formula::has::{is_has_plugin, split_plugin};
use crate::formula::{BooleanFormula, BooleanTerm, Features, HasNode};

/// Where one configured root appears in the composite graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Module id prefix
    pub mount: String,
    /// Raw tree that contains the root
    pub tree_root: PathBuf,
    /// Location of the root inside that tree (`/`-separated, empty for the tree root)
    pub relative: String,
}

/// Modules reachable from a module, with the conditions under which they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpandedDependencies {
    entries: Vec<(String, BooleanFormula)>,
}

impl ExpandedDependencies {
    /// Module ids in discovery order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    /// Entries in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BooleanFormula)> {
        self.entries.iter().map(|(id, f)| (id.as_str(), f))
    }

    /// Condition under which `id` is included.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&BooleanFormula> {
        self.entries.iter().find(|(k, _)| k == id).map(|(_, f)| f)
    }

    /// Whether `id` is included under some feature assignment.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Number of included modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates module ids with the terms that reach them.
#[derive(Default)]
struct ModuleDeps {
    order: Vec<String>,
    formulas: HashMap<String, BooleanFormula>,
}

impl ModuleDeps {
    /// Record that `id` is reached under `term`. Returns `true` if this is new.
    fn add(&mut self, id: &str, term: &BooleanTerm) -> bool {
        match self.formulas.get_mut(id) {
            Some(formula) => formula.add_term(term.clone()),
            None => {
                self.order.push(id.to_string());
                self.formulas
                    .insert(id.to_string(), BooleanFormula::from_terms([term.clone()]));
                true
            }
        }
    }

    fn finish(mut self, exclude: &str) -> Result<ExpandedDependencies, AggrError> {
        let mut entries = Vec::with_capacity(self.order.len());
        for id in self.order {
            if id == exclude {
                continue;
            }
            let Some(formula) = self.formulas.remove(&id) else {
                continue;
            };
            let simplified = formula.simplify()?;
            if !simplified.is_false() {
                entries.push((id, simplified));
            }
        }
        Ok(ExpandedDependencies { entries })
    }
}

/// Merged dependency graph over all mounted roots.
#[derive(Debug, Clone)]
pub struct CompositeGraph {
    tree: DependencyTree,
    resolved: HashMap<NodeId, Vec<Option<NodeId>>>,
    last_modified: i64,
}

impl CompositeGraph {
    /// Mount the raw trees, normalize dependency ids and resolve them.
    ///
    /// Mounts are applied in order; a later mount overlays nodes created by an
    /// earlier one. Dependencies whose relative ids escape their mount point are
    /// dropped with a warning.
    #[must_use]
    pub fn compose(trees: &BTreeMap<PathBuf, DependencyTree>, mounts: &[MountPoint]) -> Self {
        let mut tree = DependencyTree::new("");

        for mount in mounts {
            let Some(source) = trees.get(&mount.tree_root) else {
                tracing::warn!(
                    target: "deps",
                    "No dependency tree for {} (mount '{}')",
                    mount.tree_root.display(),
                    mount.mount
                );
                continue;
            };
            let Some(source_node) = source.get_descendant(&mount.relative) else {
                tracing::debug!(
                    target: "deps",
                    "No modules under {} for mount '{}'",
                    mount.tree_root.join(&mount.relative).display(),
                    mount.mount
                );
                continue;
            };

            let target = tree.create_or_get(&mount.mount);
            let floor = mount.mount.split('/').filter(|s| !s.is_empty()).count();
            for id in tree.graft(target, source, source_node) {
                normalize_node(&mut tree, id, floor);
            }
        }

        let resolved = tree
            .modules()
            .filter_map(|(id, node)| {
                let deps = node.deps()?;
                let targets = deps
                    .define
                    .iter()
                    .map(|dep| {
                        if dep.contains('!') {
                            None
                        } else {
                            tree.get_descendant(dep)
                                .filter(|t| tree.node(*t).deps().is_some())
                        }
                    })
                    .collect();
                Some((id, targets))
            })
            .collect();

        let last_modified = tree.last_modified_dep_tree();
        Self {
            tree,
            resolved,
            last_modified,
        }
    }

    /// The merged tree.
    #[must_use]
    pub const fn tree(&self) -> &DependencyTree {
        &self.tree
    }

    /// Latest dependency-list change of any module, or -1 for an empty graph.
    #[must_use]
    pub const fn last_modified(&self) -> i64 {
        self.last_modified
    }

    fn module(&self, id: &str) -> Option<NodeId> {
        if id.is_empty() {
            return None;
        }
        self.tree
            .get_descendant(id)
            .filter(|n| self.tree.node(*n).deps().is_some())
    }

    fn declared(&self, id: &str) -> Result<&DeclaredDeps, AggrError> {
        self.module(id)
            .and_then(|n| self.tree.node(n).deps())
            .ok_or_else(|| AggrError::ModuleNotFound { id: id.to_string() })
    }

    /// Normalized ids from the module's `define` call.
    pub fn declared_dependencies(&self, id: &str) -> Result<&[String], AggrError> {
        Ok(&self.declared(id)?.define)
    }

    /// Normalized ids from the module's `require([...])` calls.
    pub fn require_dependencies(&self, id: &str) -> Result<&[String], AggrError> {
        Ok(&self.declared(id)?.require)
    }

    /// Features the module tests.
    pub fn dependent_features(&self, id: &str) -> Result<&[String], AggrError> {
        Ok(&self.declared(id)?.features)
    }

    /// Source URI of a module.
    #[must_use]
    pub fn module_uri(&self, id: &str) -> Option<&str> {
        self.module(id).and_then(|n| self.tree.node(n).uri())
    }

    /// Ids of every module in the graph, sorted.
    #[must_use]
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tree
            .modules()
            .map(|(id, _)| self.tree.path_of(id))
            .filter(|name| !name.is_empty())
            .collect();
        names.sort();
        names
    }

    /// Modules reachable from `id` through `define` dependencies under `features`.
    ///
    /// # Errors
    ///
    /// [`AggrError::ModuleNotFound`] if `id` is not a module, or
    /// [`AggrError::TooManyVariables`] if a gating formula cannot be minimized.
    pub fn expanded_dependencies(
        &self,
        id: &str,
        features: &Features,
    ) -> Result<ExpandedDependencies, AggrError> {
        let start = self
            .module(id)
            .ok_or_else(|| AggrError::ModuleNotFound { id: id.to_string() })?;

        let mut found = ModuleDeps::default();
        let mut work = vec![(start, BooleanTerm::new())];
        while let Some((node, term)) = work.pop() {
            let Some(deps) = self.tree.node(node).deps() else {
                continue;
            };
            let hints = self.resolved.get(&node);
            for (i, dep) in deps.define.iter().enumerate() {
                let hint = hints.and_then(|h| h.get(i).copied().flatten());
                self.visit(dep, hint, &term, features, &mut found, &mut work);
            }
        }

        found.finish(id)
    }

    fn visit(
        &self,
        dep: &str,
        hint: Option<NodeId>,
        term: &BooleanTerm,
        features: &Features,
        found: &mut ModuleDeps,
        work: &mut Vec<(NodeId, BooleanTerm)>,
    ) {
        if RESERVED_MODULE_IDS.contains(&dep) {
            return;
        }

        let Some((plugin, resource)) = split_plugin(dep) else {
            self.include(dep, hint, term, found, work);
            return;
        };

        self.include(plugin, None, term, found, work);
        if is_has_plugin(plugin) {
            for (leaf, leaf_term) in HasNode::parse(resource).evaluate_all(features, term) {
                self.visit(&leaf, None, &leaf_term, features, found, work);
            }
        } else {
            found.add(dep, term);
        }
    }

    fn include(
        &self,
        id: &str,
        hint: Option<NodeId>,
        term: &BooleanTerm,
        found: &mut ModuleDeps,
        work: &mut Vec<(NodeId, BooleanTerm)>,
    ) {
        if found.add(id, term)
            && let Some(target) = hint.or_else(|| self.module(id))
        {
            work.push((target, term.clone()));
        }
    }
}

fn normalize_list(reference: &[&str], floor: usize, ids: &[String], uri: Option<&str>) -> Vec<String> {
    ids.iter()
        .filter_map(|id| match normalize_dependency(reference, floor, id) {
            Ok(normalized) => Some(normalized),
            Err(e) => {
                tracing::warn!(target: "deps", "Dropping dependency of {}: {}", uri.unwrap_or("?"), e);
                None
            }
        })
        .collect()
}

fn normalize_node(tree: &mut DependencyTree, id: NodeId, floor: usize) {
    let reference: Vec<String> = match tree.node(id).parent() {
        Some(parent) => tree.segments(parent).into_iter().map(str::to_string).collect(),
        None => Vec::new(),
    };
    let reference: Vec<&str> = reference.iter().map(String::as_str).collect();

    let node = tree.node(id);
    let Some(deps) = node.deps() else {
        return;
    };
    let define = normalize_list(&reference, floor, &deps.define, node.uri());
    let require = normalize_list(&reference, floor, &deps.require, node.uri());

    if let Some(deps) = tree.node_mut(id).deps_mut() {
        deps.define = define;
        deps.require = require;
    }
}
