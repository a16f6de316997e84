//! Arena-backed dependency trees
//!
//! A [`DependencyTree`] mirrors a directory tree: each [`DependencyNode`] is one path
//! segment, and nodes that correspond to module files carry the module's declared
//! dependencies and timestamps. Nodes live in a `Vec` and refer to each other by
//! [`NodeId`]; the parent link is an index, so the tree has no ownership cycles and
//! serializes as a flat list.
//!
//! Removing nodes (see [`DependencyTree::prune`]) compacts the arena, so node ids are
//! only stable between structural edits.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Index of a node within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: Self = Self(0);

    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dependency lists declared by one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredDeps {
    /// Ids listed in the module's `define` call
    pub define: Vec<String>,
    /// Ids listed in `require([...])` calls inside the module
    pub require: Vec<String>,
    /// Feature names the module tests
    pub features: Vec<String>,
}

/// One node of a [`DependencyTree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyNode {
    name: String,
    parent: Option<NodeId>,
    children: BTreeMap<String, NodeId>,
    deps: Option<DeclaredDeps>,
    last_modified: i64,
    last_modified_dep: i64,
    uri: Option<String>,
}

impl DependencyNode {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: BTreeMap::new(),
            deps: None,
            last_modified: -1,
            last_modified_dep: -1,
            uri: None,
        }
    }

    /// Path segment name (never contains `/`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent node, `None` for the root.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Children keyed by name.
    #[must_use]
    pub const fn children(&self) -> &BTreeMap<String, NodeId> {
        &self.children
    }

    /// Declared dependencies, `None` if the node is not a parsed module.
    #[must_use]
    pub const fn deps(&self) -> Option<&DeclaredDeps> {
        self.deps.as_ref()
    }

    /// Source file modification time, or -1 if never parsed.
    #[must_use]
    pub const fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Time at which the declared dependency lists last changed, or -1.
    #[must_use]
    pub const fn last_modified_dep(&self) -> i64 {
        self.last_modified_dep
    }

    /// Source resource identifier.
    #[must_use]
    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    /// Set the source resource identifier.
    pub fn set_uri(&mut self, uri: impl Into<String>) {
        self.uri = Some(uri.into());
    }

    /// Record freshly parsed dependency lists.
    ///
    /// The dependency timestamp only advances when the lists differ from the ones
    /// already on the node (or none were recorded yet), so touching a file without
    /// changing its declarations leaves `last_modified_dep` alone.
    pub fn update_declared(&mut self, deps: DeclaredDeps, last_modified: i64) {
        if self.last_modified_dep == -1 || self.deps.as_ref() != Some(&deps) {
            self.last_modified_dep = last_modified;
        }
        self.deps = Some(deps);
        self.last_modified = last_modified;
    }

    /// Copy declarations and timestamps (not children) from another node.
    pub fn copy_declarations_from(&mut self, other: &Self) {
        self.deps.clone_from(&other.deps);
        self.last_modified = other.last_modified;
        self.last_modified_dep = other.last_modified_dep;
        self.uri.clone_from(&other.uri);
    }

    pub(crate) fn deps_mut(&mut self) -> Option<&mut DeclaredDeps> {
        self.deps.as_mut()
    }

    fn is_prunable_leaf(&self) -> bool {
        self.deps.is_none() && self.uri.is_none()
    }
}

/// Tree of [`DependencyNode`]s stored in an arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyTree {
    nodes: Vec<DependencyNode>,
}

impl DependencyTree {
    /// Create a tree containing only a root node named `root_name`.
    #[must_use]
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            nodes: vec![DependencyNode::new(root_name.into(), None)],
        }
    }

    /// Root node id.
    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// Access a node.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.index()]
    }

    /// Mutable access to a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut DependencyNode {
        &mut self.nodes[id.index()]
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Child of `parent` named `name`.
    #[must_use]
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent).children.get(name).copied()
    }

    fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(existing) = self.child(parent, name) {
            return existing;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(DependencyNode::new(name.to_string(), Some(parent)));
        self.nodes[parent.index()].children.insert(name.to_string(), id);
        id
    }

    /// Find or create the node for a `/`-separated path relative to the root.
    ///
    /// Empty segments are ignored, so `""` names the root itself.
    pub fn create_or_get(&mut self, path: &str) -> NodeId {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(NodeId::ROOT, |id, segment| self.add_child(id, segment))
    }

    /// Node for a `/`-separated path relative to `from`.
    #[must_use]
    pub fn descendant_of(&self, from: NodeId, path: &str) -> Option<NodeId> {
        path.split('/')
            .filter(|s| !s.is_empty())
            .try_fold(from, |id, segment| self.child(id, segment))
    }

    /// Node for a `/`-separated path relative to the root.
    #[must_use]
    pub fn get_descendant(&self, path: &str) -> Option<NodeId> {
        self.descendant_of(NodeId::ROOT, path)
    }

    /// Segment names from the root (exclusive) down to `id` (inclusive).
    #[must_use]
    pub fn segments(&self, id: NodeId) -> Vec<&str> {
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            if node.parent.is_some() {
                segments.push(node.name.as_str());
            }
            current = node.parent;
        }
        segments.reverse();
        segments
    }

    /// `/`-joined path of `id` relative to the root.
    #[must_use]
    pub fn path_of(&self, id: NodeId) -> String {
        self.segments(id).join("/")
    }

    /// Ids of all nodes reachable from the root, in depth-first pre-order.
    #[must_use]
    pub fn ids(&self) -> Vec<NodeId> {
        self.subtree_ids(NodeId::ROOT)
    }

    /// Ids of `from` and all its descendants, in depth-first pre-order.
    #[must_use]
    pub fn subtree_ids(&self, from: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.node(id).children.values().rev().copied());
        }
        out
    }

    /// Reachable nodes that carry declared dependencies.
    pub fn modules(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.ids()
            .into_iter()
            .map(|id| (id, self.node(id)))
            .filter(|(_, node)| node.deps.is_some())
    }

    /// Latest `last_modified_dep` of any module in the tree, or -1.
    #[must_use]
    pub fn last_modified_dep_tree(&self) -> i64 {
        self.modules()
            .map(|(_, node)| node.last_modified_dep)
            .max()
            .unwrap_or(-1)
    }

    /// Remove subtrees that contain no module and no resource.
    ///
    /// A node is removed when it has no dependency lists, no URI and no surviving
    /// children. The root is always kept. The arena is compacted afterwards.
    pub fn prune(&mut self) {
        let order = self.ids();
        let mut keep = vec![false; self.nodes.len()];
        for &id in order.iter().rev() {
            let node = self.node(id);
            let kept = id == NodeId::ROOT
                || !node.is_prunable_leaf()
                || node.children.values().any(|c| keep[c.index()]);
            keep[id.index()] = kept;
        }
        if order.iter().all(|id| keep[id.index()]) && order.len() == self.nodes.len() {
            return;
        }

        let mut compacted = Self::new(self.node(NodeId::ROOT).name.clone());
        compacted.nodes[0].copy_declarations_from(self.node(NodeId::ROOT));
        compacted.copy_children(NodeId::ROOT, self, NodeId::ROOT, &|id| keep[id.index()]);
        *self = compacted;
    }

    /// Deep-copy `source_node`'s declarations and descendants onto `target`.
    ///
    /// Existing children of `target` are merged with the copied ones; declarations
    /// from `source` replace those already present. Returns the ids of nodes in this
    /// tree that received declarations.
    pub fn graft(&mut self, target: NodeId, source: &Self, source_node: NodeId) -> Vec<NodeId> {
        let mut touched = Vec::new();
        let mut stack = vec![(target, source_node)];
        while let Some((to, from)) = stack.pop() {
            let from_node = source.node(from);
            if from_node.deps.is_some() || from_node.uri.is_some() {
                self.node_mut(to).copy_declarations_from(from_node);
                if from_node.deps.is_some() {
                    touched.push(to);
                }
            }
            for (name, &child) in &from_node.children {
                let copy = self.add_child(to, name);
                stack.push((copy, child));
            }
        }
        touched
    }

    fn copy_children(&mut self, to: NodeId, source: &Self, from: NodeId, keep: &dyn Fn(NodeId) -> bool) {
        for (name, &child) in &source.node(from).children {
            if !keep(child) {
                continue;
            }
            let copy = self.add_child(to, name);
            self.node_mut(copy).copy_declarations_from(source.node(child));
            self.copy_children(copy, source, child, keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(define: &[&str]) -> DeclaredDeps {
        DeclaredDeps {
            define: define.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_or_get_builds_path() {
        let mut tree = DependencyTree::new("/src");
        let leaf = tree.create_or_get("app/widgets/button");
        assert_eq!(tree.create_or_get("/app/widgets/button/"), leaf);
        assert_eq!(tree.path_of(leaf), "app/widgets/button");
        assert_eq!(tree.get_descendant("app/widgets"), tree.node(leaf).parent());
        assert_eq!(tree.get_descendant("app/missing"), None);
        assert_eq!(tree.create_or_get(""), tree.root());
    }

    #[test]
    fn test_dependency_timestamp_tracks_content() {
        let mut tree = DependencyTree::new("/src");
        let id = tree.create_or_get("a");
        let node = tree.node_mut(id);

        node.update_declared(deps(&["b"]), 100);
        assert_eq!(node.last_modified_dep(), 100);

        // touched, same declarations
        node.update_declared(deps(&["b"]), 200);
        assert_eq!(node.last_modified(), 200);
        assert_eq!(node.last_modified_dep(), 100);

        node.update_declared(deps(&["b", "c"]), 300);
        assert_eq!(node.last_modified_dep(), 300);
    }

    #[test]
    fn test_prune_removes_empty_subtrees() {
        let mut tree = DependencyTree::new("/src");
        let a = tree.create_or_get("app/a");
        tree.node_mut(a).update_declared(deps(&[]), 1);
        tree.create_or_get("app/empty/deeper");
        tree.create_or_get("other");
        let res = tree.create_or_get("res/data");
        tree.node_mut(res).set_uri("file:///src/res/data");

        tree.prune();

        assert!(tree.get_descendant("app/a").is_some());
        assert!(tree.get_descendant("app/empty").is_none());
        assert!(tree.get_descendant("other").is_none());
        assert!(tree.get_descendant("res/data").is_some());
        assert_eq!(tree.len(), 5);

        let a = tree.get_descendant("app/a").unwrap();
        assert_eq!(tree.node(a).deps(), Some(&deps(&[])));
    }

    #[test]
    fn test_graft_deep_copies_and_overlays() {
        let mut source = DependencyTree::new("/lib");
        let util = source.create_or_get("util/string");
        source.node_mut(util).update_declared(deps(&["./base"]), 5);

        let mut composite = DependencyTree::new("");
        let existing = composite.create_or_get("pkg/util/other");
        composite.node_mut(existing).update_declared(deps(&[]), 1);

        let mount = composite.create_or_get("pkg");
        let touched = composite.graft(mount, &source, source.root());

        let copied = composite.get_descendant("pkg/util/string").unwrap();
        assert_eq!(touched, vec![copied]);
        assert_eq!(composite.node(copied).deps(), Some(&deps(&["./base"])));
        assert!(composite.get_descendant("pkg/util/other").is_some());

        // the source is untouched by edits to the copy
        composite.node_mut(copied).update_declared(deps(&["x"]), 9);
        assert_eq!(source.node(util).deps(), Some(&deps(&["./base"])));
    }

    #[test]
    fn test_last_modified_dep_tree() {
        let mut tree = DependencyTree::new("/src");
        assert_eq!(tree.last_modified_dep_tree(), -1);

        for (path, stamp) in [("a", 10), ("b/c", 30), ("d", 20)] {
            let id = tree.create_or_get(path);
            tree.node_mut(id).update_declared(deps(&[]), stamp);
        }
        assert_eq!(tree.last_modified_dep_tree(), 30);
    }

    #[test]
    fn test_serde_restores_parent_links() {
        let mut tree = DependencyTree::new("/src");
        let id = tree.create_or_get("x/y");
        tree.node_mut(id).update_declared(deps(&["z"]), 3);

        let json = serde_json::to_string(&tree).unwrap();
        let restored: DependencyTree = serde_json::from_str(&json).unwrap();
        let y = restored.get_descendant("x/y").unwrap();
        assert_eq!(restored.path_of(y), "x/y");
        assert_eq!(restored, tree);
    }
}
