//! Persisted form of the per-root dependency trees
//!
//! The graph service writes one snapshot per server identity after every rebuild
//! and reads it back at startup. The header fields decide whether the stored trees
//! may be reused as-is, only as a cache for revalidation, or not at all.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::node::DependencyTree;
use crate::constants::GRAPH_FORMAT_VERSION;
use crate::utils::{read_json_file, write_json_file};

/// Raw dependency trees keyed by root path, with the header they were built under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    /// Layout version; snapshots of another version are ignored
    pub format_version: u32,
    /// Server identity the snapshot belongs to
    pub name: String,
    /// Configuration fingerprint the trees were built under
    pub fingerprint: String,
    /// Invalidation token in effect when the trees were built
    pub cache_bust: Option<String>,
    /// Stamp of the deployment the trees were built for (ms since the epoch)
    pub stamp: i64,
    /// One tree per kept root
    pub trees: BTreeMap<PathBuf, DependencyTree>,
}

impl GraphSnapshot {
    /// New snapshot at the current format version.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        cache_bust: Option<String>,
        stamp: i64,
        trees: BTreeMap<PathBuf, DependencyTree>,
    ) -> Self {
        Self {
            format_version: GRAPH_FORMAT_VERSION,
            name: name.into(),
            fingerprint: fingerprint.into(),
            cache_bust,
            stamp,
            trees,
        }
    }

    /// Read a snapshot. Returns `None` if the file does not exist.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        read_json_file(path).await
    }

    /// Write the snapshot atomically.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        write_json_file(path, self).await?;
        tracing::debug!(
            target: "deps",
            "Persisted dependency trees for {} roots to {}",
            self.trees.len(),
            path.display()
        );
        Ok(())
    }

    /// Whether this snapshot may be used at all for `name` under `cache_bust`.
    #[must_use]
    pub fn is_compatible(&self, name: &str, cache_bust: Option<&str>) -> bool {
        self.format_version == GRAPH_FORMAT_VERSION
            && self.name == name
            && self.cache_bust.as_deref() == cache_bust
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::node::DeclaredDeps;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_and_load() -> Result<()> {
        let temp = TempDir::new()?;
        let path = temp.path().join("deps/depmap.cache");

        assert!(GraphSnapshot::load(&path).await?.is_none());

        let mut tree = DependencyTree::new("/src");
        let id = tree.create_or_get("a");
        tree.node_mut(id).update_declared(
            DeclaredDeps {
                define: vec!["b".to_string()],
                ..Default::default()
            },
            42,
        );
        let mut trees = BTreeMap::new();
        trees.insert(PathBuf::from("/src"), tree);

        let snapshot = GraphSnapshot::new("srv", "abc", Some("v1".to_string()), 7, trees);
        snapshot.persist(&path).await?;

        let loaded = GraphSnapshot::load(&path).await?.unwrap();
        assert_eq!(loaded, snapshot);
        Ok(())
    }

    #[test]
    fn test_compatibility() {
        let snapshot = GraphSnapshot::new("srv", "abc", Some("v1".to_string()), 0, BTreeMap::new());
        assert!(snapshot.is_compatible("srv", Some("v1")));
        assert!(!snapshot.is_compatible("srv", Some("v2")));
        assert!(!snapshot.is_compatible("srv", None));
        assert!(!snapshot.is_compatible("other", Some("v1")));

        let old = GraphSnapshot {
            format_version: GRAPH_FORMAT_VERSION - 1,
            ..snapshot
        };
        assert!(!old.is_compatible("srv", Some("v1")));
    }
}
