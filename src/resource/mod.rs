//! Access to module source resources
//!
//! The dependency graph never touches the filesystem directly. It goes through a
//! [`ResourceProvider`], which answers existence and timestamp queries, reads
//! module text, and walks a directory tree depth-first while letting the caller
//! decide per entry whether to descend.
//!
//! [`FileSystemProvider`] is the default implementation backed by `walkdir`. All
//! methods are synchronous; callers in async contexts run them through
//! `tokio::task::spawn_blocking`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

/// One entry reported while walking a resource tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute location of the entry
    pub path: PathBuf,
    /// Location relative to the walk root, `/`-separated
    pub relative: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Modification time in milliseconds since the Unix epoch
    pub last_modified: i64,
}

/// Source of module resources.
pub trait ResourceProvider: Send + Sync + 'static {
    /// Whether the resource exists.
    fn exists(&self, path: &Path) -> bool;

    /// Modification time in milliseconds since the Unix epoch.
    fn last_modified(&self, path: &Path) -> Result<i64>;

    /// Read the resource as UTF-8 text.
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Walk the tree under `root` depth-first.
    ///
    /// `visitor` is called for every entry below `root` (not for `root` itself).
    /// For directories, returning `false` skips the directory's contents.
    fn walk_tree(&self, root: &Path, visitor: &mut dyn FnMut(&WalkEntry) -> bool) -> Result<()>;

    /// A stable textual identifier for the resource.
    fn uri(&self, path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }
}

/// [`ResourceProvider`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemProvider;

impl FileSystemProvider {
    /// Create a filesystem provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn millis(modified: std::time::SystemTime) -> i64 {
    modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl ResourceProvider for FileSystemProvider {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn last_modified(&self, path: &Path) -> Result<i64> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        Ok(millis(metadata.modified()?))
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
    }

    fn walk_tree(&self, root: &Path, visitor: &mut dyn FnMut(&WalkEntry) -> bool) -> Result<()> {
        let mut walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry =
                entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .with_context(|| format!("{} is outside {}", entry.path().display(), root.display()))?
                .to_string_lossy()
                .replace('\\', "/");
            let is_dir = entry.file_type().is_dir();
            let last_modified = entry.metadata().ok().and_then(|m| m.modified().ok()).map_or(0, millis);

            let walk_entry = WalkEntry {
                path: entry.path().to_path_buf(),
                relative,
                is_dir,
                last_modified,
            };

            if !visitor(&walk_entry) && is_dir {
                walker.skip_current_dir();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layout() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("app/nested")).unwrap();
        fs::create_dir_all(temp.path().join("skip")).unwrap();
        fs::write(temp.path().join("app/main.js"), "define([], {});").unwrap();
        fs::write(temp.path().join("app/nested/util.js"), "define([], {});").unwrap();
        fs::write(temp.path().join("skip/hidden.js"), "define([], {});").unwrap();
        temp
    }

    #[test]
    fn test_walk_tree_visits_depth_first() {
        let temp = layout();
        let mut seen = Vec::new();
        FileSystemProvider
            .walk_tree(temp.path(), &mut |entry| {
                seen.push(entry.relative.clone());
                true
            })
            .unwrap();

        assert_eq!(
            seen,
            vec!["app", "app/main.js", "app/nested", "app/nested/util.js", "skip", "skip/hidden.js"]
        );
    }

    #[test]
    fn test_walk_tree_visitor_prunes_directories() {
        let temp = layout();
        let mut seen = Vec::new();
        FileSystemProvider
            .walk_tree(temp.path(), &mut |entry| {
                seen.push(entry.relative.clone());
                entry.relative != "skip"
            })
            .unwrap();

        assert!(seen.contains(&"skip".to_string()));
        assert!(!seen.contains(&"skip/hidden.js".to_string()));
    }

    #[test]
    fn test_last_modified_and_read() {
        let temp = layout();
        let path = temp.path().join("app/main.js");
        let provider = FileSystemProvider::new();

        assert!(provider.exists(&path));
        assert!(provider.last_modified(&path).unwrap() > 0);
        assert_eq!(provider.read_to_string(&path).unwrap(), "define([], {});");
        assert!(provider.last_modified(&temp.path().join("missing.js")).is_err());
    }
}
