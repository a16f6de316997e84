//! Module id and root path utilities
//!
//! - [`remove_redundant_paths`] drops configured roots nested inside other roots so
//!   every source file is walked exactly once.
//! - [`normalize_dependency`] turns relative dependency ids (`./x`, `../y`) into
//!   absolute ids, including the module ids inside `has!` expressions and plugin
//!   resources.
//! - [`validate_module_id`] rejects ids the loader could never resolve.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::core::AggrError;
use crate::formula::HasNode;
use crate::formula::has::{is_has_plugin, split_plugin};

static DISALLOWED_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[{},|<>*]").unwrap());
static URI_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap());

/// Remove paths that are equal to or nested inside another path in the list.
///
/// The result is sorted, so it does not depend on the input order.
///
/// ```rust
/// use aggr_core::deps::paths::remove_redundant_paths;
/// use std::path::PathBuf;
///
/// let paths = ["/a/", "/a/b/", "/c/"].map(PathBuf::from);
/// assert_eq!(remove_redundant_paths(&paths), ["/a/", "/c/"].map(PathBuf::from));
/// ```
#[must_use]
pub fn remove_redundant_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted: Vec<&PathBuf> = paths.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut kept: Vec<PathBuf> = Vec::new();
    for path in sorted {
        if !kept.iter().any(|k| path.starts_with(k)) {
            kept.push(path.clone());
        }
    }
    kept
}

/// The kept root containing `path`, with `path` relative to it (`/`-separated).
#[must_use]
pub fn locate_in_roots<'a>(roots: &'a [PathBuf], path: &Path) -> Option<(&'a PathBuf, String)> {
    roots.iter().find_map(|root| {
        path.strip_prefix(root).ok().map(|relative| {
            let relative = relative.to_string_lossy().replace('\\', "/");
            (root, relative)
        })
    })
}

/// Check that `id` can name a module.
///
/// Ids containing any of `{},|<>*`, ids starting with `/` and absolute URIs
/// (`http://...`) are rejected.
pub fn validate_module_id(id: &str) -> Result<(), AggrError> {
    let reject = |reason: &str| {
        Err(AggrError::InvalidModuleId {
            id: id.to_string(),
            reason: reason.to_string(),
        })
    };

    if id.is_empty() {
        return reject("empty id");
    }
    if DISALLOWED_CHARS.is_match(id) {
        return reject("contains a disallowed character");
    }
    if id.starts_with('/') {
        return reject("absolute paths are not module ids");
    }
    if URI_SCHEME.is_match(id) {
        return reject("absolute URIs are not module ids");
    }
    Ok(())
}

fn is_relative(id: &str) -> bool {
    id == "." || id == ".." || id.starts_with("./") || id.starts_with("../")
}

/// Resolve a relative module id against `reference` (the segments of the referring
/// module's parent).
///
/// `floor` is the number of leading reference segments that belong to the mount
/// point; resolving above it fails, so relative ids cannot cross into another
/// mounted root. Non-relative ids are returned unchanged.
pub fn normalize_module_id(reference: &[&str], floor: usize, id: &str) -> Result<String, AggrError> {
    if !is_relative(id) {
        return Ok(id.to_string());
    }

    let floor = floor.min(reference.len());
    let mut segments: Vec<&str> = reference.to_vec();
    for part in id.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.len() <= floor {
                    return Err(AggrError::InvalidModuleId {
                        id: id.to_string(),
                        reason: "relative path leaves its mounted root".to_string(),
                    });
                }
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Err(AggrError::InvalidModuleId {
            id: id.to_string(),
            reason: "relative path names no module".to_string(),
        });
    }
    Ok(segments.join("/"))
}

/// Normalize a dependency id, including plugin names, plugin resources and the
/// module ids inside `has!` expressions.
pub fn normalize_dependency(reference: &[&str], floor: usize, id: &str) -> Result<String, AggrError> {
    let Some((plugin, resource)) = split_plugin(id) else {
        return normalize_module_id(reference, floor, id);
    };

    let plugin = normalize_module_id(reference, floor, plugin)?;
    if is_has_plugin(&plugin) {
        let mut node = HasNode::parse(resource);
        node.try_map_modules(&mut |leaf| normalize_dependency(reference, floor, leaf))?;
        Ok(format!("{plugin}!{node}"))
    } else {
        let resource = normalize_module_id(reference, floor, resource)?;
        Ok(format!("{plugin}!{resource}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_redundant_paths_order_independent() {
        let expected = vec![PathBuf::from("/a/"), PathBuf::from("/c/")];
        for input in [
            ["/a/", "/a/b/", "/c/"],
            ["/a/b/", "/c/", "/a/"],
            ["/c/", "/a/", "/a/b/"],
        ] {
            let paths: Vec<PathBuf> = input.iter().map(PathBuf::from).collect();
            assert_eq!(remove_redundant_paths(&paths), expected);
        }
    }

    #[test]
    fn test_remove_redundant_paths_keeps_siblings_with_common_prefix() {
        let paths = vec![PathBuf::from("/a"), PathBuf::from("/ab"), PathBuf::from("/a")];
        assert_eq!(remove_redundant_paths(&paths), vec![PathBuf::from("/a"), PathBuf::from("/ab")]);
    }

    #[test]
    fn test_locate_in_roots() {
        let roots = vec![PathBuf::from("/src"), PathBuf::from("/lib")];
        let (root, relative) = locate_in_roots(&roots, Path::new("/lib/dojo/dom")).unwrap();
        assert_eq!(root, &PathBuf::from("/lib"));
        assert_eq!(relative, "dojo/dom");
        assert!(locate_in_roots(&roots, Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn test_validate_module_id() {
        assert!(validate_module_id("dojo/dom").is_ok());
        assert!(validate_module_id("./sibling").is_ok());
        assert!(validate_module_id("dojo/has!touch?./a:./b").is_ok());
        assert!(validate_module_id("text!./tpl.html").is_ok());
        assert!(validate_module_id("a,b").is_err());
        assert!(validate_module_id("{x}").is_err());
        assert!(validate_module_id("/abs/path").is_err());
        assert!(validate_module_id("http://cdn/x.js").is_err());
        assert!(validate_module_id("").is_err());
    }

    #[test]
    fn test_normalize_relative_ids() {
        let reference = ["dojo", "store"];
        assert_eq!(normalize_module_id(&reference, 1, "./util").unwrap(), "dojo/store/util");
        assert_eq!(normalize_module_id(&reference, 1, "../dom").unwrap(), "dojo/dom");
        assert_eq!(normalize_module_id(&reference, 1, "dijit/form").unwrap(), "dijit/form");
        assert!(normalize_module_id(&reference, 1, "../../escape").is_err());
        assert_eq!(normalize_module_id(&reference, 0, "../../top").unwrap(), "top");
    }

    #[test]
    fn test_normalize_plugin_dependencies() {
        let reference = ["app"];
        assert_eq!(
            normalize_dependency(&reference, 0, "dojo/has!touch?./touch:./mouse").unwrap(),
            "dojo/has!touch?app/touch:app/mouse"
        );
        assert_eq!(
            normalize_dependency(&reference, 0, "dojo/text!./tpl.html").unwrap(),
            "dojo/text!app/tpl.html"
        );
        assert_eq!(normalize_dependency(&reference, 0, "./has!a?x:").unwrap(), "app/has!a?x:");
    }
}
