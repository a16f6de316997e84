//! Aggregator configuration
//!
//! Configuration is read from a TOML file and describes where module sources live
//! and how the dependency graph and layer cache behave. All fields have defaults so
//! a minimal file only names the source roots:
//!
//! ```toml
//! name = "app-server"
//! working_dir = "/var/cache/aggr"
//! base_url = "/srv/app/js"
//!
//! [packages]
//! dojo = "/srv/libs/dojo"
//!
//! [paths]
//! "app/nls" = "/srv/app/nls"
//!
//! [options]
//! cache_bust = "2024-06-01"
//! development_mode = true
//! max_layer_cache_capacity_mb = 200
//! ```
//!
//! # Mount names
//!
//! Each source root is mounted under a module id prefix. `base_url` is mounted under
//! the empty name; `packages` and `paths` entries are mounted under their keys. Mount
//! names must not start with `/` and none of their segments may start with `.`.
//!
//! # Fingerprint
//!
//! [`AggregatorConfig::fingerprint`] hashes the parts of the configuration that shape
//! the dependency graph. The persisted graph is only reused when the fingerprint of
//! the configuration it was built from matches the current one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::constants::{
    BYTES_PER_MB, DEFAULT_BUILDER_POOL_SIZE, DEFAULT_DELETE_DELAY_SECS,
    DEFAULT_MAX_LAYER_CACHE_CAPACITY_MB, DEFAULT_PARSER_POOL_SIZE, DEFAULT_READ_LOCK_WAIT,
    DEPS_CACHE_FILE_NAME, DEPS_DIR_NAME, LAYER_CACHE_DIR_NAME, LAYER_CACHE_SNAPSHOT_FILE_NAME,
};
use crate::core::AggrError;

/// Top-level aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Server identity. Names the persisted dependency graph.
    pub name: String,

    /// Directory holding the persisted graph and the layer cache files.
    pub working_dir: PathBuf,

    /// Root mounted under the empty module id prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<PathBuf>,

    /// Package roots, keyed by package name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PathBuf>,

    /// Path mappings, keyed by module id prefix.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<String, PathBuf>,

    /// File extensions recognized as modules (without the leading dot).
    pub module_extensions: Vec<String>,

    /// Runtime options.
    pub options: AggregatorOptions,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            name: "aggregator".to_string(),
            working_dir: std::env::temp_dir().join("aggr"),
            base_url: None,
            packages: BTreeMap::new(),
            paths: BTreeMap::new(),
            module_extensions: vec!["js".to_string()],
            options: AggregatorOptions::default(),
        }
    }
}

/// Runtime options that do not change the shape of the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AggregatorOptions {
    /// Externally supplied invalidation token. A persisted graph written under a
    /// different token is discarded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_bust: Option<String>,

    /// Interactive mode: readers wait at most `read_lock_wait_ms` for a rebuild.
    pub development_mode: bool,

    /// Emit module build errors into layer responses.
    pub debug_mode: bool,

    /// Layer cache budget in megabytes.
    pub max_layer_cache_capacity_mb: u64,

    /// Grace period before superseded cache files are deleted.
    pub delete_delay_secs: u64,

    /// Concurrent tree builders.
    pub builder_pool_size: usize,

    /// Concurrent parse tasks.
    pub parser_pool_size: usize,

    /// Bounded wait for interactive readers, in milliseconds.
    pub read_lock_wait_ms: u64,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            cache_bust: None,
            development_mode: false,
            debug_mode: false,
            max_layer_cache_capacity_mb: DEFAULT_MAX_LAYER_CACHE_CAPACITY_MB,
            delete_delay_secs: DEFAULT_DELETE_DELAY_SECS,
            builder_pool_size: DEFAULT_BUILDER_POOL_SIZE,
            parser_pool_size: DEFAULT_PARSER_POOL_SIZE,
            read_lock_wait_ms: DEFAULT_READ_LOCK_WAIT.as_millis() as u64,
        }
    }
}

impl AggregatorOptions {
    /// Layer cache budget in bytes.
    #[must_use]
    pub const fn max_layer_cache_capacity_bytes(&self) -> u64 {
        self.max_layer_cache_capacity_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Grace period before superseded cache files are deleted.
    #[must_use]
    pub const fn delete_delay(&self) -> Duration {
        Duration::from_secs(self.delete_delay_secs)
    }

    /// Bounded wait for interactive readers, or `None` when readers block.
    #[must_use]
    pub const fn read_lock_wait(&self) -> Option<Duration> {
        if self.development_mode {
            Some(Duration::from_millis(self.read_lock_wait_ms))
        } else {
            None
        }
    }
}

/// One source root mounted under a module id prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRoot {
    /// Module id prefix (empty for the base root).
    pub mount: String,
    /// Directory containing the module sources.
    pub path: PathBuf,
}

impl AggregatorConfig {
    /// Load configuration from a TOML file.
    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(AggrError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Check mount names, pool sizes and extensions.
    pub fn validate(&self) -> Result<(), AggrError> {
        let mut mounts: BTreeMap<String, PathBuf> = BTreeMap::new();
        for root in self.module_roots() {
            validate_mount_name(&root.mount)?;
            if let Some(first) = mounts.get(&root.mount) {
                return Err(AggrError::OverlappingRoots {
                    mount: root.mount,
                    first: first.display().to_string(),
                    second: root.path.display().to_string(),
                });
            }
            mounts.insert(root.mount, root.path);
        }
        if self.options.builder_pool_size == 0 || self.options.parser_pool_size == 0 {
            return Err(AggrError::ConfigError {
                message: "pool sizes must be at least 1".to_string(),
            });
        }
        if self.module_extensions.is_empty() {
            return Err(AggrError::ConfigError {
                message: "at least one module extension is required".to_string(),
            });
        }
        Ok(())
    }

    /// All configured roots, base root first, then packages, then paths.
    #[must_use]
    pub fn module_roots(&self) -> Vec<ModuleRoot> {
        let mut roots = Vec::new();
        if let Some(base) = &self.base_url {
            roots.push(ModuleRoot {
                mount: String::new(),
                path: base.clone(),
            });
        }
        for (mount, path) in self.packages.iter().chain(self.paths.iter()) {
            roots.push(ModuleRoot {
                mount: mount.trim_end_matches('/').to_string(),
                path: path.clone(),
            });
        }
        roots
    }

    /// Hex-encoded SHA-256 over the graph-shaping parts of the configuration.
    pub fn fingerprint(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Shape<'a> {
            roots: Vec<ModuleRoot>,
            extensions: &'a [String],
        }

        let shape = Shape {
            roots: self.module_roots(),
            extensions: &self.module_extensions,
        };
        let serialized = serde_json::to_string(&shape).map_err(AggrError::from)?;

        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Location of the persisted dependency graph.
    #[must_use]
    pub fn deps_cache_path(&self) -> PathBuf {
        self.working_dir.join(DEPS_DIR_NAME).join(DEPS_CACHE_FILE_NAME)
    }

    /// Directory holding layer build files.
    #[must_use]
    pub fn layer_cache_dir(&self) -> PathBuf {
        self.working_dir.join(LAYER_CACHE_DIR_NAME)
    }

    /// Location of the persisted layer cache snapshot.
    #[must_use]
    pub fn layer_cache_snapshot_path(&self) -> PathBuf {
        self.layer_cache_dir().join(LAYER_CACHE_SNAPSHOT_FILE_NAME)
    }
}

/// Reject mount names that could escape the module namespace.
pub fn validate_mount_name(name: &str) -> Result<(), AggrError> {
    if name.starts_with('/') {
        return Err(AggrError::InvalidMountName {
            name: name.to_string(),
            reason: "must not start with '/'".to_string(),
        });
    }
    if !name.is_empty() && name.split('/').any(|segment| segment.starts_with('.')) {
        return Err(AggrError::InvalidMountName {
            name: name.to_string(),
            reason: "path segments must not start with '.'".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_missing_fields() {
        let config = AggregatorConfig::from_toml_str(
            r#"
            name = "test"
            base_url = "/srv/js"
            "#,
        )
        .unwrap();

        assert_eq!(config.name, "test");
        assert_eq!(config.module_extensions, vec!["js".to_string()]);
        assert_eq!(config.options.builder_pool_size, DEFAULT_BUILDER_POOL_SIZE);
        assert_eq!(config.options.max_layer_cache_capacity_bytes(), 500 * BYTES_PER_MB);
        assert_eq!(config.options.read_lock_wait(), None);
    }

    #[test]
    fn test_module_roots_order_and_trailing_slash() {
        let config = AggregatorConfig::from_toml_str(
            r#"
            base_url = "/srv/js"
            [packages]
            dojo = "/srv/dojo"
            [paths]
            "app/nls/" = "/srv/nls"
            "#,
        )
        .unwrap();

        let roots = config.module_roots();
        let mounts: Vec<_> = roots.iter().map(|r| r.mount.as_str()).collect();
        assert_eq!(mounts, vec!["", "dojo", "app/nls"]);
    }

    #[test]
    fn test_invalid_mount_names_rejected() {
        assert!(validate_mount_name("").is_ok());
        assert!(validate_mount_name("dojo/dijit").is_ok());
        assert!(validate_mount_name("/dojo").is_err());
        assert!(validate_mount_name("app/.hidden").is_err());
        assert!(validate_mount_name("../up").is_err());

        let result = AggregatorConfig::from_toml_str(
            r#"
            [paths]
            "./rel" = "/srv/rel"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_mount_rejected() {
        let result = AggregatorConfig::from_toml_str(
            r#"
            [packages]
            dojo = "/srv/dojo"
            [paths]
            "dojo/" = "/srv/other"
            "#,
        );
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AggrError>(),
            Some(AggrError::OverlappingRoots { mount, .. }) if mount == "dojo"
        ));
    }

    #[test]
    fn test_fingerprint_tracks_roots_only() {
        let mut a = AggregatorConfig {
            base_url: Some(PathBuf::from("/srv/js")),
            ..Default::default()
        };
        let b = a.clone();
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        a.options.debug_mode = true;
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

        a.packages.insert("dojo".to_string(), PathBuf::from("/srv/dojo"));
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }

    #[test]
    fn test_development_mode_bounds_reader_wait() {
        let options = AggregatorOptions {
            development_mode: true,
            read_lock_wait_ms: 250,
            ..Default::default()
        };
        assert_eq!(options.read_lock_wait(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_load_from_file() -> Result<()> {
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("aggr.toml");
        fs::write(&path, "name = \"disk\"\n[options]\ncache_bust = \"v2\"\n").await?;

        let config = AggregatorConfig::load_from(&path).await?;
        assert_eq!(config.name, "disk");
        assert_eq!(config.options.cache_bust.as_deref(), Some("v2"));
        Ok(())
    }
}
