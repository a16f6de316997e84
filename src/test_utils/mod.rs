//! Test utilities for the aggregator core
//!
//! Helpers shared by unit tests and the integration suite: logging setup, source
//! tree fixtures, and stub collaborators for the layer builder.
//!
//! # Example
//!
//! ```rust,no_run
//! use aggr_core::test_utils::{SourceTree, init_test_logging};
//!
//! init_test_logging(None);
//! let tree = SourceTree::new().unwrap();
//! tree.write_module("app/main", r#"define(["./util"], function () {});"#).unwrap();
//! ```

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::layer::{ContributionType, ModuleBuild, ModuleBuildService, Transport};

/// Global flag to ensure logging is only initialized once in tests
static INIT_LOGGING: Once = Once::new();

/// Initialize logging for tests.
///
/// Only the first call has an effect. Uses `level` if given, otherwise
/// `RUST_LOG`; with neither, logging stays off.
///
/// ```bash
/// RUST_LOG=layer_cache=debug cargo test
/// ```
pub fn init_test_logging(level: Option<Level>) {
    INIT_LOGGING.call_once(|| {
        let filter = if let Some(level) = level {
            EnvFilter::new(level.to_string())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(false)
            .try_init();
    });
}

/// Set the modification time of `path` to `millis` after the epoch.
pub fn set_mtime(path: &Path, millis: u64) {
    let file = fs::File::options()
        .write(true)
        .open(path)
        .expect("open file to set mtime");
    file.set_modified(UNIX_EPOCH + Duration::from_millis(millis))
        .expect("set mtime");
}

/// Temporary module source directory.
pub struct SourceTree {
    temp: TempDir,
}

impl SourceTree {
    /// Empty tree in a fresh temporary directory.
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: TempDir::new()?,
        })
    }

    /// Root directory of the sources.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Write `source` as module `id` (`<root>/<id>.js`). Returns the file path.
    pub fn write_module(&self, id: &str, source: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(format!("{id}.js"));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, source)?;
        Ok(path)
    }

    /// Write module `id` declaring `deps`, with its mtime set to `millis`.
    pub fn write_define(&self, id: &str, deps: &[&str], millis: u64) -> Result<PathBuf> {
        let list = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let path = self.write_module(id, &format!("define([{list}], function () {{}});"))?;
        set_mtime(&path, millis);
        Ok(path)
    }
}

/// Transport that frames with visible tags such as `<BeforeFirstModule:a>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggingTransport;

impl Transport for TaggingTransport {
    fn contribution(&self, kind: ContributionType, module: Option<&str>, _required: &BTreeSet<String>) -> Option<String> {
        Some(match module {
            Some(module) => format!("<{kind:?}:{module}>"),
            None => format!("<{kind:?}>"),
        })
    }

    fn cache_key(&self) -> String {
        "tagging".to_string()
    }
}

/// Module builds answering `[id]` with cache key `key:id`, with configurable
/// before/after modules, error modules, and failures.
#[derive(Debug, Default)]
pub struct FakeModuleBuilds {
    before: HashMap<String, Vec<String>>,
    after: HashMap<String, Vec<String>>,
    errors: HashMap<String, String>,
    failures: HashSet<String>,
    delay: Option<Duration>,
    module_delays: HashMap<String, Duration>,
    builds: AtomicUsize,
    completed: Arc<AtomicUsize>,
}

impl FakeModuleBuilds {
    /// Builds with no special behavior.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `modules` before `id`.
    #[must_use]
    pub fn with_before(mut self, id: &str, modules: &[&str]) -> Self {
        self.before
            .insert(id.to_string(), modules.iter().map(ToString::to_string).collect());
        self
    }

    /// Emit `modules` after `id`.
    #[must_use]
    pub fn with_after(mut self, id: &str, modules: &[&str]) -> Self {
        self.after
            .insert(id.to_string(), modules.iter().map(ToString::to_string).collect());
        self
    }

    /// Build `id` as an error module reporting `message`.
    #[must_use]
    pub fn with_error(mut self, id: &str, message: &str) -> Self {
        self.errors.insert(id.to_string(), message.to_string());
        self
    }

    /// Fail the build of `id`.
    #[must_use]
    pub fn with_failure(mut self, id: &str) -> Self {
        self.failures.insert(id.to_string());
        self
    }

    /// Sleep for `delay` in every build.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep for `delay` in the build of `id`, instead of any global delay.
    #[must_use]
    pub fn with_module_delay(mut self, id: &str, delay: Duration) -> Self {
        self.module_delays.insert(id.to_string(), delay);
        self
    }

    /// Number of builds started.
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Number of builds that ran to a successful end.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl ModuleBuildService for FakeModuleBuilds {
    fn build(&self, module_id: &str) -> BoxFuture<'static, Result<ModuleBuild>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let id = module_id.to_string();
        let fail = self.failures.contains(&id);
        let delay = self.module_delays.get(&id).copied().or(self.delay);
        let completed = Arc::clone(&self.completed);
        let build = ModuleBuild {
            output: format!("[{id}]"),
            cache_key: Some(format!("key:{id}")),
            before: self.before.get(&id).cloned().unwrap_or_default(),
            after: self.after.get(&id).cloned().unwrap_or_default(),
            error: self.errors.get(&id).cloned(),
        };
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if fail {
                anyhow::bail!("build of {id} failed");
            }
            completed.fetch_add(1, Ordering::SeqCst);
            Ok(build)
        }
        .boxed()
    }
}
