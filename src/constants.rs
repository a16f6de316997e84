//! Global constants used throughout the aggregator core.
//!
//! This module contains pool sizes, capacities, timeouts and file names
//! that are shared by the dependency graph service and the layer cache.
//! Most of them are only defaults; the effective values come from
//! [`AggregatorOptions`](crate::config::AggregatorOptions).

use std::time::Duration;

/// Default number of concurrent tree builders (one task per configured root).
///
/// Builders block on their own parse tasks, so this bound is kept separate
/// from [`DEFAULT_PARSER_POOL_SIZE`].
pub const DEFAULT_BUILDER_POOL_SIZE: usize = 10;

/// Default number of concurrent module parse tasks across all builders.
pub const DEFAULT_PARSER_POOL_SIZE: usize = 20;

/// Default layer cache budget in megabytes.
pub const DEFAULT_MAX_LAYER_CACHE_CAPACITY_MB: u64 = 500;

/// Default grace period before a superseded cache file is deleted (3 minutes).
pub const DEFAULT_DELETE_DELAY_SECS: u64 = 3 * 60;

/// How long an interactive reader waits for a dependency rebuild before
/// failing with a retryable error.
pub const DEFAULT_READ_LOCK_WAIT: Duration = Duration::from_millis(1000);

/// Largest number of distinct variables a formula may reference when it is
/// minimized. Minterms are encoded as `u32` bit vectors.
pub const MAX_FORMULA_VARIABLES: usize = 31;

/// Subdirectory of the working directory holding the persisted graph.
pub const DEPS_DIR_NAME: &str = "deps";

/// File name of the persisted dependency graph inside [`DEPS_DIR_NAME`].
pub const DEPS_CACHE_FILE_NAME: &str = "depmap.cache";

/// Subdirectory of the working directory holding layer build files.
pub const LAYER_CACHE_DIR_NAME: &str = "layercache";

/// File name of the persisted layer cache directory snapshot.
pub const LAYER_CACHE_SNAPSHOT_FILE_NAME: &str = "layercache.json";

/// Version of the persisted dependency graph format.
///
/// Bump whenever [`GraphSnapshot`](crate::deps::GraphSnapshot) changes shape.
pub const GRAPH_FORMAT_VERSION: u32 = 2;

/// Module ids that name loader-provided values rather than resources.
pub const RESERVED_MODULE_IDS: [&str; 3] = ["require", "exports", "module"];

/// Bytes in a megabyte, for converting configured capacities.
pub const BYTES_PER_MB: u64 = 1024 * 1024;
