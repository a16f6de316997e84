//! Aggregator core - dependency graph and layer build cache for an AMD module server
//!
//! The crate holds the two pieces of a JavaScript module aggregation server that
//! decide what goes into a response and whether it has to be built again:
//!
//! - the **dependency graph service** walks the configured source roots, parses
//!   the `define`/`require` dependency lists of every module, persists the raw
//!   per-root trees, and answers expanded dependency queries against one merged
//!   graph, honouring `has!` feature conditions;
//! - the **layer build cache** turns a resolved module list into response bytes,
//!   builds each (layer, build key) at most once concurrently, keeps builds under a
//!   shared byte budget with LRU eviction, and persists them asynchronously.
//!
//! # Request flow
//!
//! ```text
//! request ─▶ DependencyGraphService::expanded_dependencies ─▶ ModuleList
//!         ─▶ Layer::get_or_build ─▶ LayerBuilder (module builds + transport framing)
//!         ─▶ CacheEntry::persist ─▶ later requests read the cached bytes
//! ```
//!
//! # Modules
//!
//! - [`config`] - `AggregatorConfig` loaded from TOML, configuration fingerprint
//! - [`core`] - error taxonomy
//! - [`formula`] - boolean feature formulas, the sum-of-products minimizer, `has!` expressions
//! - [`resource`] - resource provider abstraction over the filesystem
//! - [`deps`] - dependency trees, the AMD dependency parser, the graph service
//! - [`cache`] - cache entries, the weighted LRU, the layer directory
//! - [`layer`] - single-flight layer builds and response assembly
//! - [`utils`] - filesystem helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use aggr_core::config::AggregatorConfig;
//! use aggr_core::deps::{DependencyGraphService, RefreshRequest};
//! use aggr_core::formula::Features;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AggregatorConfig::load_from(std::path::Path::new("aggregator.toml")).await?;
//! let service = DependencyGraphService::new(config)?;
//! service.refresh(RefreshRequest::default()).await?;
//!
//! let deps = service
//!     .expanded_dependencies("app/main", &Features::new().with("ie", false))
//!     .await?;
//! for id in deps.ids() {
//!     println!("{id}");
//! }
//! # Ok(())
//! # }
//! ```

// Core functionality modules
pub mod cache;
pub mod config;
pub mod constants;
pub mod core;
pub mod deps;
pub mod layer;

// Supporting modules
pub mod formula;
pub mod resource;
pub mod utils;

// test_utils module is available for both unit tests and integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
