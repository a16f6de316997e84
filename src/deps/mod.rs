//! Dependency graph service
//!
//! Maintains the dependency graph of the AMD modules under the configured source
//! roots.
//!
//! # Modules
//!
//! - [`node`] - arena-backed [`DependencyTree`] mirroring a source directory
//! - [`parser`] - extraction of `define`/`require` dependency arrays from source text
//! - [`builder`] - incremental, concurrent tree builds for one root
//! - [`paths`] - root path and module id utilities
//! - [`graph`] - the merged, queryable [`CompositeGraph`]
//! - [`snapshot`] - persisted form of the raw trees
//! - [`service`] - the [`DependencyGraphService`] tying it all together
//!
//! # Example
//!
//! ```rust,no_run
//! use aggr_core::config::AggregatorConfig;
//! use aggr_core::deps::{DependencyGraphService, RefreshRequest};
//! use aggr_core::formula::Features;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AggregatorConfig::load_from("aggr.toml".as_ref()).await?;
//! let service = DependencyGraphService::new(config)?;
//! service.refresh(RefreshRequest::default()).await?;
//!
//! let features = Features::new().with("touch", false);
//! for (id, condition) in service.expanded_dependencies("app/main", &features).await?.iter() {
//!     println!("{id} if {condition}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod graph;
pub mod node;
pub mod parser;
pub mod paths;
pub mod service;
pub mod snapshot;

pub use builder::{BuildResult, DependencyTreeBuilder};
pub use graph::{CompositeGraph, ExpandedDependencies, MountPoint};
pub use node::{DeclaredDeps, DependencyNode, DependencyTree, NodeId};
pub use parser::{AmdDependencyParser, SourceParser};
pub use service::{DependencyGraphService, DependencyListener, RefreshOutcome, RefreshRequest};
pub use snapshot::GraphSnapshot;
