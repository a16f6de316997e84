//! Integration test suite for the aggregator core
//!
//! End-to-end tests that drive the public API against real temporary source
//! trees and cache directories.
//!
//! # Running Integration Tests
//!
//! ```bash
//! cargo test --test integration
//! ```
//!
//! # Test Organization
//!
//! - **deps_refresh**: graph build, revalidation after edits, persisted graph reuse
//! - **layer_cache**: eviction-driven layer removal, clear racing persistence
//! - **layer_flow**: request to module list to cached layer, snapshot restore

mod common;
mod deps_refresh;
mod layer_cache;
mod layer_flow;
