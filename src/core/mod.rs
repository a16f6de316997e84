//! Core types shared by every subsystem of the aggregator
//!
//! The core module holds the error taxonomy used by the dependency graph service
//! and the layer build cache:
//! - [`AggrError`] - Enumerated error types covering all core failure modes
//! - [`ErrorContext`] - Error wrapper with a suggestion and details
//! - [`user_friendly_error`] - Attach a suggestion matching the error variant

pub mod error;

pub use error::{AggrError, ErrorContext, user_friendly_error};
