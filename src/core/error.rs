//! Error handling for the aggregator core
//!
//! This module provides the strongly-typed error enum used across the crate and a
//! small context wrapper used when errors are surfaced to the administrative layer.
//!
//! # Architecture
//!
//! - [`AggrError`] - Enumerated error types for all failure cases in the core
//! - [`ErrorContext`] - Wrapper that adds a suggestion and details to an [`AggrError`]
//!
//! Pure modules (formula minimization, module id normalization) return
//! `Result<T, AggrError>` directly. Services that touch the filesystem return
//! [`anyhow::Result`] and attach context at IO boundaries; the typed error can be
//! recovered with [`anyhow::Error::downcast_ref`].
//!
//! # Error Categories
//!
//! - **Formulas**: [`AggrError::TooManyVariables`], [`AggrError::InvalidFormula`]
//! - **Module ids and roots**: [`AggrError::InvalidModuleId`], [`AggrError::InvalidMountName`],
//!   [`AggrError::OverlappingRoots`]
//! - **Dependency graph**: [`AggrError::ParseError`], [`AggrError::ProcessingDependencies`],
//!   [`AggrError::DependenciesUnavailable`]
//! - **Layer cache**: [`AggrError::CorruptCacheRecord`], [`AggrError::ModuleBuildFailed`],
//!   [`AggrError::LayerOrder`], [`AggrError::CircularModuleExpansion`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use aggr_core::core::{AggrError, ErrorContext};
//!
//! let context = ErrorContext::new(AggrError::ProcessingDependencies)
//!     .with_suggestion("Retry the request once the dependency rebuild finishes");
//! assert!(context.error.is_retryable());
//! println!("{context}");
//! ```

use std::fmt;
use thiserror::Error;

/// The main error type for aggregator core operations
///
/// Each variant describes one specific failure mode and carries the values needed
/// to explain it (module ids, paths, variable counts).
#[derive(Error, Debug)]
pub enum AggrError {
    /// A formula references more variables than fit in the implicant encoding
    ///
    /// # Fields
    /// - `count`: Number of distinct variables in the formula
    /// - `max`: Largest supported number of variables
    #[error("Formula references {count} variables, at most {max} are supported")]
    TooManyVariables {
        /// Number of distinct variables in the formula
        count: usize,
        /// Largest supported number of variables
        max: usize,
    },

    /// Formula text could not be parsed
    #[error("Invalid formula '{text}': {reason}")]
    InvalidFormula {
        /// The text that failed to parse
        text: String,
        /// Why parsing failed
        reason: String,
    },

    /// A module id could not be normalized or contains disallowed characters
    ///
    /// Raised for relative ids that climb above their mount point and for ids that
    /// contain characters such as `{`, `}`, `,` or `*`.
    #[error("Invalid module id '{id}': {reason}")]
    InvalidModuleId {
        /// The offending module id
        id: String,
        /// Why the id was rejected
        reason: String,
    },

    /// A configured mount name is not usable as a module id prefix
    #[error("Invalid mount name '{name}': {reason}")]
    InvalidMountName {
        /// The configured mount name
        name: String,
        /// Why the name was rejected
        reason: String,
    },

    /// Two configured roots are mounted under the same module id prefix
    #[error("Configured roots '{first}' and '{second}' are both mounted as '{mount}'")]
    OverlappingRoots {
        /// The shared mount name
        mount: String,
        /// First configured root path
        first: String,
        /// Second configured root path
        second: String,
    },

    /// Module source could not be tokenized
    #[error("Failed to parse {uri}: {reason}")]
    ParseError {
        /// Resource that failed to parse
        uri: String,
        /// Description of the failure
        reason: String,
    },

    /// The dependency graph is being rebuilt and the caller chose not to wait
    ///
    /// This is the fail-fast signal returned to interactive readers. It is
    /// retryable: the same query succeeds once the rebuild completes.
    #[error("Dependencies are being processed, retry the request")]
    ProcessingDependencies,

    /// No dependency graph is available because initialization failed
    #[error("Dependency graph is unavailable: {reason}")]
    DependenciesUnavailable {
        /// Description of the failed initialization
        reason: String,
    },

    /// A module id was queried that the graph does not contain
    #[error("Module not found in dependency graph: {id}")]
    ModuleNotFound {
        /// The module id that was queried
        id: String,
    },

    /// A persisted layer record is truncated or malformed
    #[error("Corrupt cache record {filename}: {reason}")]
    CorruptCacheRecord {
        /// Cache file name
        filename: String,
        /// Description of the corruption
        reason: String,
    },

    /// A module build future failed without producing output
    #[error("Failed to build module {module}: {reason}")]
    ModuleBuildFailed {
        /// Module id
        module: String,
        /// Failure description
        reason: String,
    },

    /// Module list ordering is invalid
    ///
    /// Modules that were explicitly requested must precede modules that were
    /// added by dependency expansion.
    #[error("Module '{module}' is out of order: {reason}")]
    LayerOrder {
        /// Module id that broke the ordering
        module: String,
        /// Description of the violated ordering
        reason: String,
    },

    /// Before/after sub-module expansion revisits a module already on the stack
    ///
    /// # Fields
    /// - `chain`: The expansion chain that forms the cycle
    #[error("Circular before/after module expansion: {chain}")]
    CircularModuleExpansion {
        /// The expansion chain that forms the cycle (e.g., "a -> b -> a")
        chain: String,
    },

    /// Configuration is invalid
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Description of the problem
        message: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AggrError {
    /// Returns `true` when the same operation is expected to succeed if retried later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ProcessingDependencies)
    }

    /// Returns `true` when `error` wraps a retryable [`AggrError`].
    #[must_use]
    pub fn is_retryable_error(error: &anyhow::Error) -> bool {
        error.downcast_ref::<Self>().is_some_and(Self::is_retryable)
    }
}

/// Error wrapper with an optional suggestion and additional details
///
/// Used by callers that surface core errors to administrators. Display output
/// places the details and suggestion on their own lines.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: AggrError,
    /// Optional suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: AggrError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add a suggestion for resolving the error.
    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add details explaining the error.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Build an [`ErrorContext`] with a suggestion matching the error variant.
#[must_use]
pub fn user_friendly_error(error: AggrError) -> ErrorContext {
    match error {
        AggrError::ProcessingDependencies => ErrorContext::new(error)
            .with_suggestion("Retry the request once the dependency rebuild finishes"),
        AggrError::DependenciesUnavailable { .. } => ErrorContext::new(error)
            .with_suggestion("Fix the reported problem and reload the dependency graph"),
        AggrError::OverlappingRoots { .. } => ErrorContext::new(error)
            .with_suggestion("Remove one of the roots or mount it under a different name"),
        AggrError::CorruptCacheRecord { .. } => ErrorContext::new(error)
            .with_suggestion("Clear the layer cache to discard damaged files"),
        AggrError::CircularModuleExpansion { .. } => ErrorContext::new(error)
            .with_details("A module lists itself as one of its own before/after modules"),
        _ => ErrorContext::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_only_for_processing() {
        assert!(AggrError::ProcessingDependencies.is_retryable());
        assert!(
            !AggrError::DependenciesUnavailable {
                reason: "boom".to_string()
            }
            .is_retryable()
        );

        let wrapped = anyhow::Error::from(AggrError::ProcessingDependencies);
        assert!(AggrError::is_retryable_error(&wrapped));
        assert!(!AggrError::is_retryable_error(&anyhow::anyhow!("other")));
    }

    #[test]
    fn test_error_context_display() {
        let context = ErrorContext::new(AggrError::ModuleNotFound {
            id: "app/main".to_string(),
        })
        .with_details("queried by layer 7")
        .with_suggestion("check the configured paths");

        let text = context.to_string();
        assert!(text.starts_with("Module not found in dependency graph: app/main"));
        assert!(text.contains("\nDetails: queried by layer 7"));
        assert!(text.ends_with("\nSuggestion: check the configured paths"));
    }

    #[test]
    fn test_user_friendly_error_adds_suggestion() {
        let context = user_friendly_error(AggrError::ProcessingDependencies);
        assert!(context.suggestion.is_some());

        let context = user_friendly_error(AggrError::ConfigError {
            message: "bad".to_string(),
        });
        assert!(context.suggestion.is_none());
    }
}
