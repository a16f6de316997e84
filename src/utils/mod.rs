//! Utility functions shared across the crate
//!
//! - [`fs`] - atomic file writes and JSON file helpers

pub mod fs;

pub use fs::{atomic_write, ensure_dir, read_json_file, write_json_file};
