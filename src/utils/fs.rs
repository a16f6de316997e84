//! File system helpers shared by the graph persistence and the layer cache
//!
//! Writes go through a temporary sibling file followed by a rename, so a reader
//! never observes a half-written graph or snapshot file.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::fs;

/// Ensures a directory exists, creating it and all parent directories if necessary.
pub async fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create directory: {}", path.display()))
}

/// Write `content` to `path` atomically.
///
/// The content is written to `<path>.tmp` first and then renamed over `path`.
/// Parent directories are created as needed.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)
        .await
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).await.with_context(|| {
        format!("Failed to rename {} to {}", temp_path.display(), path.display())
    })
}

/// Read and deserialize a JSON file, returning `None` if it does not exist.
pub async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse JSON from {}", path.display()))?;
    Ok(Some(value))
}

/// Serialize `data` as JSON and write it atomically.
pub async fn write_json_file<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_json::to_vec(data)
        .with_context(|| format!("Failed to serialize JSON for {}", path.display()))?;
    atomic_write(path, &content).await
}
