//! Persistence helpers
//!
//! Every durable file (queue, cache, chain) is small and rewritten whole on
//! each mutation, so the only hygiene that matters is avoiding partial
//! writes: serialize to a sibling temp file, then rename over the target.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

fn persist_err(path: &Path, message: impl ToString) -> Error {
    Error::Persist {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

/// Write `bytes` to `path` atomically (temp file + rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| persist_err(path, "path has no file name"))?
        .to_string_lossy();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| persist_err(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persist_err(path, e))
}

/// Serialize `value` as pretty JSON and write it atomically.
pub async fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| persist_err(path, e))?;
    write_atomic(path, &bytes).await
}

/// Load a JSON file, returning `Ok(None)` when the file does not exist yet.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persist_err(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| persist_err(path, e))
}

/// Serialize `value` with bincode and write it atomically.
pub async fn save_bin<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| persist_err(path, e))?;
    write_atomic(path, &bytes).await
}

/// Load a bincode file, returning `Ok(None)` when the file does not exist yet.
pub async fn load_bin<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(persist_err(path, e)),
    };
    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|e| persist_err(path, e))
}
