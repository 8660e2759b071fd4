//! Error types for onda
//!
//! One variant per failure class on the data plane, using thiserror for
//! clear propagation. Nothing here is expected to panic; fatal startup
//! conditions (missing transcoder, unreadable persistence files, unbindable
//! ports) surface through `main`.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The URL does not match any known audio source
    #[error("unsupported source: {0}")]
    UnsupportedSource(String),

    /// The resource identifier is neither a URL nor a content address
    #[error("invalid resource identifier: {0}")]
    InvalidResource(String),

    /// Network or provider failure while fetching a remote resource
    #[error("download failed: {0}")]
    Download(String),

    /// The content-addressed store rejected or dropped an add
    #[error("store add failed: {0}")]
    StoreAdd(String),

    /// A digest could not be read back from the store
    #[error("store read failed: {0}")]
    StoreRead(String),

    /// The song's download delivered an error instead of a digest
    #[error("resolve failed: {0}")]
    ResolveFailed(String),

    /// The external transcoder binary is not on PATH
    #[error("transcoder not found on PATH: {0}")]
    ChildMissing(String),

    /// The transcoder child failed to start or exited abnormally
    #[error("transcoder error: {0}")]
    Transcode(String),

    /// Synthetic outcome of an explicit skip; swallowed by the mixer
    #[error("current track skipped")]
    Skipped,

    /// A persistence file could not be written or parsed
    #[error("persistence error: {path}: {message}")]
    Persist { path: PathBuf, message: String },

    /// HTTP server setup failure
    #[error("HTTP server error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
