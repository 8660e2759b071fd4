//! Content-addressed store client
//!
//! Stateless wrapper over the external object store. The store speaks a
//! minimal HTTP contract: `POST /add` with the raw bytes as the body and a
//! `{"digest": "..."}` response, `GET /cat/<digest>` streaming the bytes
//! back, and `POST /pin/<digest>` as a durability hint.
//!
//! Adds of large audio objects over slow links are expected, so every
//! operation runs under a deliberately generous timeout.

use crate::error::{Error, Result};
use futures::TryStreamExt;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, warn};

/// Canonical prefix distinguishing store-resident resources from URLs.
pub const CAS_PREFIX: &str = "/cas/";

/// Per-operation timeout; store adds can take a long time.
const STORE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Byte reader handed to the mixer; either a store `cat` body or a song's
/// live download pipe.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Returns true when `resource_id` is a canonical content address.
pub fn is_cas_path(resource_id: &str) -> bool {
    resource_id.len() > CAS_PREFIX.len() && resource_id.starts_with(CAS_PREFIX)
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    digest: String,
}

/// Client for the external content-addressed store.
#[derive(Clone)]
pub struct StoreClient {
    base: String,
    client: reqwest::Client,
}

impl StoreClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(STORE_TIMEOUT)
            .build()
            .map_err(|e| Error::Http(format!("failed to build store client: {e}")))?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Add the file at `path` to the store; returns its `/cas/<digest>` path.
    pub async fn add_file(&self, path: &Path) -> Result<String> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::StoreAdd(format!("{}: {e}", path.display())))?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let resp = self
            .client
            .post(format!("{}/add", self.base))
            .body(body)
            .send()
            .await
            .map_err(|e| Error::StoreAdd(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::StoreAdd(e.to_string()))?;

        let added: AddResponse = resp
            .json()
            .await
            .map_err(|e| Error::StoreAdd(format!("malformed add response: {e}")))?;
        debug!(digest = %added.digest, "store add complete");
        Ok(format!("{CAS_PREFIX}{}", added.digest))
    }

    /// Fetch the bytes behind a `/cas/<digest>` path.
    ///
    /// Every fetch also fires a best-effort background pin so the track
    /// stays retrievable for future plays.
    pub async fn cat(&self, cas_path: &str) -> Result<ByteReader> {
        let digest = strip_digest(cas_path)?.to_string();

        let pinner = self.clone();
        let pin_path = cas_path.to_string();
        tokio::spawn(async move {
            if let Err(e) = pinner.pin(&pin_path).await {
                warn!("failed to pin {pin_path}, it may not play later: {e}");
            }
        });

        let resp = self
            .client
            .get(format!("{}/cat/{digest}", self.base))
            .send()
            .await
            .map_err(|e| Error::StoreRead(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::StoreRead(e.to_string()))?;

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(stream)))
    }

    /// Ask the store to keep a digest around. Best effort; callers log and
    /// carry on when this fails.
    pub async fn pin(&self, cas_path: &str) -> Result<()> {
        let digest = strip_digest(cas_path)?;
        self.client
            .post(format!("{}/pin/{digest}", self.base))
            .send()
            .await
            .map_err(|e| Error::StoreRead(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::StoreRead(e.to_string()))?;
        Ok(())
    }
}

fn strip_digest(cas_path: &str) -> Result<&str> {
    cas_path
        .strip_prefix(CAS_PREFIX)
        .filter(|digest| !digest.is_empty())
        .ok_or_else(|| Error::InvalidResource(cas_path.to_string()))
}
