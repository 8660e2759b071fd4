//! Track resources
//!
//! [`Song`] is the handle bridging "URL submitted" and "playable bytes
//! available". A song starts pending (a URL plus a not-yet-fired outcome)
//! and becomes resolved (a `/cas/` digest) when its download finishes. Both
//! the cache and the queue hold the same `Arc<Song>`; after resolution the
//! handle is effectively immutable.
//!
//! The outcome is a broadcast-once primitive: the downloader fires it
//! exactly once, and every waiter observes the same digest or error.

pub mod cache;
pub mod download;

use crate::error::{Error, Result};
use crate::store::{self, ByteReader, StoreClient};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tracing::warn;
use url::Url;

/// Gateway synthesized into a song's URL field when only a digest is known.
const STORE_GATEWAY: &str = "https://cas.onda.stream";

/// Capacity of the in-memory pipe carrying an urgent song's bytes.
const LIVE_PIPE_CAPACITY: usize = 10 * 1024 * 1024;

/// Pause before retrying a store read that failed once.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Outcome of a song's download: a `/cas/` path, or an error description.
pub type Outcome = std::result::Result<String, String>;

#[derive(Debug, Default, Clone)]
struct Meta {
    title: String,
    duration: Duration,
}

/// A track handle, possibly still resolving.
///
/// Invariant: at least one of `{digest, url}` is set at construction.
pub struct Song {
    url: Option<Url>,
    cas_path: OnceLock<String>,
    meta: RwLock<Meta>,
    outcome_tx: watch::Sender<Option<Outcome>>,
    outcome_rx: watch::Receiver<Option<Outcome>>,
    pipe_reader: Mutex<Option<DuplexStream>>,
    pipe_writer: Mutex<Option<DuplexStream>>,
}

/// Wire form of a song, shared by the HTTP API and the persisted files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongRecord {
    #[serde(rename = "ipfsPath", default)]
    pub cas_path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Track length in nanoseconds.
    #[serde(default)]
    pub duration: u64,
}

impl Song {
    /// Construct from a raw resource identifier: either a `/cas/` content
    /// address or a parseable URL.
    pub fn new(resource_id: &str, urgent: bool) -> Result<Arc<Self>> {
        if store::is_cas_path(resource_id) {
            Ok(Self::from_digest(resource_id))
        } else {
            let url = Url::parse(resource_id)
                .map_err(|e| Error::InvalidResource(format!("{resource_id}: {e}")))?;
            Ok(Self::from_url(url, urgent))
        }
    }

    /// A pending song awaiting download. When `urgent`, a bounded in-memory
    /// pipe is attached so playback can begin before the store add finishes.
    pub fn from_url(url: Url, urgent: bool) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (pipe_reader, pipe_writer) = if urgent {
            let (reader, writer) = tokio::io::duplex(LIVE_PIPE_CAPACITY);
            (Some(reader), Some(writer))
        } else {
            (None, None)
        };
        Arc::new(Self {
            url: Some(url),
            cas_path: OnceLock::new(),
            meta: RwLock::new(Meta::default()),
            outcome_tx,
            outcome_rx,
            pipe_reader: Mutex::new(pipe_reader),
            pipe_writer: Mutex::new(pipe_writer),
        })
    }

    /// A song bound directly to a content address; already resolved.
    pub fn from_digest(cas_path: &str) -> Arc<Self> {
        let (outcome_tx, outcome_rx) = watch::channel(Some(Ok(cas_path.to_string())));
        let resolved = OnceLock::new();
        let _ = resolved.set(cas_path.to_string());
        Arc::new(Self {
            url: None,
            cas_path: resolved,
            meta: RwLock::new(Meta::default()),
            outcome_tx,
            outcome_rx,
            pipe_reader: Mutex::new(None),
            pipe_writer: Mutex::new(None),
        })
    }

    /// Rebuild a song from its persisted record.
    ///
    /// Records without a digest were persisted mid-download; their download
    /// is gone, so they resolve to an error and get evicted on the next
    /// queue render.
    pub fn from_record(record: SongRecord) -> Arc<Self> {
        let cas_path = OnceLock::new();
        let outcome = if record.cas_path.is_empty() {
            Some(Err("cached without a content digest".to_string()))
        } else {
            let _ = cas_path.set(record.cas_path.clone());
            Some(Ok(record.cas_path))
        };
        let (outcome_tx, outcome_rx) = watch::channel(outcome);
        Arc::new(Self {
            url: Url::parse(&record.url).ok(),
            cas_path,
            meta: RwLock::new(Meta {
                title: record.title,
                duration: Duration::from_nanos(record.duration),
            }),
            outcome_tx,
            outcome_rx,
            pipe_reader: Mutex::new(None),
            pipe_writer: Mutex::new(None),
        })
    }

    /// The best identifier currently known: the digest once resolved, the
    /// source URL before that.
    pub fn resource_id(&self) -> String {
        if let Some(cas) = self.cas_path() {
            return cas;
        }
        self.url
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_default()
    }

    /// The content address, opportunistically upgrading from an outcome
    /// that has already arrived.
    pub fn cas_path(&self) -> Option<String> {
        if let Some(cas) = self.cas_path.get() {
            return Some(cas.clone());
        }
        if let Some(Ok(cas)) = self.outcome_rx.borrow().clone() {
            let _ = self.cas_path.set(cas.clone());
            return Some(cas);
        }
        None
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    pub fn title(&self) -> String {
        self.meta.read().unwrap().title.clone()
    }

    pub fn set_title(&self, title: impl Into<String>) {
        self.meta.write().unwrap().title = title.into();
    }

    pub fn duration(&self) -> Duration {
        self.meta.read().unwrap().duration
    }

    pub fn set_duration(&self, duration: Duration) {
        self.meta.write().unwrap().duration = duration;
    }

    /// Deliver the download outcome. Single-writer, single-firing; a second
    /// delivery is a bug upstream and is ignored.
    pub fn deliver(&self, outcome: Outcome) {
        if self.outcome_rx.borrow().is_some() {
            warn!("song outcome delivered twice, ignoring: {}", self.resource_id());
            return;
        }
        if let Ok(cas) = &outcome {
            let _ = self.cas_path.set(cas.clone());
        }
        self.outcome_tx.send_replace(Some(outcome));
    }

    /// Take the write end of the live pipe, if this song was constructed
    /// urgent. The downloader tees its output here.
    pub fn take_pipe_writer(&self) -> Option<DuplexStream> {
        self.pipe_writer.lock().unwrap().take()
    }

    fn take_pipe_reader(&self) -> Option<DuplexStream> {
        self.pipe_reader.lock().unwrap().take()
    }

    /// Block until resolution completes, then return a reader of the
    /// canonical MP3.
    ///
    /// An urgent song yields its live pipe so playback starts before the
    /// store add finishes. Otherwise the digest is read back from the
    /// store, with one retry after a short delay; the store sometimes stops
    /// responding under load.
    pub async fn resolve(&self, store: &StoreClient) -> Result<ByteReader> {
        if let Some(pipe) = self.take_pipe_reader() {
            return Ok(Box::new(pipe));
        }

        let cas = match self.outcome().await {
            Ok(cas) => cas,
            Err(e) => return Err(Error::ResolveFailed(e)),
        };

        match store.cat(&cas).await {
            Ok(reader) => Ok(reader),
            Err(e) => {
                warn!("store read for {cas} failed, retrying shortly: {e}");
                tokio::time::sleep(STORE_RETRY_DELAY).await;
                store.cat(&cas).await
            }
        }
    }

    /// Wait for the download outcome; every waiter observes the same value.
    pub async fn outcome(&self) -> Outcome {
        let mut rx = self.outcome_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err("download abandoned".to_string());
            }
        }
    }

    /// Non-blocking peek for a failed download; used by the queue-display
    /// path to evict songs that will never resolve.
    pub fn check_failure(&self) -> Option<String> {
        match self.outcome_rx.borrow().as_ref() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Wire/persisted form, with the documented defaults synthesized: a
    /// gateway URL when only the digest is known, and a placeholder title.
    pub fn to_record(&self) -> SongRecord {
        let cas_path = self.cas_path().unwrap_or_default();
        let meta = self.meta.read().unwrap().clone();

        let mut url = self
            .url
            .as_ref()
            .map(Url::to_string)
            .unwrap_or_default();
        if url.is_empty() {
            url = format!("{STORE_GATEWAY}{cas_path}");
        }

        let mut title = meta.title;
        if title.is_empty() {
            title = "Unknown Track".to_string();
        }

        SongRecord {
            cas_path,
            url,
            title,
            duration: meta.duration.as_nanos() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn record_round_trip_preserves_url_and_digest() {
        let song = Song::new("https://youtu.be/abc123", false).unwrap();
        song.set_title("A Track");
        song.set_duration(Duration::from_secs(180));
        song.deliver(Ok("/cas/Qmabc".to_string()));

        let json = serde_json::to_string(&song.to_record()).unwrap();
        let record: SongRecord = serde_json::from_str(&json).unwrap();
        let reloaded = Song::from_record(record);

        assert_eq!(reloaded.cas_path().as_deref(), Some("/cas/Qmabc"));
        assert_eq!(
            reloaded.url().map(Url::to_string).unwrap(),
            "https://youtu.be/abc123"
        );
        assert_eq!(reloaded.title(), "A Track");
        assert_eq!(reloaded.duration(), Duration::from_secs(180));
    }

    #[test]
    fn record_defaults_are_synthesized() {
        let song = Song::from_digest("/cas/Qmabc");
        let record = song.to_record();
        assert_eq!(record.url, "https://cas.onda.stream/cas/Qmabc");
        assert_eq!(record.title, "Unknown Track");
    }

    #[test]
    fn resource_id_upgrades_after_outcome() {
        let song = Song::new("https://youtu.be/abc123", false).unwrap();
        assert_eq!(song.resource_id(), "https://youtu.be/abc123");

        song.deliver(Ok("/cas/Qmxyz".to_string()));
        assert_eq!(song.resource_id(), "/cas/Qmxyz");
    }

    #[test]
    fn check_failure_peeks_without_blocking() {
        let song = Song::new("https://youtu.be/abc123", false).unwrap();
        assert!(song.check_failure().is_none());

        song.deliver(Err("provider said no".to_string()));
        assert_eq!(song.check_failure().as_deref(), Some("provider said no"));
    }

    #[test]
    fn second_delivery_is_ignored() {
        let song = Song::new("https://youtu.be/abc123", false).unwrap();
        song.deliver(Ok("/cas/first".to_string()));
        song.deliver(Ok("/cas/second".to_string()));
        assert_eq!(song.cas_path().as_deref(), Some("/cas/first"));
    }

    #[tokio::test]
    async fn urgent_song_resolves_to_live_pipe() {
        let store = StoreClient::new("http://127.0.0.1:1").unwrap();
        let song = Song::new("https://youtu.be/abc123", true).unwrap();

        let mut writer = song.take_pipe_writer().expect("urgent song has a pipe");
        writer.write_all(b"mp3 bytes").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut reader = song.resolve(&store).await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"mp3 bytes");
    }

    #[tokio::test]
    async fn failed_download_resolves_to_error() {
        let store = StoreClient::new("http://127.0.0.1:1").unwrap();
        let song = Song::new("https://youtu.be/abc123", false).unwrap();
        song.deliver(Err("network gave out".to_string()));

        match song.resolve(&store).await {
            Err(Error::ResolveFailed(msg)) => assert!(msg.contains("network gave out")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("resolve unexpectedly succeeded"),
        }
    }

    #[test]
    fn record_without_digest_resolves_to_error() {
        let record = SongRecord {
            cas_path: String::new(),
            url: "https://youtu.be/abc123".to_string(),
            title: "Pending".to_string(),
            duration: 0,
        };
        let song = Song::from_record(record);
        assert!(song.check_failure().is_some());
    }
}
