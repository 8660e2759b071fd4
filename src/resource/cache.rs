//! URL -> song cache
//!
//! Tracks need only be downloaded and converted once: the cache maps each
//! normalized URL to a single [`Song`], so concurrent submissions of the
//! same resource collapse onto one download. The map persists to disk after
//! every successful download.
//!
//! One mutex covers read and write; the access pattern is read-heavy and
//! the critical sections are short.

use crate::error::{Error, Result};
use crate::persist;
use crate::resource::{download, Song, SongRecord};
use crate::store::{self, StoreClient};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;
use url::{form_urlencoded, Url};

/// Cap on concurrent downloads, so upstream providers don't get hammered.
const MAX_ACTIVE_DOWNLOADS: usize = 3;

/// Cache translating resource identifiers into resolvable songs.
pub struct Cache {
    entries: Mutex<HashMap<String, Arc<Song>>>,
    store: StoreClient,
    http: reqwest::Client,
    permits: Arc<Semaphore>,
    scratch_dir: PathBuf,
    path: PathBuf,
    bitrate: u32,
}

impl Cache {
    /// Load the cache file (creating it when absent) and return the cache.
    pub async fn load(
        path: PathBuf,
        store: StoreClient,
        scratch_dir: PathBuf,
        bitrate: u32,
    ) -> Result<Arc<Self>> {
        let records: Option<HashMap<String, SongRecord>> = persist::load_json(&path).await?;
        let fresh = records.is_none();
        let entries = records
            .unwrap_or_default()
            .into_iter()
            .map(|(url, record)| (url, Song::from_record(record)))
            .collect();

        let cache = Arc::new(Self {
            entries: Mutex::new(entries),
            store,
            http: reqwest::Client::new(),
            permits: Arc::new(Semaphore::new(MAX_ACTIVE_DOWNLOADS)),
            scratch_dir,
            path,
            bitrate,
        });
        if fresh {
            cache.save().await?;
        }
        Ok(cache)
    }

    /// Translate a resource identifier into a song, dispatching a download
    /// on a cache miss.
    ///
    /// Content addresses never download: they are either already known or
    /// bound directly to the store. URLs are normalized first so trivially
    /// different spellings of the same track share one entry.
    pub async fn lookup(self: &Arc<Self>, resource_id: &str, urgent: bool) -> Result<Arc<Song>> {
        if store::is_cas_path(resource_id) {
            let mut entries = self.entries.lock().await;
            if let Some(song) = entries.get(resource_id) {
                return Ok(song.clone());
            }
            let song = Song::from_digest(resource_id);
            entries.insert(resource_id.to_string(), song.clone());
            return Ok(song);
        }

        let normalized = normalize(resource_id)?;
        let song = {
            let mut entries = self.entries.lock().await;
            if let Some(song) = entries.get(&normalized) {
                // Resolved or still in flight; either way it's the same track.
                return Ok(song.clone());
            }
            let url = Url::parse(&normalized)
                .map_err(|e| Error::InvalidResource(format!("{normalized}: {e}")))?;
            let song = Song::from_url(url, urgent);
            entries.insert(normalized.clone(), song.clone());
            song
        };

        self.dispatch(normalized, song.clone());
        Ok(song)
    }

    /// Start the download for a fresh entry and watch its outcome: persist
    /// the digest association on success, forget the entry on failure so a
    /// later submission can retry.
    fn dispatch(self: &Arc<Self>, normalized: String, song: Arc<Song>) {
        download::spawn(
            song.clone(),
            self.store.clone(),
            self.http.clone(),
            self.scratch_dir.clone(),
            self.permits.clone(),
            self.bitrate,
        );

        let cache = self.clone();
        tokio::spawn(async move {
            match song.outcome().await {
                Ok(_) => {
                    if let Err(e) = cache.save().await {
                        warn!("failed to write cache file, will retry on next mutation: {e}");
                    }
                }
                Err(_) => {
                    cache.entries.lock().await.remove(&normalized);
                }
            }
        });
    }

    /// Write the URL-keyed entries to disk.
    pub async fn save(&self) -> Result<()> {
        let records: HashMap<String, SongRecord> = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|(key, _)| !store::is_cas_path(key))
                .map(|(key, song)| (key.clone(), song.to_record()))
                .collect()
        };
        persist::save_json(&self.path, &records).await
    }
}

/// Normalize URLs to reduce duplication in the cache.
///
/// The YouTube long forms collapse to the canonical short form; all other
/// hosts lose the `list` query parameter (playlists are not tracks).
/// Idempotent: normalizing a normalized URL is a no-op.
pub fn normalize(raw_url: &str) -> Result<String> {
    let url = Url::parse(raw_url)
        .map_err(|e| Error::InvalidResource(format!("{raw_url}: {e}")))?;

    match url.host_str() {
        Some("youtube.com") | Some("www.youtube.com") => {
            let video_id = url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned())
                .unwrap_or_default();
            Ok(format!("https://youtu.be/{video_id}"))
        }
        Some(_) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| key != "list")
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();

            let mut url = url;
            if kept.is_empty() {
                url.set_query(None);
            } else {
                let query = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(kept)
                    .finish();
                url.set_query(Some(&query));
            }
            Ok(url.to_string())
        }
        None => Err(Error::InvalidResource(format!("{raw_url}: missing host"))),
    }
}
