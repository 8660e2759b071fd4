//! Operator queue
//!
//! An ordered list of songs under one mutex, drained by the mixer. When the
//! list runs dry the autoqueue supplies the next track, so the broadcast
//! never goes silent. The queue persists as a JSON array on every mutation.

pub mod autoq;

use crate::error::Result;
use crate::persist;
use crate::queue::autoq::AutoQueue;
use crate::resource::cache::Cache;
use crate::resource::{Song, SongRecord};
use crate::store::{ByteReader, StoreClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A track handed to the mixer: the song, its byte reader, and whether it
/// came from the autoqueue rather than an operator.
pub struct Popped {
    pub song: Arc<Song>,
    pub reader: ByteReader,
    pub from_auto: bool,
}

pub struct Queue {
    fifo: Mutex<Vec<Arc<Song>>>,
    autoq: Arc<AutoQueue>,
    autoq_enabled: bool,
    cache: Arc<Cache>,
    store: StoreClient,
    path: PathBuf,
}

impl Queue {
    /// Load the queue file (creating it when absent).
    pub async fn load(
        path: PathBuf,
        autoq: Arc<AutoQueue>,
        autoq_enabled: bool,
        cache: Arc<Cache>,
        store: StoreClient,
    ) -> Result<Arc<Self>> {
        let records: Option<Vec<SongRecord>> = persist::load_json(&path).await?;
        let fresh = records.is_none();
        let fifo = records
            .unwrap_or_default()
            .into_iter()
            .map(Song::from_record)
            .collect();

        let queue = Arc::new(Self {
            fifo: Mutex::new(fifo),
            autoq,
            autoq_enabled,
            cache,
            store,
            path,
        });
        if fresh {
            queue.save().await?;
        }
        Ok(queue)
    }

    pub async fn save(&self) -> Result<()> {
        let records: Vec<SongRecord> = {
            let fifo = self.fifo.lock().await;
            fifo.iter().map(|song| song.to_record()).collect()
        };
        persist::save_json(&self.path, &records).await
    }

    async fn persist(&self) {
        if let Err(e) = self.save().await {
            warn!("failed to write queue file, will retry on next mutation: {e}");
        }
    }

    /// Append unless an entry for the same resource already sits in the
    /// queue.
    pub async fn add_to_queue(&self, song: Arc<Song>) {
        {
            let mut fifo = self.fifo.lock().await;
            if fifo
                .iter()
                .any(|entry| entry.resource_id() == song.resource_id())
            {
                info!("rejecting duplicate queue entry for {}", song.title());
                return;
            }
            fifo.push(song.clone());
        }
        info!("queued {} ({})", song.title(), song.resource_id());
        self.persist().await;
    }

    /// Put a song at the front of the queue.
    pub async fn play_next(&self, song: Arc<Song>) {
        self.fifo.lock().await.insert(0, song.clone());
        info!("queued {} ({}) to play next", song.title(), song.resource_id());
        self.persist().await;
    }

    /// The next track to play: the queue head, or an autoqueue suggestion
    /// when the queue is empty. `None` means there is nothing to play.
    ///
    /// Entries that fail to resolve are logged and stepped past.
    pub async fn pop(&self) -> Option<Popped> {
        loop {
            let head = {
                let mut fifo = self.fifo.lock().await;
                if fifo.is_empty() {
                    None
                } else {
                    Some(fifo.remove(0))
                }
            };

            match head {
                Some(song) => {
                    self.persist().await;
                    match song.resolve(&self.store).await {
                        Ok(reader) => {
                            return Some(Popped {
                                song,
                                reader,
                                from_auto: false,
                            })
                        }
                        Err(e) => {
                            warn!("failed to resolve queued song, moving on: {e}");
                            continue;
                        }
                    }
                }
                None => {
                    if !self.autoq_enabled {
                        return None;
                    }
                    let digest = self.autoq.pick().await?;
                    let song = match self.cache.lookup(&digest, false).await {
                        Ok(song) => song,
                        Err(e) => {
                            warn!("autoqueue produced an unusable suggestion: {e}");
                            return None;
                        }
                    };
                    match song.resolve(&self.store).await {
                        Ok(reader) => {
                            return Some(Popped {
                                song,
                                reader,
                                from_auto: true,
                            })
                        }
                        Err(e) => {
                            warn!("failed to resolve autoqueue suggestion {digest}: {e}");
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Snapshot for display, first evicting songs whose download already
    /// failed.
    pub async fn get_queue(&self) -> Vec<Arc<Song>> {
        let (snapshot, evicted) = {
            let mut fifo = self.fifo.lock().await;
            let before = fifo.len();
            fifo.retain(|song| match song.check_failure() {
                Some(e) => {
                    warn!(
                        "evicting {} from the queue, download failed: {e}",
                        song.resource_id()
                    );
                    false
                }
                None => true,
            });
            (fifo.clone(), fifo.len() != before)
        };
        if evicted {
            self.persist().await;
        }
        snapshot
    }

    /// Remove everything; does not touch the currently playing track.
    pub async fn dump(&self) {
        self.fifo.lock().await.clear();
        self.persist().await;
    }

    pub async fn len(&self) -> usize {
        self.fifo.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.fifo.lock().await.is_empty()
    }

    /// Let the autoqueue know a track finished. With `learn_from` false the
    /// suggestion state still advances but nothing new is learned.
    pub async fn notify_done(&self, digest: &str, learn_from: bool) {
        self.autoq.observe(digest, learn_from).await;
    }

    /// Make the autoqueue's next suggestion random.
    pub fn shuffle(&self) {
        self.autoq.shuffle();
    }
}
