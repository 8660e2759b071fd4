//! Mixer
//!
//! The link between songs in the queue and a continuous broadcastable
//! packet stream. One producer loop pulls tracks, pushes their bytes
//! through a single long-lived Normalize transcoder child, and a
//! packetizer slices the child's output into packets sized to play in real
//! time when the broadcast paces one packet per half second.
//!
//! [`MixerControl`] is the shared control surface: the now-playing record
//! for `/playing`, and a skip that is safe from any task.

use crate::error::{Error, Result};
use crate::queue::{Popped, Queue};
use crate::resource::SongRecord;
use crate::transcode::{self, TranscodeChild};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Output channel depth; enough to ride out song transitions.
const OUTPUT_DEPTH: usize = 16;

/// Extra bytes per packet, absorbing child-process timing jitter.
const PACKET_SLACK: usize = 32;

/// Pause when the queue has nothing to offer.
const EMPTY_QUEUE_PAUSE: Duration = Duration::from_secs(2);

/// Pause after a non-skip copy error, giving the transcoder a chance to
/// recover.
const RECOVERY_PAUSE: Duration = Duration::from_secs(10);

/// Half a second of audio at the configured bitrate, plus slack.
fn packet_size(bitrate_kbps: u32) -> usize {
    (bitrate_kbps as usize * 1000 / 8) / 2 + PACKET_SLACK
}

fn loading_placeholder() -> SongRecord {
    SongRecord {
        cas_path: String::new(),
        url: String::new(),
        title: "Loading next...".to_string(),
        duration: 0,
    }
}

/// Control surface shared between the producer loop and the HTTP handlers.
#[derive(Clone)]
pub struct MixerControl {
    now_playing: Arc<RwLock<SongRecord>>,
    skip_token: Arc<Mutex<CancellationToken>>,
    skipped: Arc<AtomicBool>,
}

impl MixerControl {
    pub fn new() -> Self {
        Self {
            now_playing: Arc::new(RwLock::new(loading_placeholder())),
            skip_token: Arc::new(Mutex::new(CancellationToken::new())),
            skipped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Force the current track to end. Safe to call from any task and
    /// idempotent. The producer swallows the resulting copy abort and does
    /// not train the autoqueue from the aborted track.
    pub fn skip(&self) {
        self.skipped.store(true, Ordering::SeqCst);
        self.skip_token.lock().unwrap().cancel();
    }

    /// What `/playing` reports as the current song.
    pub fn now_playing(&self) -> SongRecord {
        self.now_playing.read().unwrap().clone()
    }

    /// Install a fresh track: record it as now playing, clear any stale
    /// skip, and hand back the cancellation token for this copy.
    fn begin(&self, record: SongRecord) -> CancellationToken {
        *self.now_playing.write().unwrap() = record;
        self.skipped.store(false, Ordering::SeqCst);
        let token = CancellationToken::new();
        *self.skip_token.lock().unwrap() = token.clone();
        token
    }

    fn take_skipped(&self) -> bool {
        self.skipped.swap(false, Ordering::SeqCst)
    }

    fn set_loading(&self) {
        *self.now_playing.write().unwrap() = loading_placeholder();
    }
}

impl Default for MixerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the mixer: spawn the transcoder child, the packetizer, and the
/// producer loop. Returns the paced packet stream for the broadcast.
pub fn start(
    queue: Arc<Queue>,
    bitrate_kbps: u32,
    control: MixerControl,
) -> Result<mpsc::Receiver<Bytes>> {
    let TranscodeChild {
        stdin,
        stdout,
        done,
    } = transcode::normalize(bitrate_kbps)?;

    let (tx, rx) = mpsc::channel(OUTPUT_DEPTH);

    // Packetizer: normalized MP3 out of the child, fixed-size packets into
    // the output channel.
    tokio::spawn(async move {
        match packetize(stdout, tx, packet_size(bitrate_kbps)).await {
            Ok(()) => error!("broadcast encoder stopped producing output"),
            Err(e) => error!("broadcast encoder output died: {e}"),
        }
    });

    tokio::spawn(async move {
        match done.await {
            Ok(Ok(())) => warn!("broadcast encoder exited"),
            Ok(Err(e)) => error!("broadcast encoder failed: {e}"),
            Err(e) => error!("broadcast encoder watcher panicked: {e}"),
        }
    });

    tokio::spawn(produce(queue, stdin, control));

    Ok(rx)
}

/// Producer loop: pop a track, copy its bytes into the encoder, notify the
/// queue, repeat.
async fn produce(queue: Arc<Queue>, mut encoder_in: ChildStdin, control: MixerControl) {
    loop {
        let Some(Popped {
            song,
            mut reader,
            from_auto,
        }) = queue.pop().await
        else {
            tokio::time::sleep(EMPTY_QUEUE_PAUSE).await;
            continue;
        };

        let token = control.begin(song.to_record());
        info!("now playing {}", song.title());

        let copied: Result<()> = tokio::select! {
            _ = token.cancelled() => Err(Error::Skipped),
            result = tokio::io::copy(&mut reader, &mut encoder_in) => result
                .map(|_| ())
                .map_err(|e| Error::Transcode(format!("copy into encoder failed: {e}"))),
        };

        let was_skipped = control.take_skipped();
        match copied {
            Ok(()) => {}
            Err(Error::Skipped) => info!("skipped {}", song.title()),
            Err(e) if was_skipped => info!("skipped {} ({e})", song.title()),
            Err(e) => {
                warn!("trouble copying song into the encoder, pausing to recover: {e}");
                tokio::time::sleep(RECOVERY_PAUSE).await;
            }
        }

        // Autoqueue suggestions don't re-reinforce themselves, and skips
        // teach nothing.
        let learn_from = !from_auto && !was_skipped;
        if let Some(digest) = song.cas_path() {
            queue.notify_done(&digest, learn_from).await;
        }

        control.set_loading();
    }
}

/// Slice a byte stream into fixed-size packets. A partial packet is only
/// emitted at end of stream.
async fn packetize<R>(
    mut src: R,
    out: mpsc::Sender<Bytes>,
    size: usize,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    loop {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled > 0 {
                let _ = out.send(Bytes::copy_from_slice(&buf[..filled])).await;
            }
            return Ok(());
        }
        filled += n;
        if filled == size {
            if out.send(Bytes::copy_from_slice(&buf)).await.is_err() {
                return Ok(());
            }
            filled = 0;
        }
    }
}
