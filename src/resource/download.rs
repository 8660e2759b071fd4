//! Per-source-type download
//!
//! Routes a song's URL to a handler by hostname and extension, fetches the
//! bytes, and lands them as canonical MP3: YouTube-family URLs go through
//! metadata lookup, best-audio stream selection, and the Split transcoder;
//! direct `.mp3` links pass straight through; `.flac` links transcode.
//!
//! Every handler has the same shape: a scratch file whose pre-existence
//! suppresses duplicate downloads, a fetch task pushing source bytes, a tee
//! task landing converter output in the scratch file (and the song's live
//! pipe when it was constructed urgent), and a finalize step that adds the
//! file to the store and fires the song's outcome.

use crate::error::{Error, Result};
use crate::resource::Song;
use crate::store::StoreClient;
use crate::transcode::{self, TranscodeChild};
use futures::TryStreamExt;
use rusty_ytdl::{Video, VideoOptions, VideoQuality, VideoSearchOptions};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use url::Url;

const YOUTUBE_HOSTS: &[&str] = &[
    "youtu.be",
    "youtube.com",
    "www.youtube.com",
    "music.youtube.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Source {
    YouTube,
    DirectMp3,
    DirectFlac,
    Unsupported,
}

pub(crate) fn classify(url: &Url) -> Source {
    let host = url.host_str().unwrap_or_default();
    if YOUTUBE_HOSTS.contains(&host) {
        return Source::YouTube;
    }
    match Path::new(url.path()).extension().and_then(|e| e.to_str()) {
        Some("mp3") => Source::DirectMp3,
        Some("flac") => Source::DirectFlac,
        _ => Source::Unsupported,
    }
}

/// Kick off the download for a pending song and deliver its outcome.
pub fn spawn(
    song: Arc<Song>,
    store: StoreClient,
    http: reqwest::Client,
    scratch_dir: PathBuf,
    permits: Arc<Semaphore>,
    bitrate: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = song.resource_id();
        match run(&song, &store, &http, &scratch_dir, &permits, bitrate).await {
            Ok(Some(cas)) => {
                info!("cached {id} as {cas}");
                song.deliver(Ok(cas));
            }
            // Another task is already fetching this resource; it owns the
            // outcome.
            Ok(None) => {}
            Err(e) => {
                warn!("failed to fetch {id}: {e}");
                song.deliver(Err(e.to_string()));
            }
        }
    })
}

async fn run(
    song: &Arc<Song>,
    store: &StoreClient,
    http: &reqwest::Client,
    scratch_dir: &Path,
    permits: &Arc<Semaphore>,
    bitrate: u32,
) -> Result<Option<String>> {
    let url = song
        .url()
        .cloned()
        .ok_or_else(|| Error::InvalidResource("song has no URL to download".into()))?;

    let source = classify(&url);
    if source == Source::Unsupported {
        return Err(Error::UnsupportedSource(format!(
            "{} doesn't match a known provider (expected one of {:?} or a direct .mp3/.flac link)",
            url,
            YOUTUBE_HOSTS
        )));
    }

    tokio::fs::create_dir_all(scratch_dir)
        .await
        .map_err(|e| Error::Download(format!("cannot create scratch dir: {e}")))?;
    let scratch_path = scratch_dir.join(format!("{}.mp3", url_digest(&url)));

    // If the scratch file already exists another task is fetching the same
    // resource; don't start a duplicate.
    if tokio::fs::try_exists(&scratch_path).await? {
        debug!("download of {url} already in flight");
        return Ok(None);
    }
    let scratch_file = File::create(&scratch_path)
        .await
        .map_err(|e| Error::Download(format!("cannot create scratch file: {e}")))?;

    let fetched = match source {
        Source::YouTube => fetch_youtube(song, &url, scratch_file, permits, bitrate).await,
        Source::DirectMp3 => fetch_direct(song, http, &url, scratch_file, permits, None).await,
        Source::DirectFlac => {
            fetch_direct(song, http, &url, scratch_file, permits, Some(bitrate)).await
        }
        Source::Unsupported => unreachable!(),
    };

    if let Err(e) = fetched {
        let _ = tokio::fs::remove_file(&scratch_path).await;
        return Err(e);
    }

    finalize(store, &scratch_path).await.map(Some)
}

/// Add the landed file to the store and clean up the scratch file.
async fn finalize(store: &StoreClient, scratch_path: &Path) -> Result<String> {
    let size = tokio::fs::metadata(scratch_path).await?.len();
    if size == 0 {
        let _ = tokio::fs::remove_file(scratch_path).await;
        return Err(Error::StoreAdd("downloaded file was 0 bytes".into()));
    }

    let cas = store.add_file(scratch_path).await?;
    if let Err(e) = tokio::fs::remove_file(scratch_path).await {
        warn!("failed to remove scratch file {}: {e}", scratch_path.display());
    }
    Ok(cas)
}

async fn fetch_youtube(
    song: &Arc<Song>,
    url: &Url,
    scratch_file: File,
    permits: &Arc<Semaphore>,
    bitrate: u32,
) -> Result<()> {
    let options = VideoOptions {
        quality: VideoQuality::HighestAudio,
        filter: VideoSearchOptions::Audio,
        ..Default::default()
    };
    let video = Video::new_with_options(url.as_str(), options)
        .map_err(|e| Error::Download(format!("provider rejected {url}: {e}")))?;

    let info = video
        .get_basic_info()
        .await
        .map_err(|e| Error::Download(format!("metadata fetch for {url} failed: {e}")))?;

    // Populate metadata before any bytes land so the queue display has
    // something to show while the audio is still being fetched.
    song.set_title(info.video_details.title);
    if let Ok(seconds) = info.video_details.length_seconds.parse::<u64>() {
        song.set_duration(Duration::from_secs(seconds));
    }

    let TranscodeChild {
        mut stdin,
        stdout,
        done,
    } = transcode::split(bitrate)?;

    let fetch_url = url.clone();
    let fetch_permits = permits.clone();
    let fetch: JoinHandle<Result<()>> = tokio::spawn(async move {
        let _permit = fetch_permits
            .acquire_owned()
            .await
            .map_err(|_| Error::Download("download limiter closed".into()))?;
        info!("starting download of {fetch_url}");

        let stream = video
            .stream()
            .await
            .map_err(|e| Error::Download(format!("stream open failed: {e}")))?;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| Error::Download(format!("stream read failed: {e}")))?
        {
            stdin
                .write_all(&chunk)
                .await
                .map_err(|e| Error::Download(format!("converter rejected input: {e}")))?;
        }
        let _ = stdin.shutdown().await;
        info!("download of {fetch_url} complete");
        Ok(())
    });

    let tee = spawn_tee(stdout, scratch_file, song.take_pipe_writer());

    join_task(fetch, "fetch").await?;
    join_task(tee, "tee").await?;
    done.await
        .map_err(|e| Error::Transcode(format!("transcoder watcher panicked: {e}")))?
}

async fn fetch_direct(
    song: &Arc<Song>,
    http: &reqwest::Client,
    url: &Url,
    scratch_file: File,
    permits: &Arc<Semaphore>,
    split_bitrate: Option<u32>,
) -> Result<()> {
    if song.title().is_empty() {
        let name = Path::new(url.path())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        song.set_title(name);
    }

    match split_bitrate {
        // Already MP3: the fetch feeds the tee directly.
        None => {
            let _permit = permits
                .acquire()
                .await
                .map_err(|_| Error::Download("download limiter closed".into()))?;
            info!("starting download of {url}");
            let body = open_body(http, url).await?;
            tee_copy(body, scratch_file, song.take_pipe_writer()).await?;
            info!("download of {url} complete");
            Ok(())
        }
        // Lossless input still goes through the converter.
        Some(bitrate) => {
            let TranscodeChild {
                mut stdin,
                stdout,
                done,
            } = transcode::split(bitrate)?;

            let fetch_url = url.clone();
            let fetch_http = http.clone();
            let fetch_permits = permits.clone();
            let fetch: JoinHandle<Result<()>> = tokio::spawn(async move {
                let _permit = fetch_permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Download("download limiter closed".into()))?;
                info!("starting download of {fetch_url}");
                let mut body = open_body(&fetch_http, &fetch_url).await?;
                tokio::io::copy(&mut body, &mut stdin)
                    .await
                    .map_err(|e| Error::Download(format!("converter rejected input: {e}")))?;
                let _ = stdin.shutdown().await;
                info!("download of {fetch_url} complete");
                Ok(())
            });

            let tee = spawn_tee(stdout, scratch_file, song.take_pipe_writer());

            join_task(fetch, "fetch").await?;
            join_task(tee, "tee").await?;
            done.await
                .map_err(|e| Error::Transcode(format!("transcoder watcher panicked: {e}")))?
        }
    }
}

async fn open_body(
    http: &reqwest::Client,
    url: &Url,
) -> Result<impl AsyncRead + Send + Unpin> {
    let resp = http
        .get(url.clone())
        .send()
        .await
        .map_err(|e| Error::Download(e.to_string()))?
        .error_for_status()
        .map_err(|e| Error::Download(e.to_string()))?;
    Ok(StreamReader::new(
        resp.bytes_stream().map_err(std::io::Error::other),
    ))
}

/// Land converter output in the scratch file, mirroring it into the song's
/// live pipe when one is attached.
async fn tee_copy(
    mut src: impl AsyncRead + Unpin,
    mut scratch_file: File,
    mut pipe: Option<DuplexStream>,
) -> Result<()> {
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = src
            .read(&mut buf)
            .await
            .map_err(|e| Error::Download(format!("converter output died: {e}")))?;
        if n == 0 {
            break;
        }
        scratch_file
            .write_all(&buf[..n])
            .await
            .map_err(|e| Error::Download(format!("scratch write failed: {e}")))?;
        if let Some(writer) = pipe.as_mut() {
            // A dead pipe just means nobody is listening anymore.
            if writer.write_all(&buf[..n]).await.is_err() {
                pipe = None;
            }
        }
    }
    scratch_file
        .flush()
        .await
        .map_err(|e| Error::Download(format!("scratch flush failed: {e}")))?;
    if let Some(mut writer) = pipe {
        let _ = writer.shutdown().await;
    }
    Ok(())
}

fn spawn_tee(
    src: impl AsyncRead + Unpin + Send + 'static,
    scratch_file: File,
    pipe: Option<DuplexStream>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(tee_copy(src, scratch_file, pipe))
}

async fn join_task(task: JoinHandle<Result<()>>, name: &str) -> Result<()> {
    task.await
        .map_err(|e| Error::Download(format!("{name} task panicked: {e}")))?
}

/// Deterministic scratch-file stem for a normalized URL, so a second task
/// fetching the same resource sees the in-flight file.
fn url_digest(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn source_routing() {
        assert_eq!(classify(&parse("https://youtu.be/abc")), Source::YouTube);
        assert_eq!(
            classify(&parse("https://www.youtube.com/watch?v=abc")),
            Source::YouTube
        );
        assert_eq!(
            classify(&parse("https://example.com/song.mp3")),
            Source::DirectMp3
        );
        assert_eq!(
            classify(&parse("https://example.com/song.flac")),
            Source::DirectFlac
        );
        assert_eq!(
            classify(&parse("https://example.com/page.html")),
            Source::Unsupported
        );
        assert_eq!(
            classify(&parse("https://example.com/")),
            Source::Unsupported
        );
    }

    #[test]
    fn scratch_names_are_deterministic() {
        let a = url_digest(&parse("https://youtu.be/abc"));
        let b = url_digest(&parse("https://youtu.be/abc"));
        let c = url_digest(&parse("https://youtu.be/xyz"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn tee_mirrors_into_live_pipe() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("landed.mp3");
        let file = File::create(&path).await.unwrap();

        let (mut pipe_reader, pipe_writer) = tokio::io::duplex(64 * 1024);
        let src = std::io::Cursor::new(b"encoded audio".to_vec());

        tee_copy(src, file, Some(pipe_writer)).await.unwrap();

        let mut mirrored = Vec::new();
        pipe_reader.read_to_end(&mut mirrored).await.unwrap();
        assert_eq!(mirrored, b"encoded audio");
        assert_eq!(std::fs::read(&path).unwrap(), b"encoded audio");
    }
}
