//! Transcoder gateway
//!
//! Wraps the external `ffmpeg` binary as an in/out byte pipeline. Two
//! configurations exist: [`split`] converts an arbitrary container to MP3
//! (used on freshly downloaded sources) and [`normalize`] re-encodes MP3 to
//! loudness-normalized MP3 at the broadcast bitrate (the mixer's single
//! long-lived child).
//!
//! The child's stderr is forwarded to the log; its exit is observable
//! through the returned completion handle. A zombie is impossible: the
//! completion task always `wait()`s the child.

use crate::error::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const FFMPEG: &str = "ffmpeg";

/// A running transcoder child: a sink for source bytes, a source of encoded
/// bytes, and a handle resolving when the child exits.
pub struct TranscodeChild {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub done: JoinHandle<Result<()>>,
}

/// Verify the transcoder binary exists before serving anything.
///
/// A missing binary is fatal at startup rather than at first play.
pub fn probe() -> Result<()> {
    match std::process::Command::new(FFMPEG)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::ChildMissing(FFMPEG.to_string()))
        }
        Err(e) => Err(Error::Transcode(format!("failed to probe {FFMPEG}: {e}"))),
    }
}

/// Arbitrary container in, MP3 out.
pub fn split(bitrate_kbps: u32) -> Result<TranscodeChild> {
    spawn(&[
        "-y",
        "-loglevel",
        "error",
        "-i",
        "pipe:0",
        "-vn",
        "-b:a",
        &format!("{bitrate_kbps}k"),
        "-f",
        "mp3",
        "pipe:1",
    ])
}

/// MP3 in, loudness-normalized MP3 at the broadcast bitrate out.
pub fn normalize(bitrate_kbps: u32) -> Result<TranscodeChild> {
    spawn(&[
        "-y",
        "-loglevel",
        "error",
        "-i",
        "pipe:0",
        "-filter:a",
        "loudnorm",
        "-b:a",
        &format!("{bitrate_kbps}k"),
        "-f",
        "mp3",
        "pipe:1",
    ])
}

fn spawn(args: &[&str]) -> Result<TranscodeChild> {
    let mut child = Command::new(FFMPEG)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ChildMissing(FFMPEG.to_string()),
            _ => Error::Transcode(format!("failed to start {FFMPEG}: {e}")),
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transcode("transcoder stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transcode("transcoder stdout unavailable".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Transcode("transcoder stderr unavailable".into()))?;

    // Forward the child's diagnostics into our log.
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(target: "onda::transcode", "{FFMPEG}: {line}");
        }
    });

    let done = tokio::spawn(async move {
        let status = child
            .wait()
            .await
            .map_err(|e| Error::Transcode(format!("failed to reap {FFMPEG}: {e}")))?;
        if status.success() {
            debug!("{FFMPEG} exited cleanly");
            Ok(())
        } else {
            Err(Error::Transcode(format!("{FFMPEG} exited with {status}")))
        }
    });

    Ok(TranscodeChild {
        stdin,
        stdout,
        done,
    })
}
