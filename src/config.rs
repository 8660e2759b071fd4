//! Runtime configuration
//!
//! All knobs arrive as command-line flags; persisted files default to the
//! working directory so a bare `onda` invocation is self-contained.

use clap::Parser;
use std::path::PathBuf;

/// onda - single-origin internet radio server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Where to store the operator queue
    #[arg(long, value_name = "FILE", default_value = "queue.json")]
    pub queue_file: PathBuf,

    /// Where to store the URL -> song cache
    #[arg(long, value_name = "FILE", default_value = "cache.json")]
    pub cache_file: PathBuf,

    /// Where to store the autoqueue chain
    #[arg(long, value_name = "FILE", default_value = "autoq.db")]
    pub autoq_file: PathBuf,

    /// Token/role file for API authorization; omit to disable auth
    #[arg(long, value_name = "FILE")]
    pub auth_file: Option<PathBuf>,

    /// Base URL of the content-addressed store
    #[arg(long, value_name = "URL", default_value = "http://127.0.0.1:5001")]
    pub store_url: String,

    /// Scratch directory for in-flight downloads
    #[arg(long, value_name = "DIR", default_value = "scratch-dl")]
    pub scratch_dir: PathBuf,

    /// Turn off the learned autoqueue fallback
    #[arg(long)]
    pub disable_autoq: bool,

    /// Probability of deviating from the learned successor set
    #[arg(long, value_name = "PROB", default_value_t = 0.05)]
    pub chainbreak_prob: f64,

    /// How many recently played tracks the autoqueue remembers as its key
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub prefix_length: usize,

    /// How many recent tracks are suppressed from re-suggestion
    #[arg(long, value_name = "N", default_value_t = 8)]
    pub recent_length: usize,

    /// Broadcast bitrate in kbit/s
    #[arg(long, value_name = "KBPS", default_value_t = 128)]
    pub bitrate: u32,

    /// Port for the control API
    #[arg(long, value_name = "PORT", default_value_t = 8085)]
    pub api_port: u16,

    /// Port for the audio stream
    #[arg(long, value_name = "PORT", default_value_t = 9090)]
    pub audio_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["onda"]);
        assert_eq!(args.queue_file, PathBuf::from("queue.json"));
        assert_eq!(args.bitrate, 128);
        assert_eq!(args.prefix_length, 1);
        assert_eq!(args.recent_length, 8);
        assert_eq!(args.api_port, 8085);
        assert_eq!(args.audio_port, 9090);
        assert!(!args.disable_autoq);
        assert!(args.auth_file.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "onda",
            "--disable-autoq",
            "--bitrate",
            "192",
            "--prefix-length",
            "2",
        ]);
        assert!(args.disable_autoq);
        assert_eq!(args.bitrate, 192);
        assert_eq!(args.prefix_length, 2);
    }
}
