//! # onda
//!
//! A single-origin internet radio server. Operators and users enqueue
//! audio resources (remote URLs or `/cas/` content addresses); the server
//! broadcasts a continuous MP3 stream over HTTP that any number of
//! listeners can tune into. When the operator queue drains, a learned
//! autoqueue supplies the next track so the broadcast never goes silent.
//!
//! **Architecture:** acquisition and caching (`resource`), an ordered queue
//! fronting a Markov-chain suggester (`queue`), a re-encoding packet
//! producer (`mixer`), and an HTTP fan-out (`broadcast`), tied together by
//! a small control API (`api`).

pub mod api;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod mixer;
pub mod persist;
pub mod queue;
pub mod resource;
pub mod store;
pub mod transcode;

pub use error::{Error, Result};
