//! Learned autoqueue
//!
//! A Markov chain over play history keeps the broadcast going when the
//! operator queue drains. The chain key is the last K digests played joined
//! with spaces; each key maps to the digests observed to follow it.
//!
//! Suggestions deliberately deviate from the learned successors with a
//! small probability while a successor set is thin, and recently played
//! digests are suppressed so the station doesn't collapse into a short
//! loop.

use crate::error::Result;
use crate::persist;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often the chain is flushed to disk in the background.
const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Below this many learned successors, the chain may deliberately break.
const CHAINBREAK_FLOOR: usize = 4;

/// How many times to reroll a recently played suggestion before going
/// random.
const FRESH_RETRIES: usize = 5;

#[derive(Debug)]
struct Chain {
    data: HashMap<String, Vec<String>>,
    prefix: VecDeque<String>,
    chainbreak_prob: f64,
}

impl Chain {
    fn new(prefix_len: usize, chainbreak_prob: f64) -> Self {
        Self {
            data: HashMap::new(),
            prefix: std::iter::repeat(String::new()).take(prefix_len).collect(),
            chainbreak_prob: chainbreak_prob.clamp(0.0, 1.0),
        }
    }

    fn key(&self) -> String {
        self.prefix
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Drop the oldest digest from the prefix and append the newest.
    fn shift(&mut self, digest: &str) {
        self.prefix.pop_front();
        self.prefix.push_back(digest.to_string());
    }

    /// Uniform pick over the chain's flat value-set.
    fn random(&self) -> Option<String> {
        let total: usize = self.data.values().map(Vec::len).sum();
        if total == 0 {
            return None;
        }
        let mut idx = rand::thread_rng().gen_range(0..total);
        for successors in self.data.values() {
            if idx < successors.len() {
                return Some(successors[idx].clone());
            }
            idx -= successors.len();
        }
        None
    }

    /// One suggestion according to the chain, chain-breaks included.
    fn generate(&self) -> Option<String> {
        let choices = match self.data.get(&self.key()) {
            Some(choices) if !choices.is_empty() => choices,
            _ => return self.random(),
        };

        let mut rng = rand::thread_rng();
        if self.chainbreak_prob > 0.0
            && choices.len() < CHAINBREAK_FLOOR
            && rng.gen_bool(self.chainbreak_prob)
        {
            return self.random();
        }
        Some(choices[rng.gen_range(0..choices.len())].clone())
    }
}

/// Suggestion engine fed by actual play history.
pub struct AutoQueue {
    chain: RwLock<Chain>,
    recent: Mutex<VecDeque<String>>,
    recent_len: usize,
    shuffle: AtomicBool,
    path: PathBuf,
}

impl AutoQueue {
    /// Load the chain file (creating it when absent).
    pub async fn load(
        path: PathBuf,
        prefix_len: usize,
        chainbreak_prob: f64,
        recent_len: usize,
    ) -> Result<Arc<Self>> {
        let mut chain = Chain::new(prefix_len.max(1), chainbreak_prob);
        let loaded: Option<HashMap<String, Vec<String>>> = persist::load_bin(&path).await?;
        let fresh = loaded.is_none();
        if let Some(data) = loaded {
            chain.data = data;
        }

        let autoq = Arc::new(Self {
            chain: RwLock::new(chain),
            recent: Mutex::new(VecDeque::with_capacity(recent_len)),
            recent_len,
            shuffle: AtomicBool::new(false),
            path,
        });
        if fresh {
            autoq.save().await?;
        }
        Ok(autoq)
    }

    /// Flush the chain periodically so learning survives a crash.
    pub fn spawn_autosave(self: &Arc<Self>) -> JoinHandle<()> {
        let autoq = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(AUTOSAVE_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = autoq.save().await {
                    warn!(
                        "failed to write autoqueue chain, learning will not persist until this is fixed: {e}"
                    );
                }
            }
        })
    }

    pub async fn save(&self) -> Result<()> {
        let data = self.chain.read().await.data.clone();
        persist::save_bin(&self.path, &data).await
    }

    /// Suggest the next digest to play, or `None` when nothing has been
    /// learned yet.
    pub async fn pick(&self) -> Option<String> {
        let chain = self.chain.read().await;
        if self.shuffle.swap(false, Ordering::SeqCst) {
            return chain.random();
        }
        for _ in 0..FRESH_RETRIES {
            let candidate = chain.generate()?;
            if self.is_fresh(&candidate) {
                return Some(candidate);
            }
        }
        // Everything the chain offers was played recently.
        chain.random()
    }

    fn is_fresh(&self, digest: &str) -> bool {
        !self.recent.lock().unwrap().iter().any(|recent| recent == digest)
    }

    /// Record that a track finished playing.
    ///
    /// The prefix always advances so suggestion state tracks true play
    /// order. The successor list only grows when `learn_from` is set, and
    /// never with duplicates or self-loops.
    pub async fn observe(&self, digest: &str, learn_from: bool) {
        {
            let mut recent = self.recent.lock().unwrap();
            recent.push_back(digest.to_string());
            while recent.len() > self.recent_len {
                recent.pop_front();
            }
        }

        let mut chain = self.chain.write().await;
        if learn_from {
            let key = chain.key();
            let duplicate = chain
                .data
                .get(&key)
                .is_some_and(|successors| successors.iter().any(|s| s == digest));
            let self_loop = chain.prefix.back().is_some_and(|last| last == digest);
            if !duplicate && !self_loop {
                info!("adding {digest} to the autoqueue chain");
                chain.data.entry(key).or_default().push(digest.to_string());
            }
        }
        chain.shift(digest);
    }

    /// Make the next pick ignore the chain and go random.
    pub fn shuffle(&self) {
        self.shuffle.store(true, Ordering::SeqCst);
    }
}
