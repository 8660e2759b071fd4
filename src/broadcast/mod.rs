//! Broadcast fan-out
//!
//! One producer, N HTTP listeners. Each listener owns a small bounded
//! channel; the producer never blocks on a listener. A send that would
//! block is a strike, and ten consecutive strikes evict the listener. The
//! last few packets are kept in a replay ring so a new listener starts
//! mid-stream without perceptible silence.

pub mod server;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Packets a joining listener replays so it starts with a clean prelude.
const REPLAY_DEPTH: usize = 16;

/// Outbound buffer per listener; beyond this, sends start striking.
const CONSUMER_DEPTH: usize = 4;

/// Consecutive failed sends before a listener is evicted.
const STRIKE_LIMIT: u32 = 10;

/// Pace between packets; matches the mixer's half-second packet sizing.
pub const PACKET_PACE: Duration = Duration::from_millis(500);

const CONSUMER_ID_LEN: usize = 32;

/// Fan-out state shared between the producer task and the listener
/// handlers.
pub struct BroadcastHub {
    consumers: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
    replay: RwLock<VecDeque<Bytes>>,
    kill_tx: mpsc::UnboundedSender<String>,
    kill_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    pace: Duration,
}

impl BroadcastHub {
    pub fn new(pace: Duration) -> Arc<Self> {
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            consumers: Mutex::new(HashMap::new()),
            replay: RwLock::new(VecDeque::with_capacity(REPLAY_DEPTH)),
            kill_tx,
            kill_rx: Mutex::new(Some(kill_rx)),
            pace,
        })
    }

    /// Attach a new listener: a fresh consumer id and its packet channel.
    pub fn register(&self) -> (String, mpsc::Receiver<Bytes>) {
        let id: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CONSUMER_ID_LEN)
            .map(char::from)
            .collect();
        let (tx, rx) = mpsc::channel(CONSUMER_DEPTH);
        self.consumers.lock().unwrap().insert(id.clone(), tx);
        (id, rx)
    }

    /// Ask the producer to drop a consumer; used on client disconnect and
    /// on strike-out.
    pub fn kill(&self, id: &str) {
        let _ = self.kill_tx.send(id.to_string());
    }

    pub fn listener_count(&self) -> usize {
        self.consumers.lock().unwrap().len()
    }

    /// The replay prelude a joining listener writes before live packets.
    pub fn prelude(&self) -> Vec<Bytes> {
        self.replay.read().unwrap().iter().cloned().collect()
    }

    /// Fan packets out to every listener until the input closes.
    pub fn start(self: Arc<Self>, input: mpsc::Receiver<Bytes>) -> JoinHandle<()> {
        tokio::spawn(self.run(input))
    }

    async fn run(self: Arc<Self>, mut input: mpsc::Receiver<Bytes>) {
        let Some(mut kill_rx) = self.kill_rx.lock().unwrap().take() else {
            error!("broadcast producer started twice");
            return;
        };
        let mut strikes: HashMap<String, u32> = HashMap::new();

        while let Some(packet) = input.recv().await {
            // Pace packets so clients play in real time.
            tokio::time::sleep(self.pace).await;

            // Handle at most one pending kill per tick.
            if let Ok(id) = kill_rx.try_recv() {
                strikes.remove(&id);
                if self.consumers.lock().unwrap().remove(&id).is_some() {
                    info!("listener {id} dropped");
                }
            }

            {
                let consumers = self.consumers.lock().unwrap();
                for (id, tx) in consumers.iter() {
                    match tx.try_send(packet.clone()) {
                        Ok(()) => {
                            strikes.remove(id);
                        }
                        Err(_) => {
                            let count = strikes.entry(id.clone()).or_insert(0);
                            *count += 1;
                            if *count >= STRIKE_LIMIT {
                                warn!("evicting overburdened listener {id}");
                                strikes.remove(id);
                                let _ = self.kill_tx.send(id.clone());
                            }
                        }
                    }
                }
            }

            let mut replay = self.replay.write().unwrap();
            if replay.len() == REPLAY_DEPTH {
                replay.pop_front();
            }
            replay.push_back(packet);
        }
        debug!("broadcast input closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_hub() -> Arc<BroadcastHub> {
        BroadcastHub::new(Duration::from_millis(1))
    }

    async fn feed(hub: &Arc<BroadcastHub>, packets: usize) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(OUTPUT_FEED);
        hub.clone().start(rx);
        for i in 0..packets {
            tx.send(Bytes::from(vec![i as u8; 4])).await.unwrap();
        }
        tx
    }

    const OUTPUT_FEED: usize = 64;

    async fn settle(hub: &Arc<BroadcastHub>, predicate: impl Fn(&BroadcastHub) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if predicate(hub.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("hub never settled");
    }

    #[tokio::test]
    async fn listeners_receive_packets_in_order() {
        let hub = fast_hub();
        let (_id, mut rx) = hub.register();
        let _tx = feed(&hub, 3).await;

        for expected in 0..3u8 {
            let packet = rx.recv().await.unwrap();
            assert_eq!(packet[0], expected);
        }
    }

    #[tokio::test]
    async fn replay_ring_is_bounded_fifo() {
        let hub = fast_hub();
        let _tx = feed(&hub, 20).await;

        settle(&hub, |hub| hub.prelude().len() == REPLAY_DEPTH).await;
        let prelude = hub.prelude();
        // Packets 0..3 were evicted; 4..19 remain in order.
        assert_eq!(prelude.first().unwrap()[0], 4);
        assert_eq!(prelude.last().unwrap()[0], 19);
    }

    #[tokio::test]
    async fn slow_listener_is_struck_out() {
        let hub = fast_hub();
        // Registered but never read: the 4-packet buffer fills, then every
        // further tick is a strike.
        let (_id, rx) = hub.register();
        let _tx = feed(&hub, 40).await;

        settle(&hub, |hub| hub.listener_count() == 0).await;
        drop(rx);
    }

    #[tokio::test]
    async fn kill_removes_a_listener() {
        let hub = fast_hub();
        let (id, _rx) = hub.register();
        assert_eq!(hub.listener_count(), 1);

        hub.kill(&id);
        let _tx = feed(&hub, 2).await;

        settle(&hub, |hub| hub.listener_count() == 0).await;
    }

    #[tokio::test]
    async fn healthy_listener_survives_a_slow_peer() {
        let hub = fast_hub();
        let (healthy_id, mut healthy_rx) = hub.register();
        let (_slow_id, slow_rx) = hub.register();

        let _tx = feed(&hub, 40).await;

        // Drain the healthy listener continuously.
        let drained = tokio::spawn(async move {
            let mut count = 0;
            while tokio::time::timeout(Duration::from_millis(500), healthy_rx.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                count += 1;
            }
            count
        });

        settle(&hub, |hub| hub.listener_count() == 1).await;
        let consumers = hub.consumers.lock().unwrap();
        assert!(consumers.contains_key(&healthy_id));
        drop(consumers);

        assert!(drained.await.unwrap() > 0);
        drop(slow_rx);
    }
}
