//! Queue behavior against a stub store: ordering, dedup, eviction,
//! persistence, and the autoqueue fallback.

mod common;

use onda::queue::autoq::AutoQueue;
use onda::queue::Queue;
use onda::resource::cache::Cache;
use onda::resource::Song;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use url::Url;

struct Stack {
    queue: Arc<Queue>,
    autoq: Arc<AutoQueue>,
    cache: Arc<Cache>,
    dir: tempfile::TempDir,
}

async fn stack(autoq_enabled: bool) -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let store = common::stub_store().await;
    let cache = Cache::load(
        dir.path().join("cache.json"),
        store.clone(),
        dir.path().join("scratch"),
        128,
    )
    .await
    .unwrap();
    // Recent-window of zero keeps suggestion expectations deterministic.
    let autoq = AutoQueue::load(dir.path().join("autoq.db"), 1, 0.0, 0)
        .await
        .unwrap();
    let queue = Queue::load(
        dir.path().join("queue.json"),
        autoq.clone(),
        autoq_enabled,
        cache.clone(),
        store,
    )
    .await
    .unwrap();
    Stack {
        queue,
        autoq,
        cache,
        dir,
    }
}

#[tokio::test]
async fn duplicate_resources_collapse_to_one_entry() {
    let stack = stack(false).await;

    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;
    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;
    assert_eq!(stack.queue.len().await, 1);

    let url = Url::parse("https://youtu.be/abc123").unwrap();
    stack.queue.add_to_queue(Song::from_url(url.clone(), false)).await;
    stack.queue.add_to_queue(Song::from_url(url, false)).await;
    assert_eq!(stack.queue.len().await, 2);
}

#[tokio::test]
async fn play_next_prepends() {
    let stack = stack(false).await;

    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;
    stack.queue.play_next(Song::from_digest("/cas/Qmbbb")).await;

    let snapshot = stack.queue.get_queue().await;
    assert_eq!(snapshot[0].resource_id(), "/cas/Qmbbb");
    assert_eq!(snapshot[1].resource_id(), "/cas/Qmaaa");
}

#[tokio::test]
async fn dump_clears_everything() {
    let stack = stack(false).await;

    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;
    stack.queue.add_to_queue(Song::from_digest("/cas/Qmbbb")).await;
    stack.queue.dump().await;

    assert!(stack.queue.is_empty().await);
}

#[tokio::test]
async fn queue_file_preserves_order_and_identity() {
    let stack = stack(false).await;

    let first = Song::from_digest("/cas/Qmaaa");
    first.set_title("First");
    let second = Song::from_digest("/cas/Qmbbb");
    second.set_title("Second");
    stack.queue.add_to_queue(first).await;
    stack.queue.add_to_queue(second).await;

    let reloaded = Queue::load(
        stack.dir.path().join("queue.json"),
        stack.autoq.clone(),
        false,
        stack.cache.clone(),
        common::stub_store().await,
    )
    .await
    .unwrap();

    let snapshot = reloaded.get_queue().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].title(), "First");
    assert_eq!(snapshot[0].cas_path().as_deref(), Some("/cas/Qmaaa"));
    assert_eq!(snapshot[1].title(), "Second");
    assert_eq!(snapshot[1].cas_path().as_deref(), Some("/cas/Qmbbb"));
}

#[tokio::test]
async fn failed_downloads_are_evicted_on_render() {
    let stack = stack(false).await;

    let doomed = Song::from_url(Url::parse("https://youtu.be/doomed").unwrap(), false);
    stack.queue.add_to_queue(doomed.clone()).await;
    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;
    assert_eq!(stack.queue.len().await, 2);

    doomed.deliver(Err("provider said no".to_string()));

    let snapshot = stack.queue.get_queue().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].resource_id(), "/cas/Qmaaa");
}

#[tokio::test]
async fn empty_queue_with_autoq_off_pops_nothing() {
    let stack = stack(false).await;
    assert!(stack.queue.pop().await.is_none());
}

#[tokio::test]
async fn pop_resolves_the_head_through_the_store() {
    let stack = stack(false).await;
    stack.queue.add_to_queue(Song::from_digest("/cas/Qmaaa")).await;

    let mut popped = stack.queue.pop().await.unwrap();
    assert!(!popped.from_auto);
    assert_eq!(popped.song.cas_path().as_deref(), Some("/cas/Qmaaa"));

    let mut bytes = Vec::new();
    popped.reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"audio-Qmaaa");
    assert!(stack.queue.is_empty().await);
}

#[tokio::test]
async fn pop_steps_past_unresolvable_entries() {
    let stack = stack(false).await;

    let doomed = Song::from_url(Url::parse("https://youtu.be/doomed").unwrap(), false);
    doomed.deliver(Err("provider said no".to_string()));
    stack.queue.add_to_queue(doomed).await;
    stack.queue.add_to_queue(Song::from_digest("/cas/Qmbbb")).await;

    let popped = stack.queue.pop().await.unwrap();
    assert_eq!(popped.song.cas_path().as_deref(), Some("/cas/Qmbbb"));
}

#[tokio::test]
async fn autoqueue_supplies_the_next_track_when_empty() {
    let stack = stack(true).await;

    // Teach the chain an a -> b -> a cycle through finished plays.
    stack.queue.notify_done("/cas/a", true).await;
    stack.queue.notify_done("/cas/b", true).await;
    stack.queue.notify_done("/cas/a", true).await;

    // Just played a; the learned successor of a is b.
    let mut popped = stack.queue.pop().await.unwrap();
    assert!(popped.from_auto);
    assert_eq!(popped.song.cas_path().as_deref(), Some("/cas/b"));

    let mut bytes = Vec::new();
    popped.reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"audio-b");
}

#[tokio::test]
async fn autoqueue_with_nothing_learned_pops_nothing() {
    let stack = stack(true).await;
    assert!(stack.queue.pop().await.is_none());
}
