//! onda - single-origin internet radio server
//!
//! Wires the subsystems together: the content store client, the URL cache
//! and its downloaders, the queue and autoqueue, the mixer, and the two
//! HTTP servers (control API and audio broadcast).

use clap::Parser;
use onda::api::auth::AuthConfig;
use onda::api::server::{self as api_server, AppContext};
use onda::broadcast::{self, BroadcastHub};
use onda::config::Args;
use onda::mixer::{self, MixerControl};
use onda::queue::autoq::AutoQueue;
use onda::queue::Queue;
use onda::resource::cache::Cache;
use onda::store::StoreClient;
use onda::transcode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long in-flight requests get to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("onda={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("onda starting...");

    // A broadcast without a transcoder is dead on arrival.
    transcode::probe()?;

    let store = StoreClient::new(&args.store_url)?;
    let cache = Cache::load(
        args.cache_file.clone(),
        store.clone(),
        args.scratch_dir.clone(),
        args.bitrate,
    )
    .await?;
    let autoq = AutoQueue::load(
        args.autoq_file.clone(),
        args.prefix_length,
        args.chainbreak_prob,
        args.recent_length,
    )
    .await?;
    autoq.spawn_autosave();
    let queue = Queue::load(
        args.queue_file.clone(),
        autoq.clone(),
        !args.disable_autoq,
        cache.clone(),
        store.clone(),
    )
    .await?;

    let mixer = MixerControl::new();
    let packets = mixer::start(queue.clone(), args.bitrate, mixer.clone())?;

    let hub = BroadcastHub::new(broadcast::PACKET_PACE);
    hub.clone().start(packets);

    let audio_hub = hub.clone();
    let audio_port = args.audio_port;
    tokio::spawn(async move {
        if let Err(e) = broadcast::server::serve(audio_hub, audio_port).await {
            error!("audio server died: {e}");
        }
    });

    let auth = AuthConfig::load(args.auth_file.as_deref())?;
    let ctx = AppContext {
        queue: queue.clone(),
        cache: cache.clone(),
        mixer,
        hub,
        auth,
    };

    let shutdown = CancellationToken::new();
    let api = tokio::spawn(api_server::serve(ctx, args.api_port, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    shutdown.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, api).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("control API exited with an error: {e}"),
        Ok(Err(e)) => warn!("control API task panicked: {e}"),
        Err(_) => warn!("shutdown grace period expired with requests in flight"),
    }

    // Final flush of queued and learned state.
    if let Err(e) = queue.save().await {
        warn!("failed to persist queue on shutdown: {e}");
    }
    if let Err(e) = cache.save().await {
        warn!("failed to persist cache on shutdown: {e}");
    }
    if let Err(e) = autoq.save().await {
        warn!("failed to persist autoqueue on shutdown: {e}");
    }

    info!("server stopped");
    Ok(())
}
