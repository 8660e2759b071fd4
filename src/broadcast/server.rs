//! Audio stream endpoint
//!
//! Serves the continuous MP3 broadcast: response headers for chunked
//! `audio/mpeg`, then the replay prelude, then live packets as the
//! producer ticks. A dropped connection deregisters the listener through
//! the hub's kill channel.

use super::BroadcastHub;
use crate::error::{Error, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

/// Build the single-route audio router.
pub fn router(hub: Arc<BroadcastHub>) -> Router {
    Router::new().route("/", get(stream_audio)).with_state(hub)
}

/// Serve the audio stream on `port`. Blocks for the life of the server.
pub async fn serve(hub: Arc<BroadcastHub>, port: u16) -> Result<()> {
    let app = router(hub);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("failed to bind audio port {addr}: {e}")))?;
    info!("audio stream is listening at {addr}");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Http(e.to_string()))
}

/// Deregisters the listener when its response stream is dropped.
struct Disconnect {
    hub: Arc<BroadcastHub>,
    id: String,
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        info!("listener {} disconnected", self.id);
        self.hub.kill(&self.id);
    }
}

async fn stream_audio(State(hub): State<Arc<BroadcastHub>>) -> Response {
    let (id, rx) = hub.register();
    info!("listener {id} connected");

    let prelude = hub.prelude();
    let guard = Disconnect { hub, id };

    let packets = futures::stream::iter(prelude)
        .chain(ReceiverStream::new(rx))
        .map(move |packet| {
            let _keepalive = &guard;
            Ok::<_, Infallible>(packet)
        });

    (
        [
            (header::CONTENT_TYPE, "audio/mpeg"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(packets),
    )
        .into_response()
}
