//! Control API server setup and routing
//!
//! Builds the Axum router over the shared application context, layers on
//! authorization, request tracing, and CORS, and serves until the shutdown
//! token fires. In-flight requests get a grace period managed by the
//! caller.

use crate::api::auth::{self, AuthConfig};
use crate::api::handlers;
use crate::broadcast::BroadcastHub;
use crate::error::{Error, Result};
use crate::mixer::MixerControl;
use crate::queue::Queue;
use crate::resource::cache::Cache;
use axum::extract::Request;
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub queue: Arc<Queue>,
    pub cache: Arc<Cache>,
    pub mixer: MixerControl,
    pub hub: Arc<BroadcastHub>,
    pub auth: Arc<AuthConfig>,
}

/// Build the control router with all routes and layers attached.
pub fn router(ctx: AppContext) -> Router {
    let auth_config = ctx.auth.clone();

    Router::new()
        .route("/api", get(handlers::index))
        .route("/api/", get(handlers::index))
        .route("/api/auth", get(handlers::auth_check))
        .route("/api/enqueue", post(handlers::enqueue))
        .route("/api/playnext", post(handlers::play_next))
        .route("/api/skip", post(handlers::skip))
        .route("/api/shuffle", post(handlers::shuffle))
        .route("/api/playing", get(handlers::playing))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(auth_config, auth::guard))
        .layer(middleware::from_fn(trace_requests))
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(ctx)
}

/// Run the control API until `shutdown` fires.
pub async fn serve(ctx: AppContext, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("failed to bind control port {addr}: {e}")))?;
    info!("control API is listening at {addr}{}", auth::BASE_PATH);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::Http(e.to_string()))
}

/// Attach a request id and log the request after it completes.
///
/// The polling endpoints would drown the log, so they're exempt.
async fn trace_requests(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(next_request_id);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_string();

    let mut response = next.run(request).await;

    if path != "/api/playing" && path != "/api/auth" {
        info!("{request_id} {method} {path} {user_agent}");
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn next_request_id() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
