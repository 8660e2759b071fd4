//! HTTP request handlers
//!
//! Implements the control endpoints: queueing in both positions, skip,
//! shuffle, the now-playing report, and the auth canary.

use crate::api::auth::BASE_PATH;
use crate::api::server::AppContext;
use crate::resource::SongRecord;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

#[derive(Debug, Deserialize)]
pub struct QueueParams {
    #[serde(default)]
    song: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthCheckParams {
    #[serde(default)]
    route: String,
}

#[derive(Debug, Serialize)]
pub struct PlayingResponse {
    #[serde(rename = "currentSong")]
    pub current_song: SongRecord,
    pub upcoming: Vec<SongRecord>,
    pub dj: String,
    #[serde(rename = "listenerCount")]
    pub listener_count: usize,
}

enum Placement {
    Append,
    Front,
}

pub async fn index() -> impl IntoResponse {
    Json(json!({
        "message": "This is the onda control API. Documentation on routes is in the project README."
    }))
}

pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found. Doublecheck your query or take a look at the docs."
        })),
    )
}

/// Reports whether the caller's token may hit a given route.
pub async fn auth_check(
    State(ctx): State<AppContext>,
    Query(params): Query<AuthCheckParams>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let route = format!("{BASE_PATH}{}", params.route);

    if ctx.auth.validate(token, &route) {
        StatusCode::OK.into_response()
    } else {
        StatusCode::FORBIDDEN.into_response()
    }
}

pub async fn enqueue(
    State(ctx): State<AppContext>,
    Query(params): Query<QueueParams>,
) -> Response {
    queue_song(ctx, params, Placement::Append).await
}

pub async fn play_next(
    State(ctx): State<AppContext>,
    Query(params): Query<QueueParams>,
) -> Response {
    queue_song(ctx, params, Placement::Front).await
}

async fn queue_song(ctx: AppContext, params: QueueParams, placement: Placement) -> Response {
    let Some(resource) = params.song.filter(|song| !song.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "/enqueue and /playnext expect a song resource identifier, \
                          e.g. /api/enqueue?song=https://youtu.be/N8nGig78lNs"
            })),
        )
            .into_response();
    };
    if resource.len() < 6 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "song identifier should be at least 6 characters" })),
        )
            .into_response();
    }

    // Start urgent when the queue is dry: the broadcast would otherwise sit
    // silent until the store add finishes.
    let urgent = ctx.queue.is_empty().await;
    let song = match ctx.cache.lookup(&resource, urgent).await {
        Ok(song) => song,
        Err(e) => {
            error!("failed to enqueue {resource}: {e}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to enqueue resource" })),
            )
                .into_response();
        }
    };

    if let Some(title) = params.title.filter(|title| !title.is_empty()) {
        song.set_title(title);
    }

    match placement {
        Placement::Append => ctx.queue.add_to_queue(song.clone()).await,
        Placement::Front => ctx.queue.play_next(song.clone()).await,
    }

    Json(json!({
        "message": "successfully added",
        "track": song.to_record(),
    }))
    .into_response()
}

pub async fn skip(State(ctx): State<AppContext>) -> impl IntoResponse {
    // The mixer owns skipping, not the queue; the track being aborted is
    // already out of the queue's hands.
    ctx.mixer.skip();
    Json(json!({ "message": "song skipped successfully" }))
}

pub async fn shuffle(State(ctx): State<AppContext>) -> impl IntoResponse {
    ctx.queue.shuffle();
    ctx.mixer.skip();
    Json(json!({ "message": "autoqueue shuffled successfully" }))
}

pub async fn playing(State(ctx): State<AppContext>) -> impl IntoResponse {
    let upcoming = ctx
        .queue
        .get_queue()
        .await
        .iter()
        .map(|song| song.to_record())
        .collect();

    Json(PlayingResponse {
        current_song: ctx.mixer.now_playing(),
        upcoming,
        dj: String::new(),
        listener_count: ctx.hub.listener_count(),
    })
}
