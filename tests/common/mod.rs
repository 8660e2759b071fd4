//! Shared test fixtures
//!
//! An in-process stub of the content-addressed store, so resolve paths can
//! be exercised end-to-end without a real store daemon.

use axum::extract::Path;
use axum::routing::{get, post};
use axum::Router;
use onda::store::StoreClient;

/// Spin up a stub store and return a client pointed at it.
///
/// `cat` serves bytes derived from the digest (`audio-<digest>`), `pin`
/// accepts everything, and `add` always lands on the same digest.
pub async fn stub_store() -> StoreClient {
    let app = Router::new()
        .route(
            "/cat/:digest",
            get(|Path(digest): Path<String>| async move { format!("audio-{digest}").into_bytes() }),
        )
        .route("/pin/:digest", post(|| async { "pinned" }))
        .route("/add", post(|| async { r#"{"digest": "Qmstub"}"# }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    StoreClient::new(&format!("http://{addr}")).unwrap()
}
