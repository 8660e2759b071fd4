//! Store client operations against the stub store.

mod common;

use std::io::Write;
use tokio::io::AsyncReadExt;

#[tokio::test]
async fn add_returns_a_canonical_cas_path() {
    let store = common::stub_store().await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"some encoded audio").unwrap();

    let cas = store.add_file(file.path()).await.unwrap();
    assert_eq!(cas, "/cas/Qmstub");
}

#[tokio::test]
async fn cat_streams_the_bytes_back() {
    let store = common::stub_store().await;

    let mut reader = store.cat("/cas/Qmaaa").await.unwrap();
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"audio-Qmaaa");
}

#[tokio::test]
async fn cat_rejects_non_cas_paths() {
    let store = common::stub_store().await;
    assert!(store.cat("https://youtu.be/abc").await.is_err());
    assert!(store.cat("/cas/").await.is_err());
}

#[tokio::test]
async fn pin_is_accepted() {
    let store = common::stub_store().await;
    store.pin("/cas/Qmaaa").await.unwrap();
}

#[tokio::test]
async fn unreachable_store_surfaces_a_read_error() {
    let store = onda::store::StoreClient::new("http://127.0.0.1:1").unwrap();
    assert!(store.cat("/cas/Qmaaa").await.is_err());
}
