//! Audio endpoint behavior: headers, prelude replay, live packets, and
//! deregistration on disconnect.

use axum::body::Body;
use axum::http::Request;
use bytes::Bytes;
use futures::StreamExt;
use onda::broadcast::{server, BroadcastHub};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;

async fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never became true"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn listener_gets_headers_prelude_then_live_packets() {
    let hub = BroadcastHub::new(Duration::from_millis(1));
    let (tx, rx) = mpsc::channel(64);
    hub.clone().start(rx);

    // Broadcast a few packets before anyone joins.
    for i in 0..3u8 {
        tx.send(Bytes::from(vec![i; 8])).await.unwrap();
    }
    let replay_hub = hub.clone();
    wait_for(move || replay_hub.prelude().len() == 3).await;

    let app = server::router(hub.clone());
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.headers()["content-type"], "audio/mpeg");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(hub.listener_count(), 1);

    let mut body = response.into_body().into_data_stream();

    // The replay prelude comes first, in producer order.
    for expected in 0..3u8 {
        let frame = body.next().await.unwrap().unwrap();
        assert_eq!(frame[0], expected);
    }

    // Then live packets as the producer ticks.
    tx.send(Bytes::from(vec![9u8; 8])).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .expect("live packet never arrived")
        .unwrap()
        .unwrap();
    assert_eq!(frame[0], 9);

    // Dropping the response stream deregisters the listener.
    drop(body);
    tx.send(Bytes::from(vec![0u8; 8])).await.unwrap();
    tx.send(Bytes::from(vec![0u8; 8])).await.unwrap();
    let count_hub = hub.clone();
    wait_for(move || count_hub.listener_count() == 0).await;
}

#[tokio::test]
async fn two_listeners_see_the_same_packet_order() {
    let hub = BroadcastHub::new(Duration::from_millis(1));
    let (tx, rx) = mpsc::channel(64);
    hub.clone().start(rx);

    let app = server::router(hub.clone());
    let first = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let second = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(hub.listener_count(), 2);

    for i in 10..13u8 {
        tx.send(Bytes::from(vec![i; 8])).await.unwrap();
    }

    let mut first_body = first.into_body().into_data_stream();
    let mut second_body = second.into_body().into_data_stream();
    for expected in 10..13u8 {
        for body in [&mut first_body, &mut second_body] {
            let frame = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("packet never arrived")
                .unwrap()
                .unwrap();
            assert_eq!(frame[0], expected);
        }
    }
}
