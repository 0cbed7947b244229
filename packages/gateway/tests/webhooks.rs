use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

mod common;
use common::{RecordingAdapter, TestApp};

async fn post_webhook(
    app: &axum::Router,
    name: &str,
    body: Value,
    signature: &str,
) -> (StatusCode, String) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("/webhooks/{name}"))
        .header("content-type", "application/json")
        .header("x-test-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

#[tokio::test]
async fn unknown_adapter_is_404() {
    let app = TestApp::new().await;
    let (status, _) = post_webhook(&app.app, "slack", json!({}), "valid").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_verification_is_401() {
    let adapter = RecordingAdapter::new();
    let app = TestApp::builder().adapter(adapter).build().await;
    let (status, _) = post_webhook(
        &app.app,
        "testchan",
        json!({"type": "message", "text": "hi"}),
        "forged",
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn challenge_is_echoed_verbatim() {
    let adapter = RecordingAdapter::new();
    let app = TestApp::builder().adapter(adapter).build().await;
    let (status, body) = post_webhook(
        &app.app,
        "testchan",
        json!({"type": "challenge", "challenge": "tok-123"}),
        "valid",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "tok-123");
}

#[tokio::test]
async fn message_is_acknowledged_and_reply_delivered() {
    let adapter = RecordingAdapter::new();
    let app = TestApp::builder().adapter(adapter.clone()).build().await;

    let (status, body) = post_webhook(
        &app.app,
        "testchan",
        json!({"type": "message", "text": "hello from the channel", "userId": "u7", "eventId": "evt-1"}),
        "valid",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["ok"], true);

    let reply = adapter
        .wait_for_reply(Duration::from_secs(5))
        .await
        .expect("reply delivered");
    assert_eq!(reply, "mock: hello from the channel");
    assert_eq!(*adapter.acknowledged.lock().await, 1);

    // Live events were forwarded to the adapter while the turn streamed.
    let events = adapter.events.lock().await;
    assert!(!events.is_empty());
}

#[tokio::test]
async fn duplicate_event_ids_are_dropped() {
    let adapter = RecordingAdapter::new();
    let app = TestApp::builder().adapter(adapter.clone()).build().await;

    let payload =
        json!({"type": "message", "text": "hi", "userId": "u7", "eventId": "evt-dup"});
    let (_, first) = post_webhook(&app.app, "testchan", payload.clone(), "valid").await;
    let first: Value = serde_json::from_str(&first).unwrap();
    assert!(first.get("duplicate").is_none());

    let (status, second) = post_webhook(&app.app, "testchan", payload, "valid").await;
    assert_eq!(status, StatusCode::OK);
    let second: Value = serde_json::from_str(&second).unwrap();
    assert_eq!(second["duplicate"], true);

    adapter.wait_for_reply(Duration::from_secs(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.replies.lock().await.len(), 1, "duplicate must not be processed");
}

#[tokio::test]
async fn ignored_payloads_are_acknowledged_with_ok() {
    let adapter = RecordingAdapter::new();
    let app = TestApp::builder().adapter(adapter).build().await;
    let (status, body) = post_webhook(
        &app.app,
        "testchan",
        json!({"type": "reaction_added"}),
        "valid",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["ignored"], true);
}
