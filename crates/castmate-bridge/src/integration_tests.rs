//! Integration tests for the bridge
//!
//! HTTP routes are exercised with `oneshot` against the router. The WebSocket
//! tests bind a real listener and connect with the reconnecting client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use castmate_rpc::{CallPolicy, ChannelTransport, Envelope, MethodNames};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::client::{BridgeClient, overlay_url};
use crate::hub::HostHub;
use crate::server::build_app;
use crate::store::HostState;

fn build_test_hub() -> HostHub {
    HostHub::new(HostState::new(), MethodNames::default(), CallPolicy::default()).unwrap()
}

/// Serve `hub` on an ephemeral port
async fn spawn_server(hub: HostHub) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_app(hub);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_put_state() {
    let hub = build_test_hub();
    let app = build_app(hub.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/state/obs/scene")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"name":"Main"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(hub.state().get("obs", "scene"), json!({"name": "Main"}));
}

#[tokio::test]
async fn test_get_state() {
    let hub = build_test_hub();
    hub.state().set("twitch", "viewers", json!(321));
    let app = build_app(hub);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/state/twitch/viewers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!(321));
}

#[tokio::test]
async fn test_put_state_rejects_bad_json() {
    let app = build_app(build_test_hub());

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/state/obs/scene")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_put_overlay_config_reaches_new_socket() {
    let hub = build_test_hub();
    let app = build_app(hub.clone());

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/overlays/ov1/config")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"widgets":[{"id":"timer-1"}]}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (transport, mut rx) = ChannelTransport::new();
    hub.connect("ov1", Arc::new(transport));
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match Envelope::decode(&frame).unwrap() {
        Envelope::Request { name, args, .. } => {
            assert_eq!(name, "setConfig");
            assert_eq!(args, vec![json!({"widgets": [{"id": "timer-1"}]})]);
        }
        other => panic!("expected request, got {:?}", other),
    }
}

#[tokio::test]
async fn test_call_widget_without_sockets_is_empty() {
    let app = build_app(build_test_hub());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/overlays/ov1/widgets/timer-1/remaining")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("[]"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value, json!([]));
}

#[tokio::test]
async fn test_broadcast_accepted() {
    let app = build_app(build_test_hub());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/broadcast/alert")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"["follow"]"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_ws_without_overlay_rejected() {
    let addr = spawn_server(build_test_hub()).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        Err(e) => panic!("expected HTTP rejection, got {}", e),
        Ok(_) => panic!("upgrade without overlay id should fail"),
    }
}

#[tokio::test]
async fn test_live_state_round_trip() {
    let hub = build_test_hub();
    hub.state().set("obs", "scene", json!("Main"));
    hub.set_overlay_config("ov1", json!({"name": "Alerts"}));
    let addr = spawn_server(hub.clone()).await;

    let client = BridgeClient::new(MethodNames::default(), CallPolicy::default()).unwrap();
    assert_eq!(client.state().acquire_state("obs", "scene"), None);
    let mut config = client.widgets().config();

    let cancel = CancellationToken::new();
    let runner = client.clone();
    let url = overlay_url(&format!("ws://{}/ws", addr), "ov1");
    let stop = cancel.clone();
    let task = tokio::spawn(async move {
        runner.run(&url, Duration::from_millis(50), stop).await;
    });

    // Replayed acquire returns the current host value
    eventually("initial value", || {
        client.state().get("obs", "scene") == Some(json!("Main"))
    })
    .await;

    // Host-side changes are pushed
    hub.state().set("obs", "scene", json!("Intermission"));
    eventually("pushed value", || {
        client.state().get("obs", "scene") == Some(json!("Intermission"))
    })
    .await;

    // The overlay's config arrived on connect
    tokio::time::timeout(Duration::from_secs(2), config.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*config.borrow(), json!({"name": "Alerts"}));

    cancel.cancel();
    task.await.unwrap();
    eventually("host cleanup", || hub.connection_count() == 0).await;
}

#[tokio::test]
async fn test_widget_calls_both_directions() {
    let hub = build_test_hub();
    hub.handle_widget_rpc("whoami", |overlay, from, _| async move {
        Ok(json!(format!("{from}@{overlay}")))
    })
    .unwrap();
    let addr = spawn_server(hub.clone()).await;

    let client = BridgeClient::new(MethodNames::default(), CallPolicy::default()).unwrap();
    client
        .widgets()
        .register_rpc("timer-1", "remaining", |_| async { Ok(json!(30)) })
        .unwrap();

    let cancel = CancellationToken::new();
    let runner = client.clone();
    let url = overlay_url(&format!("ws://{}/ws", addr), "ov1");
    let stop = cancel.clone();
    let task = tokio::spawn(async move {
        runner.run(&url, Duration::from_millis(50), stop).await;
    });
    eventually("overlay connected", || hub.overlay_sockets("ov1") == 1).await;

    let results = hub.call_widget("ov1", "timer-1", "remaining", vec![]).await;
    assert_eq!(results, vec![json!(30)]);

    let reply = client
        .widgets()
        .call_rpc("timer-1", "whoami", vec![])
        .await
        .unwrap();
    assert_eq!(reply, json!("timer-1@ov1"));

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_client_reconnects_and_replays() {
    let hub = build_test_hub();
    hub.state().set("obs", "streaming", json!(false));

    // Reserve a port, then start the host on it only after the client is trying
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = BridgeClient::new(MethodNames::default(), CallPolicy::default()).unwrap();
    client.state().acquire_state("obs", "streaming");

    let cancel = CancellationToken::new();
    let runner = client.clone();
    let url = overlay_url(&format!("ws://{}/ws", addr), "ov1");
    let stop = cancel.clone();
    let task = tokio::spawn(async move {
        runner.run(&url, Duration::from_millis(50), stop).await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.state().get("obs", "streaming"), None);

    let listener = TcpListener::bind(addr).await.unwrap();
    let app = build_app(hub.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    eventually("value after host came up", || {
        client.state().get("obs", "streaming") == Some(json!(false))
    })
    .await;
    assert_eq!(client.state().ref_count("obs", "streaming"), 1);

    cancel.cancel();
    task.await.unwrap();
}
