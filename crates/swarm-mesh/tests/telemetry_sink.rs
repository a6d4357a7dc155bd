//! HTTP telemetry sink against a local collector.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use swarm_core::{Event, EventBus};
use swarm_mesh::HttpTelemetrySink;

#[derive(Debug, Clone)]
struct Received {
    node: String,
    api_key: Option<String>,
    body: Value,
}

/// Collector that answers with queued status codes and records every request.
#[derive(Clone, Default)]
struct Collector {
    replies: Arc<Mutex<VecDeque<StatusCode>>>,
    received: Arc<Mutex<Vec<Received>>>,
}

async fn collect(
    State(collector): State<Collector>,
    Path(node): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    collector.received.lock().push(Received {
        node,
        api_key: headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    collector
        .replies
        .lock()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

async fn spawn_collector(replies: &[StatusCode]) -> (String, Collector) {
    let collector = Collector::default();
    collector.replies.lock().extend(replies.iter().copied());
    let app = Router::new()
        .route("/api/v1/nodes/{id}/telemetry", post(collect))
        .with_state(collector.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), collector)
}

#[tokio::test]
async fn test_success_then_server_error() {
    let (url, collector) =
        spawn_collector(&[StatusCode::CREATED, StatusCode::INTERNAL_SERVER_ERROR]).await;
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let sink = HttpTelemetrySink::new(url, Some("secret".into()), Duration::from_secs(2))
        .unwrap()
        .with_event_bus(bus);

    assert!(sink.post(0xab12, json!({"uptime": 5})).await);
    assert_eq!(
        events.recv().await.unwrap(),
        Event::TelemetryDelivered { node_id: 0xab12 }
    );

    assert!(!sink.post(0xab12, json!({"uptime": 6})).await);
    match events.recv().await.unwrap() {
        Event::TelemetryFailed { node_id, reason } => {
            assert_eq!(node_id, 0xab12);
            assert!(reason.contains("500"), "reason: {reason}");
        }
        other => panic!("expected a failure event, got {other:?}"),
    }

    // One request per post: the failed report is not retried.
    let received = collector.received.lock().clone();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].node, "ab12");
    assert_eq!(received[0].api_key.as_deref(), Some("secret"));
    assert_eq!(received[0].body["uptime"], 5);
    assert_eq!(received[1].body["uptime"], 6);
}

#[tokio::test]
async fn test_api_key_header_omitted_when_unset() {
    let (url, collector) = spawn_collector(&[]).await;
    let sink = HttpTelemetrySink::new(url, None, Duration::from_secs(2)).unwrap();

    assert!(sink.post(7, json!({})).await);
    let received = collector.received.lock().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].node, "7");
    assert!(received[0].api_key.is_none());
}

#[tokio::test]
async fn test_unreachable_collector_reports_failure() {
    // Grab a free port, then close it so the connection is refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let sink = HttpTelemetrySink::new(format!("http://{addr}"), None, Duration::from_secs(2))
        .unwrap()
        .with_event_bus(bus);

    assert!(!sink.post(1, json!({})).await);
    assert!(matches!(
        events.recv().await.unwrap(),
        Event::TelemetryFailed { node_id: 1, .. }
    ));
}
