//! HTTP backend tests against a local fake server
//!
//! Real sockets, real clock.

mod helpers;

use agmon_common::events::{ErrorKind, SourceName, TransportState};
use agmon_live::services::{fetch_snapshot, LiveUpdate, LogTailer, SourceSnapshot};
use agmon_live::{Backend, HttpBackend, LiveFeedTransport, PushSettings};
use futures::StreamExt;
use helpers::{log_entry, steps_json, FakeServer};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn backend(server: &FakeServer) -> Arc<HttpBackend> {
    Arc::new(HttpBackend::new(&server.base_url, TIMEOUT).unwrap())
}

/// TC-HTTP-001: Submission posts the lookup key
#[tokio::test]
async fn test_submit_creation() {
    let server = FakeServer::spawn().await;
    let backend = backend(&server);

    let response = backend.submit_creation("https://acme.test").await.unwrap();

    assert_eq!(response.correlation_token, "tok-http");
    assert_eq!(response.resource_id, None);
    assert_eq!(*server.state.submitted.lock().unwrap(), vec!["https://acme.test".to_string()]);
}

/// TC-HTTP-002: Lookup maps 404 to "not yet"
#[tokio::test]
async fn test_lookup_by_key() {
    let server = FakeServer::spawn().await;
    let backend = backend(&server);

    assert_eq!(backend.lookup_by_key("https://acme.test").await.unwrap(), None);

    server
        .state
        .known
        .lock()
        .unwrap()
        .insert("https://acme.test".to_string(), "r-42".to_string());
    assert_eq!(
        backend.lookup_by_key("https://acme.test").await.unwrap(),
        Some("r-42".to_string())
    );
    assert_eq!(server.state.lookup_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// TC-HTTP-003: Source fetch decodes and classifies errors
#[tokio::test]
async fn test_fetch_source_payloads() {
    // Given: a progress payload, a broken stats payload, nothing else
    let server = FakeServer::spawn().await;
    server.state.set_payload("r-42", "progress", steps_json(&[(1, "in_progress", 30)]));
    server.state.set_payload("r-42", "stats", json!("<html>oops</html>"));
    let backend = backend(&server);

    // Then: progress decodes
    let snapshot = fetch_snapshot(backend.as_ref(), "r-42", SourceName::StepProgress, TIMEOUT)
        .await
        .unwrap();
    match snapshot {
        SourceSnapshot::StepProgress(s) => assert_eq!(s.steps[0].percent, 30),
        other => panic!("unexpected snapshot {:?}", other),
    }

    // And: a non-JSON body is malformed, a missing route is not found
    let err = fetch_snapshot(backend.as_ref(), "r-42", SourceName::IndexStats, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Malformed);
    let err = fetch_snapshot(backend.as_ref(), "r-42", SourceName::Keywords, TIMEOUT)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
}

/// TC-HTTP-004: Log tail passes the backend cursor through
#[tokio::test]
async fn test_log_tail_over_http() {
    let server = FakeServer::spawn().await;
    server.state.log_entries.lock().unwrap().extend([
        serde_json::to_value(log_entry(0, "crawl", "crawl started")).unwrap(),
        serde_json::to_value(log_entry(1, "crawl", "12 pages")).unwrap(),
    ]);
    let tailer = LogTailer::new(backend(&server), TIMEOUT);

    let first = tailer.tail("r-42", None).await.unwrap();
    assert_eq!(first.entries.len(), 2);

    // The fake ignores `since` and repeats everything; nothing is new
    let second = tailer.tail("r-42", Some(&first.next_cursor)).await.unwrap();
    assert!(second.entries.is_empty());

    assert_eq!(
        *server.state.log_queries.lock().unwrap(),
        vec![None, Some("2".to_string())]
    );
}

/// TC-HTTP-005: Server-sent frames arrive in order
#[tokio::test]
async fn test_open_live_yields_frames() {
    let server = FakeServer::spawn().await;
    server.state.sse_frames.lock().unwrap().extend([
        json!({"type": "status", "step_id": 1, "percent": 10}).to_string(),
        json!({"type": "complete"}).to_string(),
    ]);
    let backend = backend(&server);

    let stream = backend.open_live("r-42", Duration::from_secs(5)).await.unwrap();
    let frames: Vec<String> = stream.map(|f| f.unwrap()).collect().await;

    assert_eq!(frames.len(), 2);
    assert!(frames[0].contains("\"status\""));
    assert!(frames[1].contains("\"complete\""));
}

/// TC-HTTP-006: Transport over HTTP until completion
#[tokio::test]
async fn test_transport_over_http() {
    // Given: a channel sending one status then completion
    let server = FakeServer::spawn().await;
    server.state.sse_frames.lock().unwrap().extend([
        json!({"type": "progress", "step_id": 2, "percent": 80}).to_string(),
        json!({"type": "completed", "message": "done"}).to_string(),
    ]);
    let transport = LiveFeedTransport::new(backend(&server), PushSettings::default(), TIMEOUT);
    let updates = Arc::new(Mutex::new(Vec::new()));

    // When: subscribing
    let sink = Arc::clone(&updates);
    let subscription = transport.subscribe("r-42", move |u| sink.lock().unwrap().push(u), |_| {});
    let mut states = subscription.state_watch();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == TransportState::Closed))
        .await
        .unwrap()
        .unwrap();

    // Then: both frames delivered on a single connection
    let updates = updates.lock().unwrap().clone();
    assert_eq!(updates.len(), 2);
    assert!(matches!(updates[0], LiveUpdate::Status(ref s) if s.step_id == Some(2)));
    assert_eq!(
        updates[1],
        LiveUpdate::Completion {
            message: Some("done".to_string())
        }
    );
    assert_eq!(server.state.live_connects.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// TC-HTTP-007: Unreachable backend
#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    let backend = HttpBackend::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
    let err = backend.lookup_by_key("https://acme.test").await.unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Network | ErrorKind::Timeout));
}
