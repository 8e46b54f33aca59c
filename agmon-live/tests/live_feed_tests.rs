//! Integration tests for the live feed transport state machine

mod helpers;

use agmon_common::events::TransportState;
use agmon_live::services::{LiveFeedError, LiveUpdate};
use agmon_live::{LiveFeedTransport, PushSettings};
use helpers::{capture_logs, ScriptedBackend};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Seen<T> = Arc<Mutex<Vec<T>>>;

fn transport(backend: Arc<ScriptedBackend>) -> LiveFeedTransport {
    LiveFeedTransport::new(backend, PushSettings::default(), Duration::from_secs(10))
}

fn recorders() -> (Seen<LiveUpdate>, Seen<LiveFeedError>) {
    (Arc::new(Mutex::new(Vec::new())), Arc::new(Mutex::new(Vec::new())))
}

/// TC-LIVE-001: Repeated connect failures degrade to polling
#[tokio::test(start_paused = true)]
async fn test_five_failures_degrade_without_sixth_attempt() {
    let (logs, _guard) = capture_logs();

    // Given: a push channel that refuses every connection
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.fail_live_connects(u32::MAX);
    let (updates, errors) = recorders();
    let (u, e) = (updates.clone(), errors.clone());
    let started = Instant::now();

    // When: subscribing
    let sub = transport(backend.clone()).subscribe(
        "r-42",
        move |update| u.lock().unwrap().push(update),
        move |error| e.lock().unwrap().push(error),
    );
    let mut state = sub.state_watch();
    tokio::time::timeout(
        Duration::from_secs(120),
        state.wait_for(|s| *s == TransportState::DegradedPolling),
    )
    .await
    .unwrap()
    .unwrap();

    // Then: five attempts after backoffs of 1, 2, 4 and 8 seconds
    assert_eq!(backend.live_attempts(), 5);
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        &[LiveFeedError::Degraded { failures: 5 }]
    );
    logs.assert_contains("Live channel abandoned");

    // And: no sixth attempt, however long the session lasts
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(backend.live_attempts(), 5);
    assert_eq!(sub.state(), TransportState::DegradedPolling);
    assert!(updates.lock().unwrap().is_empty());

    // And: unsubscribing from the degraded state closes cleanly
    sub.close().await;
    assert_eq!(*state.borrow(), TransportState::Closed);
}

/// TC-LIVE-002: Frames dispatched until completion
#[tokio::test(start_paused = true)]
async fn test_frames_dispatched_and_completion_closes() {
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.set_live_frames(vec![
        json!({"type": "status", "step_id": 1, "status": "running", "percent": 20}),
        json!({"type": "ping"}),
        json!({"type": "status_update", "step_id": 1, "percent": 60}),
        json!({"type": "complete", "message": "agent ready"}),
    ]);
    let (updates, errors) = recorders();
    let (u, e) = (updates.clone(), errors.clone());

    let sub = transport(backend.clone()).subscribe(
        "r-42",
        move |update| u.lock().unwrap().push(update),
        move |error| e.lock().unwrap().push(error),
    );
    let mut state = sub.state_watch();
    state.wait_for(|s| *s == TransportState::Closed).await.unwrap();

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 3, "unknown frame must be dropped");
    assert!(matches!(&updates[0], LiveUpdate::Status(s) if s.percent == Some(20.0)));
    assert_eq!(
        updates[2],
        LiveUpdate::Completion {
            message: Some("agent ready".to_string())
        }
    );
    assert!(errors.lock().unwrap().is_empty());
    assert_eq!(backend.live_attempts(), 1);
}

/// TC-LIVE-003: Flapping channel still degrades
#[tokio::test(start_paused = true)]
async fn test_flapping_stream_counts_toward_budget() {
    // Given: every connect succeeds but the stream drops at once
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.hold_live_open(false);
    let (_, errors) = recorders();
    let e = errors.clone();

    let sub = transport(backend.clone()).subscribe("r-42", |_| {}, move |error| e.lock().unwrap().push(error));
    let mut state = sub.state_watch();
    state
        .wait_for(|s| *s == TransportState::DegradedPolling)
        .await
        .unwrap();

    // Then: the failure count never reset between successful connects
    assert_eq!(backend.live_attempts(), 5);
    assert_eq!(errors.lock().unwrap().len(), 1);
}

/// TC-LIVE-004: Unsubscribe while reconnecting
#[tokio::test(start_paused = true)]
async fn test_unsubscribe_during_backoff() {
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.fail_live_connects(u32::MAX);

    let sub = transport(backend.clone()).subscribe("r-42", |_| {}, |_| {});
    let mut state = sub.state_watch();
    state
        .wait_for(|s| matches!(s, TransportState::Reconnecting { failures: 2 }))
        .await
        .unwrap();

    drop(sub);
    state.wait_for(|s| *s == TransportState::Closed).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(backend.live_attempts(), 2);
}

/// TC-LIVE-005: Error frames
#[tokio::test(start_paused = true)]
async fn test_non_fatal_error_keeps_stream_fatal_closes_it() {
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.set_live_frames(vec![
        json!({"type": "error", "message": "serp provider slow", "fatal": false}),
        json!({"type": "status", "step_id": 3, "status": "running"}),
        json!({"type": "error", "message": "crawl failed"}),
    ]);
    let (updates, errors) = recorders();
    let (u, e) = (updates.clone(), errors.clone());

    let sub = transport(backend.clone()).subscribe(
        "r-42",
        move |update| u.lock().unwrap().push(update),
        move |error| e.lock().unwrap().push(error),
    );
    let mut state = sub.state_watch();
    state.wait_for(|s| *s == TransportState::Closed).await.unwrap();

    assert_eq!(updates.lock().unwrap().len(), 1);
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        &[
            LiveFeedError::Remote {
                message: "serp provider slow".to_string(),
                fatal: false
            },
            LiveFeedError::Remote {
                message: "crawl failed".to_string(),
                fatal: true
            },
        ]
    );
    assert_eq!(backend.live_attempts(), 1);
}

/// TC-LIVE-006: Streaming resumes after a transient failure
#[tokio::test(start_paused = true)]
async fn test_recovers_after_transient_failures() {
    let backend = Arc::new(ScriptedBackend::new("r-42"));
    backend.fail_live_connects(2);
    let started = Instant::now();

    let sub = transport(backend.clone()).subscribe("r-42", |_| {}, |_| {});
    let mut state = sub.state_watch();
    state
        .wait_for(|s| *s == TransportState::Streaming)
        .await
        .unwrap();

    assert_eq!(backend.live_attempts(), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    sub.unsubscribe();
    state.wait_for(|s| *s == TransportState::Closed).await.unwrap();
}
