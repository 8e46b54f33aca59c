//! HTTP fake of the creation backend
//!
//! Serves the REST routes and the server-sent event channel on an
//! ephemeral localhost port for exercising `HttpBackend` end to end.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Shared, inspectable server state
#[derive(Default)]
pub struct ServerState {
    /// lookup key → resource id
    pub known: Mutex<HashMap<String, String>>,
    /// resource id → route segment → payload
    pub payloads: Mutex<HashMap<String, HashMap<String, Value>>>,
    pub log_entries: Mutex<Vec<Value>>,
    /// `since` parameter of every logs request
    pub log_queries: Mutex<Vec<Option<String>>>,
    pub sse_frames: Mutex<Vec<String>>,
    pub submitted: Mutex<Vec<String>>,
    pub lookup_calls: AtomicU32,
    pub live_connects: AtomicU32,
}

impl ServerState {
    pub fn set_payload(&self, resource_id: &str, route: &str, payload: Value) {
        self.payloads
            .lock()
            .unwrap()
            .entry(resource_id.to_string())
            .or_default()
            .insert(route.to_string(), payload);
    }
}

pub struct FakeServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn spawn() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/creations", post(submit))
            .route("/resources/by-key", get(lookup))
            .route("/resources/:id/logs", get(logs))
            .route("/resources/:id/:source", get(source))
            .route("/live/resources/:id", get(live))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            handle,
        }
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(State(state): State<Arc<ServerState>>, Json(body): Json<Value>) -> Json<Value> {
    let key = body["lookup_key"].as_str().unwrap_or_default().to_string();
    state.submitted.lock().unwrap().push(key);
    Json(json!({ "correlation_token": "tok-http" }))
}

async fn lookup(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.lookup_calls.fetch_add(1, Ordering::SeqCst);
    let key = params.get("key").cloned().unwrap_or_default();
    match state.known.lock().unwrap().get(&key) {
        Some(id) => Json(json!({ "resource_id": id })).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown key").into_response(),
    }
}

async fn source(
    State(state): State<Arc<ServerState>>,
    Path((id, route)): Path<(String, String)>,
) -> Response {
    let payload = state
        .payloads
        .lock()
        .unwrap()
        .get(&id)
        .and_then(|routes| routes.get(&route))
        .cloned();
    match payload {
        Some(Value::String(raw)) => (StatusCode::OK, raw).into_response(),
        Some(payload) => Json(payload).into_response(),
        None => (StatusCode::NOT_FOUND, "no such resource").into_response(),
    }
}

async fn logs(
    State(state): State<Arc<ServerState>>,
    Path(_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.log_queries.lock().unwrap().push(params.get("since").cloned());
    let entries = state.log_entries.lock().unwrap().clone();
    Json(json!({ "entries": entries, "next_cursor": entries.len().to_string() }))
}

async fn live(
    State(state): State<Arc<ServerState>>,
    Path(_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.live_connects.fetch_add(1, Ordering::SeqCst);
    let frames = state.sse_frames.lock().unwrap().clone();
    let stream = async_stream::stream! {
        for frame in frames {
            yield Ok(Event::default().data(frame));
        }
    };
    Sse::new(stream)
}
