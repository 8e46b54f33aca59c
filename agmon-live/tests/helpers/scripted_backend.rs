//! In-process scripted backend
//!
//! Implements the `Backend` trait without any I/O so tests can run on a
//! paused clock. Every reply can be changed while a session is running.

use agmon_common::events::{ErrorKind, LogEntry, LogLevel, SourceName};
use agmon_live::services::{Backend, CreationResponse, FrameStream, LogPage};
use agmon_live::FetchError;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Scripted reply for one source
#[derive(Debug, Clone)]
pub enum SourceReply {
    Json(Value),
    Fail(ErrorKind),
    /// Never answers; the caller's timeout has to fire
    Hang,
}

pub struct ScriptedBackend {
    resource_id: String,
    submit_sync: AtomicBool,
    lookup_found_on: AtomicU32,
    lookup_calls: AtomicU32,
    sources: Mutex<HashMap<SourceName, SourceReply>>,
    source_calls: Mutex<HashMap<SourceName, u32>>,
    logs: Mutex<Vec<LogEntry>>,
    log_overlap: usize,
    live_fail_first: AtomicU32,
    live_attempts: AtomicU32,
    live_frames: Mutex<Vec<String>>,
    live_hold_open: AtomicBool,
}

impl ScriptedBackend {
    /// Backend that knows `resource_id`; lookups find it on the first call
    pub fn new(resource_id: &str) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            submit_sync: AtomicBool::new(false),
            lookup_found_on: AtomicU32::new(1),
            lookup_calls: AtomicU32::new(0),
            sources: Mutex::new(HashMap::new()),
            source_calls: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
            log_overlap: 2,
            live_fail_first: AtomicU32::new(0),
            live_attempts: AtomicU32::new(0),
            live_frames: Mutex::new(Vec::new()),
            live_hold_open: AtomicBool::new(true),
        }
    }

    /// Creation responses carry the resource id immediately
    pub fn submit_synchronously(&self, yes: bool) {
        self.submit_sync.store(yes, Ordering::SeqCst);
    }

    /// Lookups return the id from the n-th call on (`u32::MAX`: never)
    pub fn resolve_on_lookup(&self, n: u32) {
        self.lookup_found_on.store(n, Ordering::SeqCst);
    }

    pub fn lookup_calls(&self) -> u32 {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    pub fn set_source(&self, source: SourceName, reply: SourceReply) {
        self.sources.lock().unwrap().insert(source, reply);
    }

    pub fn source_calls(&self, source: SourceName) -> u32 {
        self.source_calls.lock().unwrap().get(&source).copied().unwrap_or(0)
    }

    /// Append a line to the backend's log
    pub fn push_log(&self, entry: LogEntry) {
        self.logs.lock().unwrap().push(entry);
    }

    /// Fail the first `n` connects (`u32::MAX`: every connect)
    pub fn fail_live_connects(&self, n: u32) {
        self.live_fail_first.store(n, Ordering::SeqCst);
    }

    pub fn live_attempts(&self) -> u32 {
        self.live_attempts.load(Ordering::SeqCst)
    }

    /// Frames sent on every successful connect
    pub fn set_live_frames(&self, frames: Vec<Value>) {
        *self.live_frames.lock().unwrap() = frames.into_iter().map(|f| f.to_string()).collect();
    }

    /// Whether the stream stays open after the scripted frames
    pub fn hold_live_open(&self, hold: bool) {
        self.live_hold_open.store(hold, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn submit_creation(&self, _lookup_key: &str) -> Result<CreationResponse, FetchError> {
        let resource_id = self
            .submit_sync
            .load(Ordering::SeqCst)
            .then(|| self.resource_id.clone());
        Ok(CreationResponse {
            correlation_token: "tok-1".to_string(),
            resource_id,
        })
    }

    async fn lookup_by_key(&self, _lookup_key: &str) -> Result<Option<String>, FetchError> {
        let n = self.lookup_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let found_on = self.lookup_found_on.load(Ordering::SeqCst);
        Ok((n >= found_on).then(|| self.resource_id.clone()))
    }

    async fn fetch_source(
        &self,
        resource_id: &str,
        source: SourceName,
    ) -> Result<Value, FetchError> {
        *self.source_calls.lock().unwrap().entry(source).or_insert(0) += 1;
        if resource_id != self.resource_id {
            return Err(FetchError::not_found(format!("unknown resource {}", resource_id)));
        }
        let reply = self.sources.lock().unwrap().get(&source).cloned();
        match reply {
            Some(SourceReply::Json(value)) => Ok(value),
            Some(SourceReply::Fail(kind)) => Err(FetchError::new(kind, "scripted failure")),
            Some(SourceReply::Hang) => std::future::pending().await,
            None => Err(FetchError::not_found(format!("{} not scripted", source))),
        }
    }

    async fn fetch_logs(&self, _resource_id: &str, since: Option<&str>) -> Result<LogPage, FetchError> {
        let logs = self.logs.lock().unwrap().clone();
        // Pages overlap the previous one to exercise de-duplication.
        let start = since
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0)
            .saturating_sub(self.log_overlap)
            .min(logs.len());
        Ok(LogPage {
            entries: logs[start..].to_vec(),
            next_cursor: Some(logs.len().to_string()),
        })
    }

    async fn open_live(&self, _resource_id: &str, _idle: Duration) -> Result<FrameStream, FetchError> {
        let attempt = self.live_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.live_fail_first.load(Ordering::SeqCst) {
            return Err(FetchError::network("connection refused"));
        }
        let frames: Vec<Result<String, FetchError>> =
            self.live_frames.lock().unwrap().iter().cloned().map(Ok).collect();
        let frames = stream::iter(frames);
        if self.live_hold_open.load(Ordering::SeqCst) {
            Ok(Box::pin(frames.chain(stream::pending())))
        } else {
            Ok(Box::pin(frames))
        }
    }
}

/// `{"steps": [...]}` from `(id, status, percent)` triples
pub fn steps_json(steps: &[(u32, &str, u8)]) -> Value {
    let steps: Vec<Value> = steps
        .iter()
        .map(|(id, status, percent)| {
            json!({"id": id, "name": format!("step-{}", id), "status": status, "percent": percent})
        })
        .collect();
    json!({ "steps": steps })
}

/// Log line at a fixed offset from a base instant
pub fn log_entry(secs: i64, phase: &str, message: &str) -> LogEntry {
    LogEntry {
        timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        sequence: None,
        phase: phase.to_string(),
        level: LogLevel::Info,
        message: message.to_string(),
    }
}
