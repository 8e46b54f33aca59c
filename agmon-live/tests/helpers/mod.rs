//! Test Helper Utilities
//!
//! Shared utilities for testing agmon-live

#![allow(dead_code)]

pub mod fake_server;
pub mod log_capture;
pub mod scripted_backend;

// Re-export commonly used items
pub use fake_server::{FakeServer, ServerState};
pub use log_capture::{capture_logs, LogCapture};
pub use scripted_backend::{log_entry, steps_json, ScriptedBackend, SourceReply};

use agmon_common::events::MonitorEvent;
use tokio::sync::broadcast;

/// Drain every event currently buffered on `rx`
pub fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Event type names, in order
pub fn event_types(events: &[MonitorEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}
