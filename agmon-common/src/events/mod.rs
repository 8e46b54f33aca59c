//! Event types for the agmon event system
//!
//! Provides the consumer-facing event enum and the EventBus that every
//! session task publishes to.

// Sub-modules (supporting types)
mod creation_types;
mod log_types;
mod progress_types;

pub use creation_types::{PendingCreation, ResolvedResource};
pub use log_types::{LogEntry, LogLevel};
pub use progress_types::{
    derive_overall_percent, AggregateProgress, Competitor, ErrorKind, IndexStats, Keyword,
    SerpResult, SourceName, Step, StepProgressSnapshot, StepStatus, SubResourceCreationProgress,
    SubResourceItem, SubResourceStatus, MAX_RECENT_SUB_RESOURCES,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Live feed transport state
///
/// Connecting → Streaming → (Reconnecting | DegradedPolling) → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransportState {
    Connecting,
    Streaming,
    /// Waiting to retry after a failed connect or a dropped stream
    Reconnecting {
        /// Failures so far in this session
        failures: u32,
    },
    /// Push channel abandoned for the rest of the session; polling only
    DegradedPolling,
    Closed,
}

impl TransportState {
    pub fn is_push_active(&self) -> bool {
        matches!(self, TransportState::Connecting | TransportState::Streaming)
    }
}

/// Status frame received on the push channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStatusUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Monitor event types
///
/// Everything the consumer observes about a session flows through this enum:
/// progress snapshots from the aggregator, live frames from the transport,
/// log lines from the tailer, and exactly one terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MonitorEvent {
    /// Creation request accepted; resource id not known yet
    CreationSubmitted {
        pending: PendingCreation,
        timestamp: DateTime<Utc>,
    },

    /// Pending creation resolved to a resource id
    ResourceResolved {
        resource: ResolvedResource,
        /// Backend lookups performed before success (0 if cached or synchronous)
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Attempt budget exhausted; still waiting under the configured policy
    ResolutionDelayed {
        pending: PendingCreation,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Aggregator round finished
    ProgressUpdated {
        resource_id: String,
        progress: AggregateProgress,
        timestamp: DateTime<Utc>,
    },

    /// Status frame from the push channel
    LiveStatus {
        resource_id: String,
        update: LiveStatusUpdate,
        timestamp: DateTime<Utc>,
    },

    /// Live feed transport changed state
    TransportStateChanged {
        resource_id: String,
        state: TransportState,
        timestamp: DateTime<Utc>,
    },

    /// New log lines, oldest first
    LogEntries {
        resource_id: String,
        entries: Vec<LogEntry>,
        timestamp: DateTime<Utc>,
    },

    /// Creation job finished successfully (terminal)
    SessionCompleted {
        resource_id: String,
        timestamp: DateTime<Utc>,
    },

    /// Creation job failed or the session was abandoned (terminal)
    SessionFailed {
        resource_id: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Consumer tore the session down
    SessionCancelled {
        resource_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// Event name for logging and SSE-style output
    pub fn event_type(&self) -> &'static str {
        match self {
            MonitorEvent::CreationSubmitted { .. } => "CreationSubmitted",
            MonitorEvent::ResourceResolved { .. } => "ResourceResolved",
            MonitorEvent::ResolutionDelayed { .. } => "ResolutionDelayed",
            MonitorEvent::ProgressUpdated { .. } => "ProgressUpdated",
            MonitorEvent::LiveStatus { .. } => "LiveStatus",
            MonitorEvent::TransportStateChanged { .. } => "TransportStateChanged",
            MonitorEvent::LogEntries { .. } => "LogEntries",
            MonitorEvent::SessionCompleted { .. } => "SessionCompleted",
            MonitorEvent::SessionFailed { .. } => "SessionFailed",
            MonitorEvent::SessionCancelled { .. } => "SessionCancelled",
        }
    }

    /// Completed or failed; at most one per resource reaches the consumer
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MonitorEvent::SessionCompleted { .. } | MonitorEvent::SessionFailed { .. }
        )
    }
}

/// One-shot gate for terminal notifications
///
/// Shared by every task of a session; only the first `try_fire` wins.
#[derive(Debug, Clone, Default)]
pub struct TerminalLatch {
    fired: Arc<AtomicBool>,
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once
    pub fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Central event distribution bus
///
/// Thin wrapper around a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest events rather than blocking publishers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MonitorEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: MonitorEvent,
    ) -> Result<usize, broadcast::error::SendError<MonitorEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }

    /// Emit a terminal event if the latch has not fired yet
    ///
    /// Returns true if the event was let through.
    pub fn emit_terminal(&self, latch: &TerminalLatch, event: MonitorEvent) -> bool {
        debug_assert!(event.is_terminal());
        if latch.try_fire() {
            self.emit_lossy(event);
            true
        } else {
            tracing::debug!(event = event.event_type(), "Suppressing duplicate terminal event");
            false
        }
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
