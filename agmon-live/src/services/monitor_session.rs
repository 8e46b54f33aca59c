//! Monitor session coordination
//!
//! A session follows one creation from submission to a terminal outcome:
//!
//! 1. Resolve the pending handle to a resource id (skipped when the backend
//!    answered synchronously), applying the configured policy if the
//!    resolver's budget runs out.
//! 2. Start the aggregator, the live feed and the log tailer under one
//!    cancellation token, all publishing to the event bus.
//! 3. Wait for the first terminal signal from any of them, or for the owner
//!    to cancel, then tear everything down within one request timeout.
//!
//! Whichever task sees the terminal state first fires the session's
//! [`TerminalLatch`]; only that task emits the terminal event and reports
//! the outcome, so the consumer observes exactly one.

use super::backend_client::Backend;
use super::creation::{submit_creation, CreationOutcome};
use super::identifier_resolver::IdentifierResolver;
use super::live_feed::{LiveFeedError, LiveFeedTransport, LiveUpdate};
use super::log_tailer::LogTailer;
use super::progress_aggregator::{ProgressAggregator, TerminalOutcome};
use crate::config::{MonitorConfig, ResolutionPolicy};
use crate::error::{MonitorError, MonitorResult};
use agmon_common::events::{
    EventBus, MonitorEvent, PendingCreation, ResolvedResource, TerminalLatch, TransportState,
};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where a session starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStart {
    Resolved(ResolvedResource),
    Pending(PendingCreation),
}

impl From<CreationOutcome> for SessionStart {
    fn from(outcome: CreationOutcome) -> Self {
        match outcome {
            CreationOutcome::Resolved(resource) => SessionStart::Resolved(resource),
            CreationOutcome::Pending(pending) => SessionStart::Pending(pending),
        }
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed { resource_id: String },
    Failed { resource_id: String, reason: String },
    /// Resource id never resolved; the handle is returned for a later resume
    Abandoned { pending: PendingCreation, reason: String },
    Cancelled,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

/// Entry point owning the backend, the shared resolver and the event bus
pub struct Monitor {
    config: MonitorConfig,
    backend: Arc<dyn Backend>,
    resolver: Arc<IdentifierResolver>,
    event_bus: EventBus,
}

impl Monitor {
    pub fn new(config: MonitorConfig, backend: Arc<dyn Backend>) -> Self {
        let resolver = Arc::new(IdentifierResolver::new(Arc::clone(&backend), config.request_timeout));
        let event_bus = EventBus::new(config.event_capacity);
        Self {
            config,
            backend,
            resolver,
            event_bus,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn resolver(&self) -> &Arc<IdentifierResolver> {
        &self.resolver
    }

    /// Submit a creation request and announce a pending handle
    pub async fn submit(&self, lookup_key: &str) -> MonitorResult<CreationOutcome> {
        let outcome = submit_creation(self.backend.as_ref(), lookup_key, self.config.request_timeout).await?;
        if let CreationOutcome::Pending(pending) = &outcome {
            self.event_bus.emit_lossy(MonitorEvent::CreationSubmitted {
                pending: pending.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(outcome)
    }

    /// Start monitoring
    pub fn start(&self, start: SessionStart) -> SessionHandle {
        MonitorSession::start(
            self.config.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.resolver),
            self.event_bus.clone(),
            start,
        )
    }
}

/// Owner's handle on a running session
pub struct SessionHandle {
    session_id: Uuid,
    token: CancellationToken,
    event_bus: EventBus,
    events: Option<broadcast::Receiver<MonitorEvent>>,
    join: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Request teardown; `wait` returns once every task has stopped
    pub fn cancel(&self) {
        info!(session_id = %self.session_id, "Session cancellation requested");
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Receiver created before the session started; sees every event
    ///
    /// Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<broadcast::Receiver<MonitorEvent>> {
        self.events.take()
    }

    /// Receiver for events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.event_bus.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> SessionOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(session_id = %self.session_id, "Session task ended abnormally: {}", e);
                SessionOutcome::Cancelled
            }
        }
    }
}

/// Terminal signalling shared by a session's tasks
#[derive(Clone)]
struct Terminal {
    resource_id: String,
    event_bus: EventBus,
    latch: TerminalLatch,
    done_tx: mpsc::UnboundedSender<SessionOutcome>,
}

impl Terminal {
    fn complete(&self) {
        let event = MonitorEvent::SessionCompleted {
            resource_id: self.resource_id.clone(),
            timestamp: Utc::now(),
        };
        if self.event_bus.emit_terminal(&self.latch, event) {
            info!(resource_id = %self.resource_id, "Creation completed");
            let _ = self.done_tx.send(SessionOutcome::Completed {
                resource_id: self.resource_id.clone(),
            });
        }
    }

    fn fail(&self, reason: String) {
        let event = MonitorEvent::SessionFailed {
            resource_id: Some(self.resource_id.clone()),
            reason: reason.clone(),
            timestamp: Utc::now(),
        };
        if self.event_bus.emit_terminal(&self.latch, event) {
            warn!(resource_id = %self.resource_id, "{}", MonitorError::TerminalFailure(reason.clone()));
            let _ = self.done_tx.send(SessionOutcome::Failed {
                resource_id: self.resource_id.clone(),
                reason,
            });
        }
    }

    fn report(&self, outcome: TerminalOutcome) {
        match outcome {
            TerminalOutcome::Completed => self.complete(),
            TerminalOutcome::Failed(reason) => self.fail(reason),
        }
    }
}

/// One monitoring session
pub struct MonitorSession {
    session_id: Uuid,
    config: MonitorConfig,
    backend: Arc<dyn Backend>,
    resolver: Arc<IdentifierResolver>,
    event_bus: EventBus,
    token: CancellationToken,
    latch: TerminalLatch,
}

impl MonitorSession {
    /// Spawn a session and return its handle
    pub fn start(
        config: MonitorConfig,
        backend: Arc<dyn Backend>,
        resolver: Arc<IdentifierResolver>,
        event_bus: EventBus,
        start: SessionStart,
    ) -> SessionHandle {
        let session_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let events = event_bus.subscribe();

        let session = MonitorSession {
            session_id,
            config,
            backend,
            resolver,
            event_bus: event_bus.clone(),
            token: token.clone(),
            latch: TerminalLatch::new(),
        };
        let join = tokio::spawn(session.run(start));

        SessionHandle {
            session_id,
            token,
            event_bus,
            events: Some(events),
            join,
        }
    }

    async fn run(self, start: SessionStart) -> SessionOutcome {
        info!(session_id = %self.session_id, "Monitor session started");

        let resource = match start {
            SessionStart::Resolved(resource) => {
                self.emit_resolved(&resource, 0);
                resource
            }
            SessionStart::Pending(pending) => match self.resolve(pending).await {
                Ok(resource) => resource,
                Err(outcome) => return outcome,
            },
        };

        let outcome = self.watch(resource).await;
        info!(session_id = %self.session_id, outcome = ?outcome, "Monitor session ended");
        outcome
    }

    fn emit_resolved(&self, resource: &ResolvedResource, attempts: u32) {
        self.event_bus.emit_lossy(MonitorEvent::ResourceResolved {
            resource: resource.clone(),
            attempts,
            timestamp: Utc::now(),
        });
    }

    fn cancelled(&self, resource_id: Option<String>) -> SessionOutcome {
        self.event_bus.emit_lossy(MonitorEvent::SessionCancelled {
            resource_id,
            timestamp: Utc::now(),
        });
        SessionOutcome::Cancelled
    }

    fn abandon(&self, pending: PendingCreation, reason: String) -> SessionOutcome {
        let event = MonitorEvent::SessionFailed {
            resource_id: None,
            reason: reason.clone(),
            timestamp: Utc::now(),
        };
        self.event_bus.emit_terminal(&self.latch, event);
        warn!(lookup_key = %pending.lookup_key, "Giving up on pending creation: {}", reason);
        SessionOutcome::Abandoned { pending, reason }
    }

    async fn resolve(&self, pending: PendingCreation) -> Result<ResolvedResource, SessionOutcome> {
        let first = tokio::select! {
            _ = self.token.cancelled() => return Err(self.cancelled(None)),
            r = self.resolver.resolve(
                &pending,
                self.config.resolve_max_attempts,
                self.config.resolve_interval,
            ) => r,
        };

        let exhausted = match first {
            Ok(resolution) => {
                self.emit_resolved(&resolution.resource, resolution.lookups);
                return Ok(resolution.resource);
            }
            Err(MonitorError::ResolutionTimeout { attempts, .. }) => attempts,
            Err(e) => return Err(self.abandon(pending, e.to_string())),
        };

        warn!(
            "{}",
            MonitorError::ResolutionTimeout {
                pending: pending.clone(),
                attempts: exhausted,
            }
        );
        self.event_bus.emit_lossy(MonitorEvent::ResolutionDelayed {
            pending: pending.clone(),
            attempts: exhausted,
            timestamp: Utc::now(),
        });

        match self.config.resolution_policy {
            ResolutionPolicy::GiveUp => {
                let reason = format!("resource not resolved after {} attempts", exhausted);
                Err(self.abandon(pending, reason))
            }
            ResolutionPolicy::UseCorrelationToken => {
                info!(
                    correlation_token = %pending.correlation_token,
                    "Monitoring under the correlation token"
                );
                let resource = ResolvedResource::new(pending.correlation_token.clone());
                self.emit_resolved(&resource, exhausted);
                Ok(resource)
            }
            ResolutionPolicy::KeepRetrying {
                interval,
                give_up_after,
            } => {
                let deadline = give_up_after.map(|d| Instant::now() + d);
                let mut attempts = exhausted;
                loop {
                    let result = tokio::select! {
                        _ = self.token.cancelled() => return Err(self.cancelled(None)),
                        _ = deadline_reached(deadline) => {
                            let reason = format!("resource not resolved after {} attempts", attempts);
                            return Err(self.abandon(pending.clone(), reason));
                        }
                        r = self.resolver.resolve(&pending, 1, interval) => r,
                    };
                    match result {
                        Ok(resolution) => {
                            attempts += resolution.lookups;
                            self.emit_resolved(&resolution.resource, attempts);
                            return Ok(resolution.resource);
                        }
                        Err(_) => {
                            attempts += 1;
                            debug!(lookup_key = %pending.lookup_key, attempts, "Still waiting for resource id");
                        }
                    }
                }
            }
        }
    }

    async fn watch(&self, resource: ResolvedResource) -> SessionOutcome {
        let resource_id = resource.resource_id;
        let tasks = self.token.child_token();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let terminal = Terminal {
            resource_id: resource_id.clone(),
            event_bus: self.event_bus.clone(),
            latch: self.latch.clone(),
            done_tx,
        };
        let refresh = Arc::new(Notify::new());

        let aggregator = ProgressAggregator::new(
            Arc::clone(&self.backend),
            resource_id.clone(),
            self.config.request_timeout,
        );
        let aggregator_task = tokio::spawn(run_aggregator(
            aggregator,
            self.config.poll_interval,
            Arc::clone(&refresh),
            terminal.clone(),
            tasks.child_token(),
        ));

        let tailer = Arc::new(LogTailer::new(Arc::clone(&self.backend), self.config.request_timeout));
        let log_task = tokio::spawn(run_log_tail(
            tailer,
            resource_id.clone(),
            self.config.log_poll_interval,
            self.event_bus.clone(),
            tasks.child_token(),
        ));

        let transport = LiveFeedTransport::new(
            Arc::clone(&self.backend),
            self.config.push,
            self.config.request_timeout,
        );
        let subscription = {
            let bus = self.event_bus.clone();
            let id = resource_id.clone();
            let on_update_terminal = terminal.clone();
            let on_error_terminal = terminal.clone();
            let refresh = Arc::clone(&refresh);
            transport.subscribe_with(
                tasks.child_token(),
                &resource_id,
                move |update| match update {
                    LiveUpdate::Status(update) => {
                        bus.emit_lossy(MonitorEvent::LiveStatus {
                            resource_id: id.clone(),
                            update,
                            timestamp: Utc::now(),
                        });
                        refresh.notify_one();
                    }
                    LiveUpdate::Completion { .. } => on_update_terminal.complete(),
                },
                move |error| match error {
                    LiveFeedError::Remote { message, fatal: true } => on_error_terminal.fail(message),
                    LiveFeedError::Remote { message, fatal: false } => {
                        warn!(resource_id = %on_error_terminal.resource_id, "Backend reported: {}", message);
                    }
                    LiveFeedError::Degraded { failures } => {
                        warn!(
                            resource_id = %on_error_terminal.resource_id,
                            "{}",
                            MonitorError::TransportDegraded { failures }
                        );
                    }
                },
            )
        };
        let state_task = tokio::spawn(forward_transport_states(
            subscription.state_watch(),
            self.event_bus.clone(),
            resource_id.clone(),
        ));

        // `terminal` keeps a sender alive, so recv only yields real outcomes.
        let outcome = tokio::select! {
            _ = self.token.cancelled() => None,
            outcome = done_rx.recv() => outcome,
        };
        tasks.cancel();

        let shutdown = async {
            subscription.close().await;
            let _ = aggregator_task.await;
            let _ = log_task.await;
            let _ = state_task.await;
        };
        if tokio::time::timeout(self.config.request_timeout, shutdown).await.is_err() {
            warn!(
                resource_id = %resource_id,
                "Session tasks did not stop within {:?}",
                self.config.request_timeout
            );
        }
        drop(terminal);

        match outcome {
            Some(outcome) => outcome,
            None => self.cancelled(Some(resource_id)),
        }
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_aggregator(
    mut aggregator: ProgressAggregator,
    poll_interval: std::time::Duration,
    refresh: Arc<Notify>,
    terminal: Terminal,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // A live status frame pulls the next round forward.
        let refreshed = tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => false,
            _ = refresh.notified() => true,
        };
        if refreshed {
            ticker.reset();
        }

        let progress = tokio::select! {
            _ = token.cancelled() => break,
            progress = aggregator.poll() => progress.clone(),
        };
        terminal.event_bus.emit_lossy(MonitorEvent::ProgressUpdated {
            resource_id: terminal.resource_id.clone(),
            progress,
            timestamp: Utc::now(),
        });

        if let Some(outcome) = aggregator.terminal_outcome() {
            terminal.report(outcome);
            break;
        }
    }
    debug!(resource_id = %terminal.resource_id, rounds = aggregator.rounds(), "Aggregator stopped");
}

async fn run_log_tail(
    tailer: Arc<LogTailer>,
    resource_id: String,
    interval: std::time::Duration,
    event_bus: EventBus,
    token: CancellationToken,
) {
    let pages = tailer.follow(resource_id.clone(), None, interval);
    let mut pages = Box::pin(pages);

    loop {
        let page = tokio::select! {
            _ = token.cancelled() => break,
            page = pages.next() => page,
        };
        let Some(page) = page else { break };
        event_bus.emit_lossy(MonitorEvent::LogEntries {
            resource_id: resource_id.clone(),
            entries: page.entries,
            timestamp: Utc::now(),
        });
    }
}

async fn forward_transport_states(
    mut state_rx: watch::Receiver<TransportState>,
    event_bus: EventBus,
    resource_id: String,
) {
    loop {
        let state = *state_rx.borrow_and_update();
        event_bus.emit_lossy(MonitorEvent::TransportStateChanged {
            resource_id: resource_id.clone(),
            state,
            timestamp: Utc::now(),
        });
        if state == TransportState::Closed || state_rx.changed().await.is_err() {
            break;
        }
    }
}
