//! Live feed transport
//!
//! Keeps the push channel for one resource open and dispatches decoded
//! frames to the subscriber's callbacks.
//!
//! State machine:
//! ```text
//! Connecting ──ok──▶ Streaming ──drop/idle──┐
//!     │                                      ▼
//!     └──────fail──────────────────▶ Reconnecting{n} ──backoff──▶ Connecting
//!                                            │ n == max_failures
//!                                            ▼
//!                                     DegradedPolling ──unsubscribe──▶ Closed
//! ```
//! The failure count covers the whole subscription and never resets, so a
//! flapping channel still degrades. Once degraded no further connect is
//! attempted; the aggregator's polling carries the session.

use super::backend_client::{Backend, FrameStream};
use crate::config::PushSettings;
use agmon_common::events::{LiveStatusUpdate, TransportState};
use agmon_common::time::exponential_backoff;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Decoded push frame delivered through `on_update`
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    Status(LiveStatusUpdate),
    /// Job finished; the channel closes after this
    Completion { message: Option<String> },
}

/// Condition delivered through `on_error`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFeedError {
    /// Error frame from the backend; `fatal` means the job itself failed
    Remote { message: String, fatal: bool },
    /// Push abandoned after repeated failures; polling only from now on
    Degraded { failures: u32 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LiveFrame {
    #[serde(alias = "status_update", alias = "progress")]
    Status(LiveStatusUpdate),
    #[serde(alias = "completion", alias = "completed")]
    Complete {
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default = "default_fatal")]
        fatal: bool,
    },
}

fn default_fatal() -> bool {
    true
}

type UpdateFn = Arc<dyn Fn(LiveUpdate) + Send + Sync>;
type ErrorFn = Arc<dyn Fn(LiveFeedError) + Send + Sync>;

/// Push channel client
#[derive(Clone)]
pub struct LiveFeedTransport {
    backend: Arc<dyn Backend>,
    settings: PushSettings,
    connect_timeout: Duration,
}

impl LiveFeedTransport {
    pub fn new(backend: Arc<dyn Backend>, settings: PushSettings, connect_timeout: Duration) -> Self {
        Self {
            backend,
            settings,
            connect_timeout,
        }
    }

    /// Subscribe to the push channel of `resource_id`
    ///
    /// Callbacks run on the transport task and must not block. Dropping the
    /// returned handle unsubscribes.
    pub fn subscribe<U, E>(&self, resource_id: &str, on_update: U, on_error: E) -> Unsubscribe
    where
        U: Fn(LiveUpdate) + Send + Sync + 'static,
        E: Fn(LiveFeedError) + Send + Sync + 'static,
    {
        self.subscribe_with(CancellationToken::new(), resource_id, on_update, on_error)
    }

    /// Like [`subscribe`](Self::subscribe), tied to an existing token
    ///
    /// Cancelling `token` (or a parent of it) tears the subscription down.
    pub fn subscribe_with<U, E>(
        &self,
        token: CancellationToken,
        resource_id: &str,
        on_update: U,
        on_error: E,
    ) -> Unsubscribe
    where
        U: Fn(LiveUpdate) + Send + Sync + 'static,
        E: Fn(LiveFeedError) + Send + Sync + 'static,
    {
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);
        let worker = Worker {
            backend: Arc::clone(&self.backend),
            settings: self.settings,
            connect_timeout: self.connect_timeout,
            resource_id: resource_id.to_string(),
            token: token.clone(),
            state_tx,
            on_update: Arc::new(on_update),
            on_error: Arc::new(on_error),
        };
        let handle = tokio::spawn(worker.run());

        Unsubscribe {
            token,
            state_rx,
            handle: Some(handle),
        }
    }
}

/// Subscription handle
///
/// Unsubscribing is safe from any state and idempotent.
pub struct Unsubscribe {
    token: CancellationToken,
    state_rx: watch::Receiver<TransportState>,
    handle: Option<JoinHandle<()>>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Receiver for state changes
    pub fn state_watch(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Unsubscribe and wait for the transport task to finish
    pub async fn close(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Live feed task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum StreamEnd {
    /// Completion or fatal error frame
    Finished,
    Cancelled,
    Dropped(String),
}

struct Worker {
    backend: Arc<dyn Backend>,
    settings: PushSettings,
    connect_timeout: Duration,
    resource_id: String,
    token: CancellationToken,
    state_tx: watch::Sender<TransportState>,
    on_update: UpdateFn,
    on_error: ErrorFn,
}

impl Worker {
    fn set_state(&self, state: TransportState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn run(self) {
        let mut failures: u32 = 0;

        loop {
            self.set_state(TransportState::Connecting);

            let open = self.backend.open_live(&self.resource_id, self.settings.idle_timeout);
            let opened = tokio::select! {
                _ = self.token.cancelled() => break,
                r = tokio::time::timeout(self.connect_timeout, open) => r,
            };

            let reason = match opened {
                Ok(Ok(stream)) => {
                    info!(resource_id = %self.resource_id, "Live channel open");
                    self.set_state(TransportState::Streaming);
                    match self.pump(stream).await {
                        StreamEnd::Finished => break,
                        StreamEnd::Cancelled => break,
                        StreamEnd::Dropped(reason) => reason,
                    }
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("connect timed out after {:?}", self.connect_timeout),
            };

            failures += 1;
            warn!(
                resource_id = %self.resource_id,
                failures,
                max_failures = self.settings.max_failures,
                reason = %reason,
                "Live channel failed"
            );

            if failures >= self.settings.max_failures {
                info!(
                    resource_id = %self.resource_id,
                    failures,
                    "Live channel abandoned, continuing with polling"
                );
                self.set_state(TransportState::DegradedPolling);
                (self.on_error)(LiveFeedError::Degraded { failures });
                self.token.cancelled().await;
                break;
            }

            let delay = exponential_backoff(self.settings.base_backoff, self.settings.max_backoff, failures);
            self.set_state(TransportState::Reconnecting { failures });
            debug!(resource_id = %self.resource_id, "Reconnecting in {:?}", delay);

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(TransportState::Closed);
        debug!(resource_id = %self.resource_id, "Live channel closed");
    }

    async fn pump(&self, mut stream: FrameStream) -> StreamEnd {
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            let raw = match next {
                None => return StreamEnd::Dropped("stream ended".to_string()),
                Some(Err(e)) => return StreamEnd::Dropped(e.to_string()),
                Some(Ok(raw)) => raw,
            };

            match serde_json::from_str::<LiveFrame>(&raw) {
                Ok(LiveFrame::Status(update)) => (self.on_update)(LiveUpdate::Status(update)),
                Ok(LiveFrame::Complete { message }) => {
                    (self.on_update)(LiveUpdate::Completion { message });
                    return StreamEnd::Finished;
                }
                Ok(LiveFrame::Error { message, fatal }) => {
                    let message = message.unwrap_or_else(|| "unspecified backend error".to_string());
                    (self.on_error)(LiveFeedError::Remote { message, fatal });
                    if fatal {
                        return StreamEnd::Finished;
                    }
                }
                Err(e) => {
                    debug!(resource_id = %self.resource_id, error = %e, "Dropping unrecognized frame");
                }
            }
        }
    }
}
