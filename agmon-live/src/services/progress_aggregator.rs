//! Progress aggregator
//!
//! Owns the [`AggregateProgress`] of one resource. Each round fetches every
//! configured source concurrently and folds the results in; a failing source
//! keeps its last value and is flagged in `source_errors` until it recovers.
//! The aggregator is the only writer of its progress value; everyone else
//! sees clones published through the event bus.

use super::backend_client::Backend;
use super::snapshot_fetcher::{fetch_snapshot, SourceSnapshot};
use crate::error::{FetchError, MonitorError};
use agmon_common::events::{AggregateProgress, SourceName};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How the creation job ended, as seen from progress data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed,
    Failed(String),
}

pub struct ProgressAggregator {
    backend: Arc<dyn Backend>,
    resource_id: String,
    sources: Vec<SourceName>,
    request_timeout: Duration,
    progress: AggregateProgress,
    rounds: u64,
}

impl ProgressAggregator {
    /// Aggregator for `resource_id` polling every source
    pub fn new(backend: Arc<dyn Backend>, resource_id: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            backend,
            resource_id: resource_id.into(),
            sources: SourceName::ALL.to_vec(),
            request_timeout,
            progress: AggregateProgress::new(),
            rounds: 0,
        }
    }

    /// Restrict polling to `sources`
    pub fn with_sources(mut self, sources: &[SourceName]) -> Self {
        self.sources = sources.to_vec();
        self
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn progress(&self) -> &AggregateProgress {
        &self.progress
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Run one polling round and return the merged view
    ///
    /// Sources are fetched concurrently, each bounded by the request
    /// timeout, so one slow source never delays the others past that bound.
    pub async fn poll(&mut self) -> &AggregateProgress {
        let backend = Arc::clone(&self.backend);
        let resource_id = self.resource_id.clone();
        let timeout = self.request_timeout;

        let fetches = self.sources.iter().map(|&source| {
            let backend = Arc::clone(&backend);
            let resource_id = resource_id.clone();
            async move {
                let result = fetch_snapshot(backend.as_ref(), &resource_id, source, timeout).await;
                (source, result)
            }
        });
        let results = join_all(fetches).await;

        for (source, result) in results {
            self.apply(source, result);
        }

        self.rounds += 1;
        self.progress.updated_at = Some(Utc::now());
        debug!(
            resource_id = %self.resource_id,
            round = self.rounds,
            overall = self.progress.overall_percent(),
            failing = self.progress.source_errors.len(),
            "Aggregation round complete"
        );
        &self.progress
    }

    /// Fold one source result into the progress view
    pub fn apply(&mut self, source: SourceName, result: Result<SourceSnapshot, FetchError>) {
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if self.progress.source_errors.get(&source) != Some(&e.kind) {
                    warn!(
                        resource_id = %self.resource_id,
                        error = %e,
                        "{}, keeping last value",
                        MonitorError::SourceUnavailable {
                            source_name: source,
                            kind: e.kind,
                        }
                    );
                }
                self.progress.record_source_error(source, e.kind);
                return;
            }
        };

        if self.progress.source_errors.contains_key(&source) {
            debug!(resource_id = %self.resource_id, source = %source, "Source recovered");
        }
        self.progress.clear_source_error(source);

        match snapshot {
            SourceSnapshot::StepProgress(s) => {
                self.progress.merge_steps(&s.steps);
            }
            SourceSnapshot::IndexStats(stats) => self.progress.index_stats = Some(stats),
            SourceSnapshot::Keywords(list) => self.progress.keywords = Some(list),
            SourceSnapshot::Competitors(list) => self.progress.competitors = Some(list),
            SourceSnapshot::SerpResults(list) => self.progress.serp_results = Some(list),
            SourceSnapshot::SubResourceProgress(panel) => self.progress.set_sub_resources(panel),
        }
    }

    /// Terminal outcome once every step finished or overall reached 100
    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        if !self.progress.is_terminal() {
            return None;
        }
        Some(match self.progress.failed_step() {
            Some(step) => TerminalOutcome::Failed(match &step.detail {
                Some(detail) => format!("step {} ({}) failed: {}", step.id, step.name, detail),
                None => format!("step {} ({}) failed", step.id, step.name),
            }),
            None => TerminalOutcome::Completed,
        })
    }
}
