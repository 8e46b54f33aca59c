//! Creation pipeline progress type definitions
//!
//! Supporting types for the aggregate progress view: steps, per-source
//! snapshots, and the background sub-resource fan-out panel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of recent items kept in the sub-resource panel
pub const MAX_RECENT_SUB_RESOURCES: usize = 10;

/// Independent backend data source polled by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    StepProgress,
    IndexStats,
    Keywords,
    Competitors,
    SerpResults,
    SubResourceProgress,
}

impl SourceName {
    /// Every source, in polling order
    pub const ALL: [SourceName; 6] = [
        SourceName::StepProgress,
        SourceName::IndexStats,
        SourceName::Keywords,
        SourceName::Competitors,
        SourceName::SerpResults,
        SourceName::SubResourceProgress,
    ];

    /// Route segment under `/resources/{id}/`
    pub fn route(&self) -> &'static str {
        match self {
            SourceName::StepProgress => "progress",
            SourceName::IndexStats => "stats",
            SourceName::Keywords => "keywords",
            SourceName::Competitors => "competitors",
            SourceName::SerpResults => "serp-rankings",
            SourceName::SubResourceProgress => "sub-resource-progress",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceName::StepProgress => "step-progress",
            SourceName::IndexStats => "index-stats",
            SourceName::Keywords => "keywords",
            SourceName::Competitors => "competitors",
            SourceName::SerpResults => "serp-results",
            SourceName::SubResourceProgress => "sub-resource-progress",
        }
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a failed network read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    NotFound,
    Timeout,
    Malformed,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Malformed => "malformed",
        };
        f.write_str(s)
    }
}

/// Step status for the creation checklist
///
/// Transitions only move forward: pending → in_progress → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    #[serde(alias = "running", alias = "in-progress")]
    InProgress,
    #[serde(alias = "done", alias = "complete")]
    Completed,
    #[serde(alias = "error")]
    Failed,
}

impl StepStatus {
    /// Position in the forward-only ordering; completed and failed share a rank
    pub fn rank(&self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::InProgress => 1,
            StepStatus::Completed | StepStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// One step of the server-side creation pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub status: StepStatus,
    /// Step completion (0-100)
    #[serde(default, alias = "progress", deserialize_with = "percent_from_number")]
    pub percent: u8,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Step {
    pub fn new(id: u32, name: impl Into<String>, status: StepStatus, percent: u8) -> Self {
        let mut step = Self {
            id,
            name: name.into(),
            status,
            percent: percent.min(100),
            detail: None,
        };
        if step.status == StepStatus::Completed {
            step.percent = 100;
        }
        step
    }

    /// Apply one backend report for this step
    ///
    /// A report with a lower-ranked status is ignored, so `completed` never
    /// returns to `pending`. Completed forces 100%. Within the same status the
    /// percentage never decreases. Returns true if anything changed.
    pub fn advance(&mut self, reported: &Step) -> bool {
        let before = self.clone();

        if reported.status.rank() < self.status.rank() {
            tracing::debug!(
                step_id = self.id,
                current = ?self.status,
                reported = ?reported.status,
                "Ignoring regressive step status"
            );
        } else {
            if reported.status.rank() > self.status.rank() {
                self.status = reported.status;
                self.percent = reported.percent.min(100);
            } else if !self.status.is_terminal() {
                self.percent = self.percent.max(reported.percent.min(100));
            }

            if self.status == StepStatus::Completed {
                self.percent = 100;
            }

            if reported.detail.is_some() {
                self.detail = reported.detail.clone();
            }
        }

        if !reported.name.is_empty() && reported.name != self.name {
            self.name = reported.name.clone();
        }

        *self != before
    }
}

fn percent_from_number<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as u8)
        .unwrap_or(0))
}

/// Derive overall completion from step data alone
///
/// Average of per-step percentages, rounded down; 0 when there are no
/// steps. Reaches 100 only when every step is at 100.
pub fn derive_overall_percent(steps: &[Step]) -> u8 {
    if steps.is_empty() {
        return 0;
    }
    let sum: u32 = steps.iter().map(|s| u32::from(s.percent.min(100))).sum();
    let len = steps.len() as u32;
    (sum / len) as u8
}

/// `GET /resources/{id}/progress` payload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepProgressSnapshot {
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// Crawling / indexing statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexStats {
    pub pages_crawled: u64,
    pub pages_total: Option<u64>,
    pub chunks_indexed: u64,
    pub embeddings: u64,
}

/// Generated keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_volume: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,
}

/// Discovered competitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competitor {
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance: Option<f64>,
}

/// Search-ranking result for one keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerpResult {
    pub keyword: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Background fan-out job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubResourceStatus {
    #[serde(alias = "in_progress")]
    Running,
    #[serde(alias = "done", alias = "complete")]
    Completed,
}

/// One recently processed sub-resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResourceItem {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub chunks: u64,
}

/// Bulk creation of related sub-resources, tracked apart from the steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubResourceCreationProgress {
    #[serde(default)]
    pub target: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub failed: u64,
    pub status: SubResourceStatus,
    /// Most recent items, newest first, at most ten
    #[serde(default)]
    pub recent: Vec<SubResourceItem>,
}

impl SubResourceCreationProgress {
    /// Trim `recent` to the panel limit (keeps the first, newest entries)
    pub fn cap_recent(&mut self) {
        self.recent.truncate(MAX_RECENT_SUB_RESOURCES);
    }
}

/// Unified progress view for one resource
///
/// `steps` and the counters derived from them are private: they only change
/// through [`AggregateProgress::merge_steps`], which recomputes
/// `overall_percent`, `completed_count` and `total_count` in the same call.
/// Every other source keeps its last successful value when a fetch fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "AggregateProgressRepr")]
pub struct AggregateProgress {
    steps: Vec<Step>,
    overall_percent: u8,
    completed_count: usize,
    total_count: usize,
    /// Sources whose most recent fetch failed
    pub source_errors: BTreeMap<SourceName, ErrorKind>,
    pub index_stats: Option<IndexStats>,
    pub keywords: Option<Vec<Keyword>>,
    pub competitors: Option<Vec<Competitor>>,
    pub serp_results: Option<Vec<SerpResult>>,
    /// Present only while the fan-out job has a non-zero target
    pub sub_resources: Option<SubResourceCreationProgress>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Wire form; derived counters are recomputed on load
#[derive(Deserialize)]
struct AggregateProgressRepr {
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    source_errors: BTreeMap<SourceName, ErrorKind>,
    #[serde(default)]
    index_stats: Option<IndexStats>,
    #[serde(default)]
    keywords: Option<Vec<Keyword>>,
    #[serde(default)]
    competitors: Option<Vec<Competitor>>,
    #[serde(default)]
    serp_results: Option<Vec<SerpResult>>,
    #[serde(default)]
    sub_resources: Option<SubResourceCreationProgress>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<AggregateProgressRepr> for AggregateProgress {
    fn from(repr: AggregateProgressRepr) -> Self {
        let mut progress = AggregateProgress {
            source_errors: repr.source_errors,
            index_stats: repr.index_stats,
            keywords: repr.keywords,
            competitors: repr.competitors,
            serp_results: repr.serp_results,
            sub_resources: repr.sub_resources,
            updated_at: repr.updated_at,
            ..Default::default()
        };
        progress.steps = repr.steps;
        progress.steps.sort_by_key(|s| s.id);
        progress.recompute();
        progress
    }
}

impl AggregateProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn overall_percent(&self) -> u8 {
        self.overall_percent
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    /// Merge a step report into the known steps
    ///
    /// Known steps advance monotonically, new steps are inserted in id
    /// order, and steps missing from the report keep their last state.
    /// Returns true if the step view changed.
    pub fn merge_steps(&mut self, reported: &[Step]) -> bool {
        let mut changed = false;

        for report in reported {
            match self.steps.iter_mut().find(|s| s.id == report.id) {
                Some(existing) => changed |= existing.advance(report),
                None => {
                    let step = Step {
                        percent: report.percent.min(100),
                        ..report.clone()
                    };
                    let step = if step.status == StepStatus::Completed {
                        Step { percent: 100, ..step }
                    } else {
                        step
                    };
                    let pos = self.steps.partition_point(|s| s.id < step.id);
                    self.steps.insert(pos, step);
                    changed = true;
                }
            }
        }

        self.recompute();
        changed
    }

    fn recompute(&mut self) {
        self.overall_percent = derive_overall_percent(&self.steps);
        self.completed_count = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.total_count = self.steps.len();
    }

    /// Replace the sub-resource panel; a zero target hides it
    pub fn set_sub_resources(&mut self, mut progress: SubResourceCreationProgress) {
        if progress.target > 0 {
            progress.cap_recent();
            self.sub_resources = Some(progress);
        } else {
            self.sub_resources = None;
        }
    }

    pub fn record_source_error(&mut self, source: SourceName, kind: ErrorKind) {
        self.source_errors.insert(source, kind);
    }

    pub fn clear_source_error(&mut self, source: SourceName) {
        self.source_errors.remove(&source);
    }

    /// First step reported as failed, if any
    pub fn failed_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// All known steps are completed or failed, or the derived total reached 100
    pub fn is_terminal(&self) -> bool {
        if self.steps.is_empty() {
            return false;
        }
        self.overall_percent == 100 || self.steps.iter().all(|s| s.status.is_terminal())
    }
}
