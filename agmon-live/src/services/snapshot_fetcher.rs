//! Snapshot fetcher
//!
//! One bounded read of one source, decoded into a typed snapshot. Never
//! retries and never touches session state; the aggregator decides what a
//! failure means.

use super::backend_client::Backend;
use crate::error::FetchError;
use agmon_common::events::{
    Competitor, IndexStats, Keyword, SerpResult, SourceName, StepProgressSnapshot,
    SubResourceCreationProgress,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Typed payload of one source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSnapshot {
    StepProgress(StepProgressSnapshot),
    IndexStats(IndexStats),
    Keywords(Vec<Keyword>),
    Competitors(Vec<Competitor>),
    SerpResults(Vec<SerpResult>),
    SubResourceProgress(SubResourceCreationProgress),
}

/// Keywords arrive either as bare strings or as objects
#[derive(Deserialize)]
#[serde(untagged)]
enum KeywordRepr {
    Plain(String),
    Full(Keyword),
}

impl From<KeywordRepr> for Keyword {
    fn from(repr: KeywordRepr) -> Self {
        match repr {
            KeywordRepr::Plain(keyword) => Keyword {
                keyword,
                search_volume: None,
                difficulty: None,
            },
            KeywordRepr::Full(k) => k,
        }
    }
}

impl SourceSnapshot {
    pub fn source(&self) -> SourceName {
        match self {
            SourceSnapshot::StepProgress(_) => SourceName::StepProgress,
            SourceSnapshot::IndexStats(_) => SourceName::IndexStats,
            SourceSnapshot::Keywords(_) => SourceName::Keywords,
            SourceSnapshot::Competitors(_) => SourceName::Competitors,
            SourceSnapshot::SerpResults(_) => SourceName::SerpResults,
            SourceSnapshot::SubResourceProgress(_) => SourceName::SubResourceProgress,
        }
    }

    /// Decode a raw payload for `source`
    ///
    /// List sources accept a bare array or an object wrapping it under the
    /// source's own field name.
    pub fn decode(source: SourceName, value: Value) -> Result<Self, FetchError> {
        let snapshot = match source {
            SourceName::StepProgress => {
                let snapshot = match value {
                    Value::Array(_) => StepProgressSnapshot {
                        steps: serde_json::from_value(value)?,
                    },
                    other => serde_json::from_value(other)?,
                };
                SourceSnapshot::StepProgress(snapshot)
            }
            SourceName::IndexStats => SourceSnapshot::IndexStats(unwrap_object(value, "stats")?),
            SourceName::Keywords => {
                let raw: Vec<KeywordRepr> = decode_list(value, "keywords")?;
                SourceSnapshot::Keywords(raw.into_iter().map(Keyword::from).collect())
            }
            SourceName::Competitors => {
                SourceSnapshot::Competitors(decode_list(value, "competitors")?)
            }
            SourceName::SerpResults => SourceSnapshot::SerpResults(decode_list(value, "results")?),
            SourceName::SubResourceProgress => {
                SourceSnapshot::SubResourceProgress(serde_json::from_value(value)?)
            }
        };
        Ok(snapshot)
    }
}

fn decode_list<T: DeserializeOwned>(value: Value, field: &str) -> Result<Vec<T>, FetchError> {
    match value {
        Value::Array(_) => Ok(serde_json::from_value(value)?),
        Value::Object(mut map) => match map.remove(field) {
            Some(inner) => Ok(serde_json::from_value(inner)?),
            None => Err(FetchError::malformed(format!("expected '{}' list", field))),
        },
        Value::Null => Ok(Vec::new()),
        other => Err(FetchError::malformed(format!(
            "expected '{}' list, got {}",
            field, other
        ))),
    }
}

fn unwrap_object<T: DeserializeOwned>(value: Value, field: &str) -> Result<T, FetchError> {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(field) => {
            let inner = map.remove(field).unwrap_or(Value::Null);
            Ok(serde_json::from_value(inner)?)
        }
        Value::Object(_) => Ok(serde_json::from_value(value)?),
        other => Err(FetchError::malformed(format!("expected object, got {}", other))),
    }
}

/// Fetch and decode the current snapshot of one source
///
/// Bounded by `timeout`; a timeout, non-success status or undecodable
/// payload comes back as a typed [`FetchError`].
pub async fn fetch_snapshot(
    backend: &dyn Backend,
    resource_id: &str,
    source: SourceName,
    timeout: Duration,
) -> Result<SourceSnapshot, FetchError> {
    let raw = tokio::time::timeout(timeout, backend.fetch_source(resource_id, source)).await??;
    SourceSnapshot::decode(source, raw)
}
