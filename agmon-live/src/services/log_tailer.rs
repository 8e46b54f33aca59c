//! Log tailer
//!
//! Incremental, de-duplicated reads of a resource's creation log.
//!
//! The backend's own cursor is not trusted to be exclusive: overlapping pages
//! can repeat lines that were already shown. The tailer's cursor therefore
//! carries, alongside the backend cursor, the newest timestamp emitted and
//! the identities of every line emitted at exactly that timestamp. A line is
//! new when it is younger than that timestamp, or equal to it with an
//! identity not in the boundary set. The cursor is an opaque string, so a
//! tail can be resumed later by any tailer instance.

use super::backend_client::Backend;
use crate::error::FetchError;
use agmon_common::events::LogEntry;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Opaque resume position
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogCursor(String);

impl LogCursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a cursor string previously obtained from [`LogCursor::as_str`]
    pub fn from_string(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CursorState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_ts: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    boundary: Vec<String>,
}

impl CursorState {
    fn decode(cursor: &LogCursor) -> Result<Self, FetchError> {
        if cursor.0.is_empty() {
            return Ok(Self::default());
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(cursor.0.as_bytes())
            .map_err(|e| FetchError::malformed(format!("invalid log cursor: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn encode(&self) -> LogCursor {
        // Serializing this struct cannot fail: string keys, plain values.
        let json = serde_json::to_vec(self).unwrap_or_default();
        LogCursor(URL_SAFE_NO_PAD.encode(json))
    }

    fn is_new(&self, entry: &LogEntry, identity: &str) -> bool {
        match self.last_ts {
            None => true,
            Some(last) if entry.timestamp > last => true,
            Some(last) if entry.timestamp == last => !self.boundary.iter().any(|b| b == identity),
            Some(_) => false,
        }
    }
}

/// One tail call's result
#[derive(Debug, Clone, PartialEq)]
pub struct TailPage {
    /// New entries, oldest first
    pub entries: Vec<LogEntry>,
    /// Pass to the next call to continue after these entries
    pub next_cursor: LogCursor,
}

pub struct LogTailer {
    backend: Arc<dyn Backend>,
    request_timeout: Duration,
}

impl LogTailer {
    pub fn new(backend: Arc<dyn Backend>, request_timeout: Duration) -> Self {
        Self {
            backend,
            request_timeout,
        }
    }

    /// Fetch entries after `since` (from the start when `None`)
    ///
    /// On error the caller keeps its previous cursor; nothing is lost.
    pub async fn tail(&self, resource_id: &str, since: Option<&LogCursor>) -> Result<TailPage, FetchError> {
        let mut state = match since {
            Some(cursor) => CursorState::decode(cursor)?,
            None => CursorState::default(),
        };

        let fetch = self.backend.fetch_logs(resource_id, state.backend.as_deref());
        let page = tokio::time::timeout(self.request_timeout, fetch).await??;

        let mut fetched = page.entries;
        fetched.sort_by(LogEntry::display_order);

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for entry in fetched {
            let identity = entry.identity();
            if !seen.insert(identity.clone()) || !state.is_new(&entry, &identity) {
                continue;
            }
            entries.push((entry, identity));
        }

        if let Some((newest, _)) = entries.last() {
            let newest_ts = newest.timestamp;
            if state.last_ts != Some(newest_ts) {
                state.boundary.clear();
            }
            state.last_ts = Some(newest_ts);
            state.boundary.extend(
                entries
                    .iter()
                    .filter(|(e, _)| e.timestamp == newest_ts)
                    .map(|(_, id)| id.clone()),
            );
        }
        if page.next_cursor.is_some() {
            state.backend = page.next_cursor;
        }

        debug!(resource_id = %resource_id, new_entries = entries.len(), "Log tail");
        Ok(TailPage {
            entries: entries.into_iter().map(|(e, _)| e).collect(),
            next_cursor: state.encode(),
        })
    }

    /// Endless tail at `interval`, yielding only non-empty pages
    ///
    /// Failed reads are logged and retried on the next tick from the same
    /// cursor. The stream is lazy: nothing is fetched until it is polled.
    pub fn follow(
        self: Arc<Self>,
        resource_id: String,
        since: Option<LogCursor>,
        interval: Duration,
    ) -> impl Stream<Item = TailPage> + Send {
        stream::unfold((self, since, true), move |(tailer, cursor, first)| {
            let resource_id = resource_id.clone();
            async move {
                let mut cursor = cursor;
                let mut first = first;
                loop {
                    if !first {
                        tokio::time::sleep(interval).await;
                    }
                    first = false;

                    match tailer.tail(&resource_id, cursor.as_ref()).await {
                        Ok(page) => {
                            cursor = Some(page.next_cursor.clone());
                            if !page.entries.is_empty() {
                                return Some((page, (tailer, cursor, false)));
                            }
                        }
                        Err(e) => {
                            warn!(resource_id = %resource_id, error = %e, "Log tail failed, retrying");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agmon_common::events::LogLevel;
    use chrono::TimeZone;

    fn entry(secs: i64, message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            sequence: None,
            phase: "crawl".to_string(),
            level: LogLevel::Info,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_cursor_round_trips_opaquely() {
        let state = CursorState {
            backend: Some("b-7".to_string()),
            last_ts: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            boundary: vec!["abc".to_string()],
        };
        let cursor = state.encode();
        assert!(!cursor.as_str().contains('{'));
        let resumed = LogCursor::from_string(cursor.to_string());
        assert_eq!(CursorState::decode(&resumed).unwrap(), state);
    }

    #[test]
    fn test_garbage_cursor_is_malformed() {
        let err = CursorState::decode(&LogCursor::from_string("%%%")).unwrap_err();
        assert_eq!(err.kind, agmon_common::events::ErrorKind::Malformed);
    }

    #[test]
    fn test_boundary_filters_same_timestamp_duplicates() {
        let seen = entry(5, "a");
        let state = CursorState {
            backend: None,
            last_ts: Some(seen.timestamp),
            boundary: vec![seen.identity()],
        };
        assert!(!state.is_new(&seen, &seen.identity()));
        let sibling = entry(5, "b");
        assert!(state.is_new(&sibling, &sibling.identity()));
        let older = entry(4, "c");
        assert!(!state.is_new(&older, &older.identity()));
        let newer = entry(6, "d");
        assert!(state.is_new(&newer, &newer.identity()));
    }

    #[test]
    fn test_empty_cursor_starts_from_beginning() {
        assert_eq!(
            CursorState::decode(&LogCursor::default()).unwrap(),
            CursorState::default()
        );
    }
}
