//! Creation log type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Log line severity as shown in the scrolling log view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Error,
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_ascii_lowercase().as_str() {
            "success" | "ok" => LogLevel::Success,
            "error" | "fatal" => LogLevel::Error,
            // info, warning, debug and anything unrecognized
            _ => LogLevel::Info,
        })
    }
}

/// Append-only log line produced by the creation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub phase: String,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Stable identity: hash of timestamp, phase and message
    ///
    /// The same line returned by overlapping backend pages hashes the same.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_rfc3339().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.phase.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.message.as_bytes());
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Oldest-first ordering with a deterministic tiebreak
    ///
    /// Timestamp, then sequence (when present), then identity.
    pub fn display_order(a: &LogEntry, b: &LogEntry) -> Ordering {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.sequence.cmp(&b.sequence))
            .then_with(|| a.identity().cmp(&b.identity()))
    }
}
