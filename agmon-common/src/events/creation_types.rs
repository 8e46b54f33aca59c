//! Creation handle type definitions
//!
//! A creation request may return before the backend has assigned a resource
//! id. The pending handle is an explicit, serializable value so the session
//! owner can persist it and pick the session up again later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Submitted creation whose resource id is not yet known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCreation {
    /// Submission correlation token returned by `POST /creations`
    pub correlation_token: String,
    /// Human-given key the backend can be queried by (e.g. a site URL)
    pub lookup_key: String,
    pub submitted_at: DateTime<Utc>,
}

impl PendingCreation {
    pub fn new(correlation_token: impl Into<String>, lookup_key: impl Into<String>) -> Self {
        Self {
            correlation_token: correlation_token.into(),
            lookup_key: lookup_key.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Resource id the rest of the session is keyed by
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResource {
    pub resource_id: String,
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedResource {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            resolved_at: Utc::now(),
        }
    }
}
