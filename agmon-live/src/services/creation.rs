//! Creation submission
//!
//! `POST /creations` may answer before the resource exists. The outcome is
//! either the resource id or an explicit pending handle for the resolver.

use super::backend_client::Backend;
use crate::error::FetchError;
use agmon_common::events::{PendingCreation, ResolvedResource};
use std::time::Duration;
use tracing::info;

/// Result of submitting a creation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationOutcome {
    /// Backend assigned the id synchronously
    Resolved(ResolvedResource),
    /// Id not known yet; resolve by lookup key
    Pending(PendingCreation),
}

/// Submit a creation request for `lookup_key`
pub async fn submit_creation(
    backend: &dyn Backend,
    lookup_key: &str,
    timeout: Duration,
) -> Result<CreationOutcome, FetchError> {
    let lookup_key = lookup_key.trim();
    if lookup_key.is_empty() {
        return Err(FetchError::malformed("lookup key must not be empty"));
    }

    let response = tokio::time::timeout(timeout, backend.submit_creation(lookup_key)).await??;
    if response.correlation_token.is_empty() {
        return Err(FetchError::malformed("creation response without correlation token"));
    }

    let outcome = match response.resource_id.filter(|id| !id.is_empty()) {
        Some(resource_id) => {
            info!(lookup_key = %lookup_key, resource_id = %resource_id, "Creation accepted");
            CreationOutcome::Resolved(ResolvedResource::new(resource_id))
        }
        None => {
            info!(
                lookup_key = %lookup_key,
                correlation_token = %response.correlation_token,
                "Creation accepted, resource id pending"
            );
            CreationOutcome::Pending(PendingCreation::new(response.correlation_token, lookup_key))
        }
    };
    Ok(outcome)
}
