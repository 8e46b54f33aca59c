//! Identifier resolver
//!
//! Turns a pending creation into a resource id by looking the lookup key up
//! at a fixed cadence. Concurrent resolvers for the same key share one
//! schedule: each attempt takes the key's lock, returns the cached id if a
//! peer already found it, and otherwise waits out the interval since the
//! last lookup before issuing its own. The backend therefore sees at most
//! one lookup per interval per key, however many callers are waiting.
//!
//! Per-key state outlives a call so that a later retry keeps the pacing and
//! a resolved id stays cached. The number of tracked keys is bounded: when
//! a new key would exceed the capacity, idle keys are evicted least
//! recently used first. Keys with a resolve in flight are never evicted.

use super::backend_client::Backend;
use crate::error::{MonitorError, MonitorResult};
use agmon_common::events::{PendingCreation, ResolvedResource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resource: ResolvedResource,
    /// Backend lookups this caller issued (0 when served from cache)
    pub lookups: u32,
}

/// Default bound on tracked lookup keys
pub const DEFAULT_TRACKED_KEYS: usize = 1024;

#[derive(Debug, Default)]
struct KeyState {
    resolved: Option<ResolvedResource>,
    last_lookup: Option<Instant>,
}

struct TrackedKey {
    state: Arc<Mutex<KeyState>>,
    touched: Instant,
}

impl TrackedKey {
    /// Only the map holds the state: no resolve in flight
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.state) == 1
    }
}

/// Resolves lookup keys to resource ids, coalescing per key
pub struct IdentifierResolver {
    backend: Arc<dyn Backend>,
    request_timeout: Duration,
    capacity: usize,
    keys: Mutex<HashMap<String, TrackedKey>>,
}

impl IdentifierResolver {
    pub fn new(backend: Arc<dyn Backend>, request_timeout: Duration) -> Self {
        Self::with_capacity(backend, request_timeout, DEFAULT_TRACKED_KEYS)
    }

    /// Resolver tracking at most `capacity` idle keys
    pub fn with_capacity(backend: Arc<dyn Backend>, request_timeout: Duration, capacity: usize) -> Self {
        Self {
            backend,
            request_timeout,
            capacity: capacity.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    async fn key_state(&self, lookup_key: &str) -> Arc<Mutex<KeyState>> {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();

        if let Some(tracked) = keys.get_mut(lookup_key) {
            tracked.touched = now;
            return Arc::clone(&tracked.state);
        }

        if keys.len() >= self.capacity {
            let mut idle: Vec<(Instant, String)> = keys
                .iter()
                .filter(|(_, t)| t.is_idle())
                .map(|(k, t)| (t.touched, k.clone()))
                .collect();
            idle.sort();
            let excess = keys.len() + 1 - self.capacity;
            let evicted = idle.len().min(excess);
            for (_, key) in idle.into_iter().take(excess) {
                keys.remove(&key);
            }
            debug!(evicted, capacity = self.capacity, "Evicted idle lookup keys");
        }

        let state = Arc::new(Mutex::new(KeyState::default()));
        keys.insert(
            lookup_key.to_string(),
            TrackedKey {
                state: Arc::clone(&state),
                touched: now,
            },
        );
        state
    }

    /// Previously resolved id for `lookup_key`, without touching the backend
    pub async fn cached(&self, lookup_key: &str) -> Option<ResolvedResource> {
        let state = {
            let keys = self.keys.lock().await;
            Arc::clone(&keys.get(lookup_key)?.state)
        };
        let guard = state.lock().await;
        guard.resolved.clone()
    }

    /// Number of lookup keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.keys.lock().await.len()
    }

    /// Resolve `pending` within `max_attempts` lookups spaced by `interval`
    ///
    /// Lookup failures (network, timeout, malformed) count as attempts and
    /// are retried on the same schedule. Exhausting the budget returns
    /// [`MonitorError::ResolutionTimeout`] carrying the pending handle.
    pub async fn resolve(
        &self,
        pending: &PendingCreation,
        max_attempts: u32,
        interval: Duration,
    ) -> MonitorResult<Resolution> {
        let key = pending.lookup_key.as_str();
        let state = self.key_state(key).await;
        let mut lookups = 0;

        for attempt in 1..=max_attempts {
            let mut guard = state.lock().await;

            if let Some(resource) = &guard.resolved {
                debug!(lookup_key = %key, resource_id = %resource.resource_id, "Resolved by cache");
                return Ok(Resolution {
                    resource: resource.clone(),
                    lookups,
                });
            }

            if let Some(last) = guard.last_lookup {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    let wait_time = interval - elapsed;
                    debug!(lookup_key = %key, "Resolver pacing: waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
            }

            guard.last_lookup = Some(Instant::now());
            lookups += 1;

            let lookup = tokio::time::timeout(self.request_timeout, self.backend.lookup_by_key(key)).await;
            match lookup {
                Ok(Ok(Some(resource_id))) => {
                    info!(
                        lookup_key = %key,
                        resource_id = %resource_id,
                        attempt,
                        "Pending creation resolved"
                    );
                    let resource = ResolvedResource::new(resource_id);
                    guard.resolved = Some(resource.clone());
                    return Ok(Resolution { resource, lookups });
                }
                Ok(Ok(None)) => {
                    debug!(lookup_key = %key, attempt, max_attempts, "Resource not visible yet");
                }
                Ok(Err(e)) => {
                    warn!(lookup_key = %key, attempt, error = %e, "Lookup failed");
                }
                Err(_) => {
                    warn!(lookup_key = %key, attempt, "Lookup timed out after {:?}", self.request_timeout);
                }
            }
        }

        Err(MonitorError::ResolutionTimeout {
            pending: pending.clone(),
            attempts: max_attempts,
        })
    }
}
