//! agmon-live library interface
//!
//! Live monitor for the server-side agent creation pipeline: resolves a
//! submitted creation to its resource id, aggregates progress from several
//! backend sources, follows the push channel with fallback to polling, and
//! tails the creation log. Exposed as a library for integration testing.

pub mod config;
pub mod error;
pub mod services;

pub use crate::config::{ConfigOverrides, MonitorConfig, PushSettings, ResolutionPolicy};
pub use crate::error::{FetchError, MonitorError, MonitorResult};
pub use crate::services::{
    Backend, HttpBackend, IdentifierResolver, LiveFeedTransport, LogTailer, Monitor,
    MonitorSession, ProgressAggregator, SessionHandle, SessionOutcome, SessionStart,
};
