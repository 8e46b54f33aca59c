//! # agmon Common Library
//!
//! Shared code for the agent creation monitor:
//! - Data model for creation handles, step progress, per-source snapshots and logs
//! - Event types (MonitorEvent enum) and the EventBus
//! - Bootstrap configuration loading
//! - Utility functions

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
