//! Error type shared by the agmon crates
//!
//! Covers the local side only: config files, the state directory and JSON
//! persistence. Network failures are classified separately by the monitor.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Reading or writing a config or state file failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file unreadable, unparsable or out of range
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted JSON (pending creation handle) could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
