//! Service modules for the creation monitor
//!
//! Each component owns one concern and reports into the session's EventBus:
//! - `identifier_resolver`: pending creation → resource id
//! - `snapshot_fetcher`: one bounded read of one source
//! - `progress_aggregator`: merged progress view (single writer)
//! - `live_feed`: push channel state machine
//! - `log_tailer`: de-duplicated, resumable log stream
//! - `monitor_session`: wires the above together per resource

pub mod backend_client;
pub mod creation;
pub mod identifier_resolver;
pub mod live_feed;
pub mod log_tailer;
pub mod monitor_session;
pub mod pending_store;
pub mod progress_aggregator;
pub mod snapshot_fetcher;

pub use backend_client::{Backend, CreationResponse, FrameStream, HttpBackend, LogPage};
pub use creation::{submit_creation, CreationOutcome};
pub use identifier_resolver::{IdentifierResolver, Resolution};
pub use live_feed::{LiveFeedError, LiveFeedTransport, LiveUpdate, Unsubscribe};
pub use log_tailer::{LogCursor, LogTailer, TailPage};
pub use monitor_session::{Monitor, MonitorSession, SessionHandle, SessionOutcome, SessionStart};
pub use pending_store::PendingStore;
pub use progress_aggregator::{ProgressAggregator, TerminalOutcome};
pub use snapshot_fetcher::{fetch_snapshot, SourceSnapshot};
