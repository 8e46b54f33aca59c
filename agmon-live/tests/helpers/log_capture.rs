//! Log Capture Utilities for Testing
//!
//! Captures tracing output of the current thread for assertions. Tests run
//! on the current-thread runtime, so spawned session tasks log through the
//! same thread-local subscriber.

use std::sync::{Arc, Mutex};
use tracing::subscriber::DefaultGuard;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;

/// Captured log record
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct LogCapture {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl LogCapture {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.records().iter().any(|r| r.message.contains(pattern))
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.records()
            .iter()
            .filter(|r| r.message.contains(pattern))
            .count()
    }

    /// Assert at least one log matches pattern
    pub fn assert_contains(&self, pattern: &str) {
        assert!(
            self.contains(pattern),
            "Expected log matching '{}', but none found. All logs:\n{}",
            pattern,
            self.records()
                .iter()
                .map(|r| r.message.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        );
    }
}

impl<S> tracing_subscriber::Layer<S> for LogCapture
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        use tracing::field::Visit;

        struct MessageVisitor {
            message: String,
        }

        impl Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{:?}", value);
                    if self.message.starts_with('"') && self.message.ends_with('"') {
                        self.message = self.message[1..self.message.len() - 1].to_string();
                    }
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        self.records.lock().unwrap().push(LogRecord {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        });
    }
}

/// Install a capturing subscriber for the current thread
///
/// Capture stops when the guard is dropped.
pub fn capture_logs() -> (LogCapture, DefaultGuard) {
    let capture = LogCapture::default();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("agmon_live=debug,agmon_common=debug"))
        .with(capture.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (capture, guard)
}
