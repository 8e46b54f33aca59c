//! Runtime configuration for agmon-live
//!
//! Resolves monitor settings with CLI → ENV → TOML → built-in default
//! priority. Timing settings only come from TOML or defaults; the backend URL
//! and state directory can be overridden at every tier.

use agmon_common::config::{default_state_dir, MonitorOverrides, ResolutionPolicyKind, TomlConfig};
use agmon_common::time::millis_to_duration;
use agmon_common::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable for the backend base URL
pub const BACKEND_URL_ENV: &str = "AGMON_BACKEND_URL";
/// Environment variable for the state directory
pub const STATE_DIR_ENV: &str = "AGMON_STATE_DIR";

const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";

/// What the session does once the resolver's attempt budget is exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// Keep looking up the key at `interval`; stop after `give_up_after` if set
    KeepRetrying {
        interval: Duration,
        give_up_after: Option<Duration>,
    },
    /// Monitor the resource under the correlation token
    UseCorrelationToken,
    /// End the session with a failure
    GiveUp,
}

/// Push channel retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushSettings {
    /// Failed connections tolerated before degrading to polling for good
    pub max_failures: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Silence on an open stream longer than this counts as a drop
    pub idle_timeout: Duration,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            max_failures: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Complete monitor configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub backend_url: String,
    pub state_dir: PathBuf,
    pub log_level: String,
    /// Upper bound for any single network call
    pub request_timeout: Duration,
    pub resolve_max_attempts: u32,
    pub resolve_interval: Duration,
    pub resolution_policy: ResolutionPolicy,
    pub poll_interval: Duration,
    pub push: PushSettings,
    pub log_poll_interval: Duration,
    pub event_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            state_dir: default_state_dir(),
            log_level: "info".to_string(),
            request_timeout: Duration::from_secs(10),
            resolve_max_attempts: 20,
            resolve_interval: Duration::from_millis(1500),
            resolution_policy: ResolutionPolicy::KeepRetrying {
                interval: Duration::from_secs(10),
                give_up_after: None,
            },
            poll_interval: Duration::from_secs(3),
            push: PushSettings::default(),
            log_poll_interval: Duration::from_secs(2),
            event_capacity: 256,
        }
    }
}

/// Command-line configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend_url: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl MonitorConfig {
    /// Build the runtime configuration from all tiers
    pub fn resolve(toml_config: &TomlConfig, cli: ConfigOverrides) -> Result<Self> {
        let defaults = Self::default();

        let backend_url = resolve_backend_url(cli.backend_url, toml_config.backend_url.clone())
            .unwrap_or(defaults.backend_url);

        let state_dir = cli
            .state_dir
            .or_else(|| non_empty_env(STATE_DIR_ENV).map(PathBuf::from))
            .or_else(|| toml_config.state_dir.clone())
            .unwrap_or(defaults.state_dir);

        let log_level = cli
            .log_level
            .unwrap_or_else(|| toml_config.logging.level.clone());

        let mut config = Self {
            backend_url,
            state_dir,
            log_level,
            ..defaults
        };
        config.apply_overrides(&toml_config.monitor);
        config.validate()?;

        info!(
            backend_url = %config.backend_url,
            state_dir = %config.state_dir.display(),
            "Monitor configuration resolved"
        );
        Ok(config)
    }

    fn apply_overrides(&mut self, o: &MonitorOverrides) {
        if let Some(ms) = o.request_timeout_ms {
            self.request_timeout = millis_to_duration(ms);
        }
        if let Some(n) = o.resolve_max_attempts {
            self.resolve_max_attempts = n;
        }
        if let Some(ms) = o.resolve_interval_ms {
            self.resolve_interval = millis_to_duration(ms);
        }

        let slow_interval = o
            .slow_retry_interval_ms
            .map(millis_to_duration)
            .unwrap_or(Duration::from_secs(10));
        let give_up_after = o.give_up_after_ms.map(millis_to_duration);
        self.resolution_policy = match o.resolution_policy.unwrap_or(ResolutionPolicyKind::KeepRetrying) {
            ResolutionPolicyKind::KeepRetrying => ResolutionPolicy::KeepRetrying {
                interval: slow_interval,
                give_up_after,
            },
            ResolutionPolicyKind::UseCorrelationToken => ResolutionPolicy::UseCorrelationToken,
            ResolutionPolicyKind::GiveUp => ResolutionPolicy::GiveUp,
        };

        if let Some(ms) = o.poll_interval_ms {
            self.poll_interval = millis_to_duration(ms);
        }
        if let Some(n) = o.push_max_failures {
            self.push.max_failures = n;
        }
        if let Some(ms) = o.push_base_backoff_ms {
            self.push.base_backoff = millis_to_duration(ms);
        }
        if let Some(ms) = o.push_max_backoff_ms {
            self.push.max_backoff = millis_to_duration(ms);
        }
        if let Some(ms) = o.push_idle_timeout_ms {
            self.push.idle_timeout = millis_to_duration(ms);
        }
        if let Some(ms) = o.log_poll_interval_ms {
            self.log_poll_interval = millis_to_duration(ms);
        }
        if let Some(n) = o.event_capacity {
            self.event_capacity = n;
        }
    }

    /// Reject settings that would spin or never make progress
    pub fn validate(&self) -> Result<()> {
        let url = self.backend_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "backend_url must be an http(s) URL, got '{}'",
                self.backend_url
            )));
        }

        let durations = [
            ("request_timeout", self.request_timeout),
            ("resolve_interval", self.resolve_interval),
            ("poll_interval", self.poll_interval),
            ("push_base_backoff", self.push.base_backoff),
            ("push_idle_timeout", self.push.idle_timeout),
            ("log_poll_interval", self.log_poll_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if let ResolutionPolicy::KeepRetrying { interval, .. } = self.resolution_policy {
            if interval.is_zero() {
                return Err(Error::Config("slow_retry_interval must be greater than zero".to_string()));
            }
        }

        if self.resolve_max_attempts == 0 {
            return Err(Error::Config("resolve_max_attempts must be at least 1".to_string()));
        }
        if self.push.max_backoff < self.push.base_backoff {
            return Err(Error::Config(
                "push_max_backoff must not be smaller than push_base_backoff".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::Config("event_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// File the pending creation handle is persisted to
    pub fn pending_file(&self) -> PathBuf {
        self.state_dir.join("pending_creation.json")
    }
}

/// Resolve backend URL from CLI → ENV → TOML
fn resolve_backend_url(cli: Option<String>, toml_value: Option<String>) -> Option<String> {
    let env_value = non_empty_env(BACKEND_URL_ENV);
    let cli = cli.filter(|v| !v.trim().is_empty());
    let toml_value = toml_value.filter(|v| !v.trim().is_empty());

    let sources: Vec<&str> = [
        cli.as_ref().map(|_| "command line"),
        env_value.as_ref().map(|_| "environment"),
        toml_value.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            "Backend URL found in multiple sources: {}. Using {} (highest priority).",
            sources.join(", "),
            sources[0]
        );
    }

    cli.or(env_value).or(toml_value)
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
