//! Bootstrap configuration loading
//!
//! The TOML file carries only bootstrap concerns: where the backend lives,
//! where session state is kept, logging, and optional timing overrides for
//! the monitor. Runtime resolution (CLI → environment → TOML → built-in
//! defaults) happens in the monitor crate on top of this.
//!
//! # Config file lookup
//!
//! 1. Explicit path (command-line `--config`)
//! 2. `AGMON_CONFIG` environment variable
//! 3. `<config_dir>/agmon/agmon.toml` (e.g. `~/.config/agmon/agmon.toml`)
//! 4. None (built-in defaults)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "AGMON_CONFIG";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Base URL of the backend API (e.g. `https://api.example.com`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_url: Option<String>,

    /// Directory for persisted session state (pending creations)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Monitor timing overrides (all optional)
    #[serde(default)]
    pub monitor: MonitorOverrides,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// What to do once the identifier resolver exhausts its attempt budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicyKind {
    /// Keep looking the key up at a slower cadence
    KeepRetrying,
    /// Start a degraded session keyed by the correlation token
    UseCorrelationToken,
    /// End the session
    GiveUp,
}

/// Optional `[monitor]` table; every field falls back to a built-in default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorOverrides {
    pub request_timeout_ms: Option<u64>,
    pub resolve_max_attempts: Option<u32>,
    pub resolve_interval_ms: Option<u64>,
    pub resolution_policy: Option<ResolutionPolicyKind>,
    pub slow_retry_interval_ms: Option<u64>,
    pub give_up_after_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub push_max_failures: Option<u32>,
    pub push_base_backoff_ms: Option<u64>,
    pub push_max_backoff_ms: Option<u64>,
    pub push_idle_timeout_ms: Option<u64>,
    pub log_poll_interval_ms: Option<u64>,
    pub event_capacity: Option<usize>,
}

/// Locate the config file to load, if any
pub fn config_file_path(explicit: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    let user_config = dirs::config_dir().map(|d| d.join("agmon").join("agmon.toml"))?;
    if user_config.exists() {
        Some(user_config)
    } else {
        None
    }
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse TOML {}: {}", path.display(), e)))?;

    info!("Loaded TOML configuration from {}", path.display());
    Ok(config)
}

/// Load config using the lookup order, falling back to defaults
///
/// An explicitly named file that cannot be read is an error; a missing
/// default-location file is not.
pub fn load_or_default(explicit: Option<&Path>) -> Result<TomlConfig> {
    match config_file_path(explicit) {
        Some(path) => load_toml_config(&path),
        None => {
            debug!("No config file found, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Write TOML config atomically (temp file + rename)
///
/// On Unix the file is restricted to the owner (0600).
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Failed to serialize TOML: {}", e)))?;
    write_atomic(path, content.as_bytes())
}

/// Write bytes to `path` through a sibling temp file and a rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)) {
            warn!("Could not restrict permissions on {}: {}", tmp_path.display(), e);
        }
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(Error::Io(e));
    }

    Ok(())
}

/// Get OS-dependent default state directory
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("agmon"))
        .unwrap_or_else(|| PathBuf::from("./agmon_data"))
}
