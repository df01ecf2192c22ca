use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::clienv;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub storage: StorageSection,
    pub security: SecuritySection,
    pub fetch: FetchSection,
    pub supervisor: SupervisorSection,
    pub logging: LoggingSection,
    pub events: EventsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonSection {
    pub socket_path: PathBuf,
    /// Octal permission bits applied to the socket file.
    pub socket_mode: u32,
    /// Group given ownership of the socket, when it exists.
    pub socket_group: Option<String>,
    pub pid_file: PathBuf,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/pandemic.sock"),
            socket_mode: 0o660,
            socket_group: Some("pandemic".to_string()),
            pid_file: PathBuf::from("/var/run/pandemic.pid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSection {
    pub infections_dir: PathBuf,
    pub state_dir: PathBuf,
    pub unit_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            infections_dir: PathBuf::from("/opt/pandemic/infections"),
            state_dir: PathBuf::from("/var/lib/pandemic"),
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct SecuritySection {
    /// Source URI prefixes permitted for install. Empty allows everything.
    pub allowed_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchSection {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_secs: u64,
    pub github_base_url: String,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            attempt_timeout_secs: 60,
            github_base_url: "https://github.com".to_string(),
        }
    }
}

impl FetchSection {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Delay before retry number `retry` (0-based): initial * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorSection {
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Supervisor-reported restarts tolerated before the infection is failed.
    pub restart_threshold: u32,
    pub reconcile_interval_secs: u64,
    /// Uptime after which a running unit counts as healthy and its restart
    /// counter stops accumulating toward the threshold.
    pub healthy_uptime_secs: u64,
    pub user_prefix: String,
    pub group: String,
    pub command_timeout_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            start_timeout_secs: 30,
            stop_timeout_secs: 30,
            poll_interval_ms: 500,
            restart_threshold: 5,
            reconcile_interval_secs: 10,
            healthy_uptime_secs: 60,
            user_prefix: "pandemic-".to_string(),
            group: "pandemic".to_string(),
            command_timeout_secs: 30,
        }
    }
}

impl SupervisorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// Emit JSON lines instead of the human formatter.
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsSection {
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, falling back to defaults when the file is absent,
    /// then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "Config file does not exist, using defaults");
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Some(p) = clienv::socket_path() {
            self.daemon.socket_path = p;
        }
        if let Some(p) = clienv::pid_file() {
            self.daemon.pid_file = p;
        }
        if let Some(p) = clienv::state_dir() {
            self.storage.state_dir = p;
        }
        if let Some(p) = clienv::infections_dir() {
            self.storage.infections_dir = p;
        }
        if let Some(p) = clienv::unit_dir() {
            self.storage.unit_dir = p;
        }
        if let Some(level) = clienv::log_level() {
            self.logging.level = level;
        }
        if let Some(enabled) = clienv::events_enabled() {
            self.events.enabled = enabled;
        }
    }

    /// Every violation found, empty when the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, path) in [
            ("daemon.socket_path", &self.daemon.socket_path),
            ("daemon.pid_file", &self.daemon.pid_file),
            ("storage.infections_dir", &self.storage.infections_dir),
            ("storage.state_dir", &self.storage.state_dir),
            ("storage.unit_dir", &self.storage.unit_dir),
        ] {
            if path.as_os_str().is_empty() {
                errors.push(format!("{name} cannot be empty"));
            } else if !path.is_absolute() {
                errors.push(format!("{name} must be an absolute path: {}", path.display()));
            }
        }

        if self.daemon.socket_mode > 0o777 {
            errors.push(format!(
                "daemon.socket_mode is not a permission mode: {:o}",
                self.daemon.socket_mode
            ));
        }
        if self.fetch.attempts == 0 {
            errors.push("fetch.attempts must be at least 1".to_string());
        }
        if self.fetch.attempt_timeout_secs == 0 {
            errors.push("fetch.attempt_timeout_secs must be positive".to_string());
        }
        if self.supervisor.start_timeout_secs == 0 || self.supervisor.stop_timeout_secs == 0 {
            errors.push("supervisor start/stop timeouts must be positive".to_string());
        }
        if self.supervisor.poll_interval_ms == 0 {
            errors.push("supervisor.poll_interval_ms must be positive".to_string());
        }
        if self.supervisor.user_prefix.is_empty() || self.supervisor.user_prefix.len() > 16 {
            errors.push("supervisor.user_prefix must be 1-16 characters".to_string());
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            errors.push(format!("Invalid logging.level: {}", self.logging.level));
        }
        if self.events.capacity == 0 {
            errors.push("events.capacity must be positive".to_string());
        }

        errors
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage.state_dir.join("state.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.storage.state_dir.join("staging")
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            allowed_sources: self.security.allowed_sources.clone(),
            restart_threshold: self.supervisor.restart_threshold,
            start_timeout_secs: self.supervisor.start_timeout_secs,
            stop_timeout_secs: self.supervisor.stop_timeout_secs,
        }
    }
}

/// Settings that `setConfig` may change while the daemon runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub allowed_sources: Vec<String>,
    pub restart_threshold: u32,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
}

/// Runtime settings shared between the router and the components that read them.
pub type SharedSettings = Arc<RwLock<RuntimeSettings>>;

pub fn shared(settings: RuntimeSettings) -> SharedSettings {
    Arc::new(RwLock::new(settings))
}

/// Copy of the current settings.
pub fn snapshot(settings: &SharedSettings) -> RuntimeSettings {
    settings
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Partial update accepted by `setConfig`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeSettingsPatch {
    pub allowed_sources: Option<Vec<String>>,
    pub restart_threshold: Option<u32>,
    pub start_timeout_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
}

impl RuntimeSettings {
    /// Apply `patch` if every field is acceptable; otherwise leave `self`
    /// untouched and list the problems.
    pub fn apply(&mut self, patch: RuntimeSettingsPatch) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if patch.start_timeout_secs == Some(0) {
            errors.push("startTimeoutSecs must be positive".to_string());
        }
        if patch.stop_timeout_secs == Some(0) {
            errors.push("stopTimeoutSecs must be positive".to_string());
        }
        if let Some(sources) = &patch.allowed_sources {
            if sources.iter().any(|s| s.trim().is_empty()) {
                errors.push("allowedSources entries cannot be empty".to_string());
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        if let Some(sources) = patch.allowed_sources {
            self.allowed_sources = sources;
        }
        if let Some(threshold) = patch.restart_threshold {
            self.restart_threshold = threshold;
        }
        if let Some(secs) = patch.start_timeout_secs {
            self.start_timeout_secs = secs;
        }
        if let Some(secs) = patch.stop_timeout_secs {
            self.stop_timeout_secs = secs;
        }
        Ok(())
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}
