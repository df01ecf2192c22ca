use std::path::PathBuf;

const ENV_CONFIG: &str = "PANDEMIC_CONFIG";
const ENV_SOCKET_PATH: &str = "PANDEMIC_SOCKET_PATH";
const ENV_PID_FILE: &str = "PANDEMIC_PID_FILE";
const ENV_STATE_DIR: &str = "PANDEMIC_STATE_DIR";
const ENV_INFECTIONS_DIR: &str = "PANDEMIC_INFECTIONS_DIR";
const ENV_UNIT_DIR: &str = "PANDEMIC_UNIT_DIR";
const ENV_LOG_LEVEL: &str = "PANDEMIC_LOG_LEVEL";
const ENV_EVENTS_ENABLED: &str = "PANDEMIC_EVENTS_ENABLED";

const DEFAULT_CONFIG_PATH: &str = "/etc/pandemic/daemon.toml";

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Daemon config file ($PANDEMIC_CONFIG or /etc/pandemic/daemon.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(ENV_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// IPC socket override ($PANDEMIC_SOCKET_PATH)
pub fn socket_path() -> Option<PathBuf> {
    let val = env_opt(ENV_SOCKET_PATH).map(PathBuf::from);
    tracing::trace!(value = ?val, "PANDEMIC_SOCKET_PATH env var");
    val
}

/// PID file override ($PANDEMIC_PID_FILE)
pub fn pid_file() -> Option<PathBuf> {
    env_opt(ENV_PID_FILE).map(PathBuf::from)
}

/// Registry/staging directory override ($PANDEMIC_STATE_DIR)
pub fn state_dir() -> Option<PathBuf> {
    let val = env_opt(ENV_STATE_DIR).map(PathBuf::from);
    tracing::trace!(value = ?val, "PANDEMIC_STATE_DIR env var");
    val
}

/// Install root override ($PANDEMIC_INFECTIONS_DIR)
pub fn infections_dir() -> Option<PathBuf> {
    env_opt(ENV_INFECTIONS_DIR).map(PathBuf::from)
}

/// Unit file directory override ($PANDEMIC_UNIT_DIR)
pub fn unit_dir() -> Option<PathBuf> {
    env_opt(ENV_UNIT_DIR).map(PathBuf::from)
}

/// Log level override ($PANDEMIC_LOG_LEVEL)
pub fn log_level() -> Option<String> {
    env_opt(ENV_LOG_LEVEL)
}

/// Event sink toggle ($PANDEMIC_EVENTS_ENABLED)
pub fn events_enabled() -> Option<bool> {
    let result = env_opt(ENV_EVENTS_ENABLED).map(|v| is_truthy(&v));
    tracing::trace!(value = ?result, "PANDEMIC_EVENTS_ENABLED env var");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy(" YES "));
        assert!(is_truthy("1"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy("nope"));
    }
}
