use std::path::PathBuf;
use std::time::Duration;

const ADPOLICY_CONFIG: &str = "ADPOLICY_CONFIG";
const ADPOLICY_SOCKET: &str = "ADPOLICY_SOCKET";
const ADPOLICY_SERVICE_TIMEOUT: &str = "ADPOLICY_SERVICE_TIMEOUT";

const DEFAULT_CONFIG_PATH: &str = "/etc/adpolicy.toml";
const DEFAULT_SOCKET_PATH: &str = "/run/adpolicy.sock";

pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_SSS_CONF: &str = "/etc/sssd/sssd.conf";
pub const DEFAULT_SSS_CACHE_DIR: &str = "/var/lib/sss/db";

/// Non-empty value of an environment variable.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Daemon settings file ($ADPOLICY_CONFIG or /etc/adpolicy.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(ADPOLICY_CONFIG)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    tracing::trace!(path = %path.display(), "Daemon config path");
    path
}

pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Socket override ($ADPOLICY_SOCKET)
pub fn socket_override() -> Option<PathBuf> {
    let val = env_opt(ADPOLICY_SOCKET).map(PathBuf::from);
    tracing::trace!(value = ?val, "ADPOLICY_SOCKET env var");
    val
}

/// Idle timeout override in seconds ($ADPOLICY_SERVICE_TIMEOUT)
pub fn service_timeout_override() -> Option<Duration> {
    let val = env_opt(ADPOLICY_SERVICE_TIMEOUT).and_then(|s| match s.trim().parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            tracing::warn!(value = %s, "Ignoring invalid {}", ADPOLICY_SERVICE_TIMEOUT);
            None
        }
    });
    tracing::trace!(value = ?val, "ADPOLICY_SERVICE_TIMEOUT env var");
    val
}
