use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::sss::SssConfig;
use crate::clienv;

/// Identity-resolution integrations the daemon can be built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sssd,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Listening socket for the policy RPC endpoint
    pub socket: Option<PathBuf>,
    /// Idle seconds before the daemon exits on its own (0 disables)
    pub service_timeout: Option<u64>,
    pub ad_backend: BackendKind,
    pub sssd: SssConfig,
}

impl AgentConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading daemon config");

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(socket = ?config.socket, service_timeout = ?config.service_timeout, backend = ?config.ad_backend, "Daemon config loaded");
        Ok(config)
    }

    /// Environment overrides win over the file.
    pub fn apply_env(mut self) -> Self {
        if let Some(socket) = clienv::socket_override() {
            self.socket = Some(socket);
        }
        if let Some(timeout) = clienv::service_timeout_override() {
            self.service_timeout = Some(timeout.as_secs());
        }
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(clienv::default_socket_path)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.service_timeout
            .map(Duration::from_secs)
            .unwrap_or(clienv::DEFAULT_SERVICE_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ad_backend, BackendKind::Sssd);
        assert_eq!(config.socket_path(), clienv::default_socket_path());
        assert_eq!(config.idle_timeout(), clienv::DEFAULT_SERVICE_TIMEOUT);
        assert!(config.sssd.config.is_none());
    }

    #[test]
    fn test_load_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adpolicy.toml");
        fs::write(
            &path,
            r#"
socket = "/tmp/adpolicy-test.sock"
service_timeout = 0
ad_backend = "sssd"

[sssd]
config = "/srv/sssd.conf"
cache_dir = "/srv/cache"
"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap();
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/adpolicy-test.sock"));
        assert_eq!(config.idle_timeout(), Duration::ZERO);
        assert_eq!(config.sssd.config, Some(PathBuf::from("/srv/sssd.conf")));
        assert_eq!(config.sssd.cache_dir, Some(PathBuf::from("/srv/cache")));
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adpolicy.toml");
        fs::write(&path, "ad_backend = \"winbind\"\n").unwrap();

        let err = AgentConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }
}
