use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("can't get domain configuration from {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("no active AD server reported by SSSD for {domain:?}")]
    NoActiveServer { domain: String },

    #[error("error while trying to {operation} on SSSD for {domain:?}")]
    Transport {
        operation: &'static str,
        domain: String,
        #[source]
        source: zbus::Error,
    },
}

impl BackendError {
    pub(crate) fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Directory reachable, but no server is currently assigned to the domain.
    pub fn is_no_active_server(&self) -> bool {
        matches!(self, Self::NoActiveServer { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("can't listen on {}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid daemon configuration: {0}")]
    Config(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<rkyv::rancor::Error> for DaemonError {
    fn from(e: rkyv::rancor::Error) -> Self {
        DaemonError::Protocol(e.to_string())
    }
}

pub type Result<T, E = DaemonError> = std::result::Result<T, E>;

/// Error message followed by its sources, `: `-separated.
pub fn chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
