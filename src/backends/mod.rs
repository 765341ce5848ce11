//! Directory backends
//!
//! A backend answers, for the machine's directory domain, which server is
//! authoritative, where the machine ticket cache lives and whether the
//! directory is currently reachable. Integrations plug in by implementing
//! [`Backend`].

pub mod sss;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{AgentConfig, BackendKind};
use crate::error::BackendError;

pub use sss::{SssBackend, SssConfig, SystemBus};

/// Live and static directory information for the machine's domain.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Resolved directory domain.
    fn domain(&self) -> &str;

    /// Current directory server address.
    ///
    /// Implementations may discover it dynamically; a reachable directory
    /// with no assigned server is reported as [`BackendError::NoActiveServer`].
    async fn server_fqdn(&self) -> Result<String, BackendError>;

    /// Absolute path of the machine Kerberos credential cache.
    fn host_krb5_ccname(&self) -> Result<PathBuf, BackendError>;

    fn default_domain_suffix(&self) -> &str;

    async fn is_online(&self) -> Result<bool, BackendError>;

    /// Human-readable summary of the backend configuration.
    fn describe_config(&self) -> String;
}

/// Build the backend selected in the daemon configuration.
pub fn from_config(
    config: &AgentConfig,
    bus: Arc<dyn SystemBus>,
) -> Result<Arc<dyn Backend>, BackendError> {
    match config.ad_backend {
        BackendKind::Sssd => {
            let backend = SssBackend::new(config.sssd.clone(), bus)?;
            Ok(Arc::new(backend))
        }
    }
}
