//! SSSD backend: domain and active server information from `sssd.conf` and
//! the SSSD InfoPipe on the system bus.

use async_trait::async_trait;
use ini::{Ini, ParseOption};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

use super::Backend;
use crate::clienv;
use crate::error::BackendError;

pub const SSSD_DBUS_REGISTERED_NAME: &str = "org.freedesktop.sssd.infopipe";
pub const SSSD_DBUS_BASE_OBJECT_PATH: &str = "/org/freedesktop/sssd/infopipe/Domains";
pub const SSSD_DBUS_INTERFACE: &str = "org.freedesktop.sssd.infopipe.Domains.Domain";

const LDAP_SCHEME: &str = "ldap://";
const CCACHE_PREFIX: &str = "ccache_";
const AD_SERVICE: &str = "AD";

/// `[sssd]` section of the daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SssConfig {
    /// sssd.conf location
    pub config: Option<PathBuf>,
    /// Directory holding the SSSD credential caches
    pub cache_dir: Option<PathBuf>,
}

impl SssConfig {
    pub fn conf_path(&self) -> PathBuf {
        non_empty(self.config.as_deref()).unwrap_or_else(|| PathBuf::from(clienv::DEFAULT_SSS_CONF))
    }

    pub fn cache_dir(&self) -> PathBuf {
        non_empty(self.cache_dir.as_deref())
            .unwrap_or_else(|| PathBuf::from(clienv::DEFAULT_SSS_CACHE_DIR))
    }
}

fn non_empty(path: Option<&Path>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Remote InfoPipe object serving one domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEndpoint {
    pub destination: String,
    pub path: String,
}

impl BusEndpoint {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            destination: SSSD_DBUS_REGISTERED_NAME.to_string(),
            path: format!(
                "{}/{}",
                SSSD_DBUS_BASE_OBJECT_PATH,
                domain_to_object_path(domain)
            ),
        }
    }
}

/// Calls the backend issues on the system bus.
#[async_trait]
pub trait SystemBus: Send + Sync {
    /// `ActiveServer(service)` on the domain object. May legitimately be empty.
    async fn active_server(&self, endpoint: &BusEndpoint, service: &str) -> zbus::Result<String>;

    async fn is_online(&self, endpoint: &BusEndpoint) -> zbus::Result<bool>;
}

#[async_trait]
impl SystemBus for zbus::Connection {
    async fn active_server(&self, endpoint: &BusEndpoint, service: &str) -> zbus::Result<String> {
        let proxy = zbus::Proxy::new(
            self,
            endpoint.destination.as_str(),
            endpoint.path.as_str(),
            SSSD_DBUS_INTERFACE,
        )
        .await?;
        proxy.call("ActiveServer", &(service,)).await
    }

    async fn is_online(&self, endpoint: &BusEndpoint) -> zbus::Result<bool> {
        let proxy = zbus::Proxy::new(
            self,
            endpoint.destination.as_str(),
            endpoint.path.as_str(),
            SSSD_DBUS_INTERFACE,
        )
        .await?;
        proxy.call("IsOnline", &()).await
    }
}

/// Backend state, fixed at construction.
pub struct SssBackend {
    domain: String,
    endpoint: BusEndpoint,
    static_server_fqdn: Option<String>,
    host_krb5_ccname: PathBuf,
    default_domain_suffix: String,
    conf_path: PathBuf,
    cache_dir: PathBuf,
    bus: Arc<dyn SystemBus>,
}

impl SssBackend {
    /// Load the machine domain from sssd.conf.
    ///
    /// The first domain listed in `[sssd] domains` is used for the machine
    /// and all its users.
    pub fn new(config: SssConfig, bus: Arc<dyn SystemBus>) -> Result<Self, BackendError> {
        let conf_path = config.conf_path();
        let cache_dir = config.cache_dir();
        debug!(path = %conf_path.display(), "Loading SSS configuration for AD backend");

        let conf = SssdConf::load(&conf_path)?;

        let sssd_domain = conf
            .get("sssd", "domains")
            .and_then(|domains| domains.split(',').next())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if sssd_domain.is_empty() {
            return Err(BackendError::config(
                &conf_path,
                "failed to find default sssd domain in sssd.conf",
            ));
        }

        let section = format!("domain/{sssd_domain}");
        if conf.section_len(&section) == 0 {
            return Err(BackendError::config(
                &conf_path,
                format!(
                    "could not find AD domain section corresponding to {sssd_domain:?}, or the section is empty"
                ),
            ));
        }

        let domain = conf
            .get(&section, "ad_domain")
            .unwrap_or(&sssd_domain)
            .to_string();

        let default_domain_suffix = conf
            .get("sssd", "default_domain_suffix")
            .unwrap_or(&domain)
            .to_string();

        let static_server_fqdn = conf
            .get(&section, "ad_server")
            .map(|server| strip_ldap_scheme(server).to_string());

        let host_krb5_ccname = cache_dir.join(format!("{CCACHE_PREFIX}{}", domain.to_uppercase()));

        let endpoint = BusEndpoint::for_domain(&domain);
        trace!(domain = %domain, path = %endpoint.path, "SSSD domain object");

        Ok(Self {
            domain,
            endpoint,
            static_server_fqdn,
            host_krb5_ccname,
            default_domain_suffix,
            conf_path,
            cache_dir,
            bus,
        })
    }

    pub fn endpoint(&self) -> &BusEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Backend for SssBackend {
    fn domain(&self) -> &str {
        &self.domain
    }

    /// A static `ad_server` always wins; otherwise SSSD is asked for the
    /// server it currently talks to.
    async fn server_fqdn(&self) -> Result<String, BackendError> {
        if let Some(server) = &self.static_server_fqdn {
            return Ok(server.clone());
        }
        debug!(
            domain = %self.domain,
            "Triggering autodiscovery of AD server because sssd.conf does not provide an ad_server"
        );

        let server = self
            .bus
            .active_server(&self.endpoint, AD_SERVICE)
            .await
            .map_err(|source| BackendError::Transport {
                operation: "look up AD server address",
                domain: self.domain.clone(),
                source,
            })?;
        if server.is_empty() {
            return Err(BackendError::NoActiveServer {
                domain: self.domain.clone(),
            });
        }

        Ok(strip_ldap_scheme(&server).to_string())
    }

    fn host_krb5_ccname(&self) -> Result<PathBuf, BackendError> {
        Ok(self.host_krb5_ccname.clone())
    }

    fn default_domain_suffix(&self) -> &str {
        &self.default_domain_suffix
    }

    async fn is_online(&self) -> Result<bool, BackendError> {
        self.bus
            .is_online(&self.endpoint)
            .await
            .map_err(|source| BackendError::Transport {
                operation: "retrieve offline state",
                domain: self.domain.clone(),
                source,
            })
    }

    fn describe_config(&self) -> String {
        format!(
            "Current backend is SSSD\nConfiguration: {}\nCache: {}",
            self.conf_path.display(),
            self.cache_dir.display()
        )
    }
}

fn strip_ldap_scheme(server: &str) -> &str {
    server.strip_prefix(LDAP_SCHEME).unwrap_or(server)
}

/// Encode a domain name the way SSSD names its InfoPipe domain objects.
///
/// Bytes in `[0-9A-Za-z_]` are kept, every other byte becomes `_` followed by
/// its two-digit lowercase hex value.
pub fn domain_to_object_path(domain: &str) -> String {
    let mut out = String::with_capacity(domain.len());
    for b in domain.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "_{b:02x}");
        }
    }
    out
}

/// Value up to the first `;` or `#`, trimmed.
fn strip_inline_comment(value: &str) -> &str {
    value
        .split(|c: char| c == ';' || c == '#')
        .next()
        .unwrap_or_default()
        .trim()
}

/// sssd.conf with section names and keys folded to lowercase.
struct SssdConf {
    sections: HashMap<String, HashMap<String, String>>,
}

impl SssdConf {
    fn load(path: &Path) -> Result<Self, BackendError> {
        let opt = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_file_opt(path, opt)
            .map_err(|e| BackendError::config(path, e.to_string()))?;

        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (name, props) in ini.iter() {
            let Some(name) = name else {
                continue;
            };
            let entries = sections.entry(name.trim().to_lowercase()).or_default();
            for (key, value) in props.iter() {
                entries.insert(
                    key.trim().to_lowercase(),
                    strip_inline_comment(value).to_string(),
                );
            }
        }
        Ok(Self { sections })
    }

    /// Non-empty value of `key` in `section`.
    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(&section.to_lowercase())
            .and_then(|s| s.get(&key.to_lowercase()))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn section_len(&self, section: &str) -> usize {
        self.sections
            .get(&section.to_lowercase())
            .map_or(0, HashMap::len)
    }
}
