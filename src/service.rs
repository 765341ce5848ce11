use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backends::Backend;
use crate::daemon::{Request, RequestHandler, Response, ResponseStream, ShutdownHandle};
use crate::error::{chain, Result};

/// Policy RPC service registered on the daemon.
pub struct PolicyService {
    backend: Arc<dyn Backend>,
    shutdown: ShutdownHandle,
    version: String,
}

impl PolicyService {
    pub fn new(backend: Arc<dyn Backend>, shutdown: ShutdownHandle) -> Self {
        Self {
            backend,
            shutdown,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn status(&self, responses: &mut ResponseStream) -> Result<()> {
        let backend = &self.backend;

        for line in backend.describe_config().lines() {
            responses.line(line).await?;
        }
        responses.line(format!("Domain: {}", backend.domain())).await?;

        let server = match backend.server_fqdn().await {
            Ok(server) => server,
            Err(e) if e.is_no_active_server() => "none (no active server)".to_string(),
            Err(e) => {
                debug!("Server lookup failed: {}", chain(&e));
                format!("unknown ({})", chain(&e))
            }
        };
        responses.line(format!("Server: {server}")).await?;

        let online = match backend.is_online().await {
            Ok(true) => "online".to_string(),
            Ok(false) => "offline".to_string(),
            Err(e) => format!("unknown ({})", chain(&e)),
        };
        responses.line(format!("Directory: {online}")).await?;

        responses
            .line(format!(
                "Default domain suffix: {}",
                backend.default_domain_suffix()
            ))
            .await?;
        let ccache = backend.host_krb5_ccname()?;
        responses
            .line(format!("Machine ticket cache: {}", ccache.display()))
            .await?;

        let tracker = self.shutdown.tracker();
        let timeout = tracker.timeout();
        if timeout.is_zero() {
            responses.line("Idle timeout: disabled").await?;
        } else {
            responses
                .line(format!("Idle timeout: {}s", timeout.as_secs()))
                .await?;
        }
        responses
            .line(format!("Active calls: {}", tracker.active()))
            .await
    }
}

#[async_trait]
impl RequestHandler for PolicyService {
    async fn handle(&self, request: Request, responses: &mut ResponseStream) -> Result<()> {
        match request {
            Request::Version => {
                responses
                    .send(&Response::Version {
                        version: self.version.clone(),
                    })
                    .await
            }
            Request::Status => self.status(responses).await,
            Request::Stop { force } => {
                info!(force, "Stop requested by client");
                responses.send(&Response::Ok).await?;
                // answer before a forced quit aborts this call
                responses.finish().await?;
                self.shutdown.quit(force);
                Ok(())
            }
        }
    }
}
