mod args;

use adpolicy::config::AgentConfig;
use adpolicy::{backends, clienv, Daemon, DaemonConfig, PolicyService};
use anyhow::Context;
use args::Cli;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.unwrap_or_else(clienv::config_path);
    let mut config = AgentConfig::load(&config_path)?.apply_env();
    if let Some(socket) = cli.socket {
        config.socket = Some(socket);
    }
    if let Some(timeout) = cli.timeout {
        config.service_timeout = Some(timeout);
    }

    let bus = zbus::Connection::system()
        .await
        .context("Failed to connect to the system bus")?;
    let backend = backends::from_config(&config, Arc::new(bus))?;
    tracing::info!(domain = %backend.domain(), "Directory backend ready");

    let daemon_config = DaemonConfig {
        socket_path: config.socket_path(),
        timeout: config.idle_timeout(),
    };
    let daemon = Daemon::new(daemon_config, |shutdown| {
        Arc::new(PolicyService::new(backend, shutdown))
    })?;
    daemon.quit_on_signals()?;

    daemon.listen().await?;
    Ok(())
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
