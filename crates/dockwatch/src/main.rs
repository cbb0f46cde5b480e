mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use common::{DockerApi, EXIT_INSTANCE_GONE};
use monitor::MonitorServer;
use sidecar::{PlatformEnv, Provisioner, SidecarError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let lookup = |key: &str| std::env::var(key).ok();
    let settings = Settings::resolve(&cli, lookup)?;
    debug!(?settings, "Configuration resolved");

    let api = DockerApi::new(settings.runtime.clone(), settings.runtime_timeout)?;
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    if PlatformEnv::is_deployed(lookup) {
        run_sidecar(&settings, api, shutdown).await
    } else {
        run_monitor(&settings, api, shutdown).await
    }
}

async fn run_sidecar(settings: &Settings, api: DockerApi, shutdown: CancellationToken) -> Result<()> {
    let platform = PlatformEnv::from_env()?;
    info!(app_id = %platform.app_id, "Starting sidecar");

    let provisioner = Provisioner::new(std::env::current_dir()?);
    match sidecar::run(settings.sidecar()?, platform, api, provisioner, shutdown).await {
        Ok(()) => Ok(()),
        Err(SidecarError::InstanceGone(gone)) => {
            error!(instance_id = %gone.0, "Instance is gone, exiting so the platform restarts us");
            std::process::exit(EXIT_INSTANCE_GONE);
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_monitor(settings: &Settings, api: DockerApi, shutdown: CancellationToken) -> Result<()> {
    info!(runtime = %settings.runtime.base(), "Starting monitor");
    let server = MonitorServer::bind(settings.monitor(), Arc::new(api)).await?;
    server.run(shutdown).await?;
    Ok(())
}

async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot watch SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = tokio::signal::ctrl_c().await;

    info!("Shutting down");
    shutdown.cancel();
}
