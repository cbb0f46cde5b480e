//! Per-instance sidecar: provisions one workload instance, relays public
//! traffic to it, and keeps its lease alive with the monitor.

mod heartbeat;
mod platform;
mod provision;
mod proxy;

pub use heartbeat::{Beat, HeartbeatClient, InstanceGone};
pub use platform::{PlatformEnv, PlatformError};
pub use provision::{resolve_binding, Binding, ProvisionError, Provisioner, IMAGE_FILE};
pub use proxy::Proxy;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use common::{DockerApi, InstanceId};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use url::Url;

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error("failed to bind proxy on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build heartbeat client: {0}")]
    Heartbeat(#[from] reqwest::Error),
    #[error("no monitor address configured")]
    MissingMonitor,
    #[error(transparent)]
    InstanceGone(#[from] InstanceGone),
}

#[derive(Debug, Clone)]
pub struct SidecarConfig {
    /// Public proxy port.
    pub port: u16,
    /// Base URL of the monitor. Only optional for build-only runs.
    pub monitor: Option<Url>,
    pub heartbeat_interval: Duration,
    /// Stop after the image is resolved.
    pub build_only: bool,
}

/// Provisions the instance, then proxies and heartbeats until shutdown or
/// until the monitor reports the instance gone.
pub async fn run(
    config: SidecarConfig,
    platform: PlatformEnv,
    api: DockerApi,
    provisioner: Provisioner,
    shutdown: CancellationToken,
) -> Result<(), SidecarError> {
    let image = provisioner.resolve_image(&platform.app_id).await?;
    if config.build_only {
        info!(%image, "Build only, exiting");
        return Ok(());
    }
    if config.monitor.is_none() {
        return Err(SidecarError::MissingMonitor);
    }

    let publish = provisioner
        .publish_option(&api, &image, platform.host_port.as_deref())
        .await?;
    let instance_id = provisioner.run_instance(&image, &publish).await?;
    let binding = resolve_binding(&api, &instance_id).await?;

    let port = platform.port.unwrap_or(config.port);
    serve(&config, instance_id, binding, port, shutdown).await
}

/// Runs the proxy and heartbeat for an already provisioned instance.
pub async fn serve(
    config: &SidecarConfig,
    instance_id: InstanceId,
    binding: Binding,
    port: u16,
    shutdown: CancellationToken,
) -> Result<(), SidecarError> {
    let monitor = config.monitor.as_ref().ok_or(SidecarError::MissingMonitor)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let proxy = Proxy::bind(addr, binding.address())
        .await
        .map_err(|source| SidecarError::Bind { addr, source })?;
    let heartbeat =
        HeartbeatClient::new(monitor, instance_id, config.heartbeat_interval)?;

    info!(
        instance_id = %heartbeat.instance_id(),
        port,
        target = %binding.address(),
        "Sidecar running"
    );

    let local = shutdown.child_token();
    let proxy_task = tokio::spawn(proxy.run(local.clone()));
    let beat = heartbeat.run(local.clone()).await;

    local.cancel();
    if let Err(e) = proxy_task.await {
        error!(error = %e, "Proxy task failed");
    }
    beat.map_err(SidecarError::from)
}
