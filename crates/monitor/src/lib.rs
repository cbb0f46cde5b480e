//! Fleet-wide lease monitor: accepts sidecar heartbeats and reaps instances
//! whose heartbeats stop.

mod handlers;
mod reaper;
mod registry;

pub use handlers::{router, AppState};
pub use reaper::{Reaper, ReaperConfig};
pub use registry::LeaseRegistry;

use std::net::SocketAddr;
use std::sync::Arc;

use common::InstanceRuntime;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub listen: SocketAddr,
    pub reaper: ReaperConfig,
}

/// Registration endpoint plus reaper, sharing one registry.
pub struct MonitorServer {
    listener: TcpListener,
    registry: Arc<LeaseRegistry>,
    runtime: Arc<dyn InstanceRuntime>,
    reaper: ReaperConfig,
}

impl MonitorServer {
    pub async fn bind(
        config: MonitorConfig,
        runtime: Arc<dyn InstanceRuntime>,
    ) -> Result<Self, MonitorError> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| MonitorError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self {
            listener,
            registry: Arc::new(LeaseRegistry::new()),
            runtime,
            reaper: config.reaper,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<LeaseRegistry> {
        self.registry.clone()
    }

    /// Serves until `shutdown` is cancelled, then waits for the reaper.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), MonitorError> {
        let addr = self.listener.local_addr()?;
        let reaper = Reaper::new(self.registry.clone(), self.runtime.clone(), self.reaper);
        let reaper_task = tokio::spawn(reaper.run(shutdown.clone()));

        info!(%addr, "Monitor listening");
        let app = router(AppState {
            registry: self.registry,
            runtime: self.runtime,
        });
        let signal = shutdown.clone();
        let served = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        shutdown.cancel();
        if let Err(e) = reaper_task.await {
            error!(error = %e, "Reaper task failed");
        }
        served.map_err(MonitorError::from)
    }
}
