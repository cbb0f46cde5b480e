use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{InstanceId, InstanceRuntime};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::LeaseRegistry;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often the registry is swept.
    pub interval: Duration,
    /// Leases not refreshed within this window are evicted. Keep it a
    /// multiple of the sidecar heartbeat interval.
    pub expiry_window: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            expiry_window: Duration::from_secs(9),
        }
    }
}

/// Evicts expired leases and destroys their instances.
pub struct Reaper {
    registry: Arc<LeaseRegistry>,
    runtime: Arc<dyn InstanceRuntime>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(
        registry: Arc<LeaseRegistry>,
        runtime: Arc<dyn InstanceRuntime>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            config,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            expiry_window_ms = self.config.expiry_window.as_millis() as u64,
            "Reaper started"
        );

        let mut interval = time::interval(self.config.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    self.reap(Utc::now()).await;
                }
            }
        }

        info!("Reaper stopped");
    }

    /// One sweep as of `now`. Returns the evicted ids.
    ///
    /// Leases leave the registry whether or not the destroy call succeeds;
    /// a failed destroy is only logged.
    pub async fn reap(&self, now: DateTime<Utc>) -> Vec<InstanceId> {
        let window = chrono::Duration::from_std(self.config.expiry_window)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let expired = self.registry.sweep(cutoff);
        for id in &expired {
            info!(instance_id = %id, remaining = self.registry.len(), "Removing expired instance");
            match self.runtime.destroy(id).await {
                Ok(()) => debug!(instance_id = %id, "Instance destroyed"),
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %id, "Instance already gone")
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Failed to destroy instance"),
            }
        }
        expired
    }
}
