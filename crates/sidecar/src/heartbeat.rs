use std::time::Duration;

use common::{InstanceId, RegisterQuery, REGISTER_PATH};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const MIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// The monitor reported the instance as removed from the runtime.
#[derive(Debug, Error)]
#[error("instance {0} is gone")]
pub struct InstanceGone(pub InstanceId);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Registered,
    Gone,
    /// Any other status; retried on the next tick.
    Rejected(StatusCode),
}

/// Periodically reports one instance to the monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatClient {
    client: Client,
    url: Url,
    instance_id: InstanceId,
    interval: Duration,
}

impl HeartbeatClient {
    pub fn new(
        monitor: &Url,
        instance_id: InstanceId,
        interval: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(interval.max(MIN_REQUEST_TIMEOUT))
            .build()?;
        let mut url = monitor.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push(REGISTER_PATH.trim_start_matches('/'));
        }
        Ok(Self {
            client,
            url,
            instance_id,
            interval,
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub async fn beat(&self) -> Result<Beat, reqwest::Error> {
        let query = RegisterQuery {
            cid: Some(self.instance_id.to_string()),
        };
        let resp = self.client.get(self.url.clone()).query(&query).send().await?;
        Ok(match resp.status() {
            StatusCode::GONE => Beat::Gone,
            status if status.is_success() => Beat::Registered,
            status => Beat::Rejected(status),
        })
    }

    /// Beats until cancelled (`Ok`) or until the monitor answers Gone.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), InstanceGone> {
        info!(instance_id = %self.instance_id, url = %self.url, "Heartbeat started");

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Heartbeat stopped");
                    return Ok(());
                }

                _ = interval.tick() => {}
            }

            match self.beat().await {
                Ok(Beat::Registered) => debug!(instance_id = %self.instance_id, "Heartbeat sent"),
                Ok(Beat::Gone) => {
                    warn!(instance_id = %self.instance_id, "Monitor reports instance gone");
                    return Err(InstanceGone(self.instance_id));
                }
                Ok(Beat::Rejected(status)) => {
                    warn!(instance_id = %self.instance_id, %status, "Heartbeat rejected")
                }
                Err(e) => warn!(instance_id = %self.instance_id, error = %e, "Heartbeat failed"),
            }
        }
    }
}
