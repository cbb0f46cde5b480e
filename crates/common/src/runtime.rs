use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::debug;

use crate::endpoint::RuntimeEndpoint;
use crate::InstanceId;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime answered authoritatively that the object does not exist.
    #[error("{0} not found")]
    NotFound(String),
    #[error("runtime request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("runtime returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("unexpected runtime response: {0}")]
    Decode(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Subset of the container inspect document the sidecar and monitor need.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub state: InstanceState,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceState {
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    /// Keyed by `"<port>/<proto>"`; unpublished ports map to `null`.
    #[serde(default)]
    pub ports: BTreeMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: String,
}

impl InstanceInfo {
    /// Host port published for the lowest-numbered container port that has
    /// one.
    pub fn published_port(&self) -> Option<u16> {
        let mut ports: Vec<(u16, u16)> = self
            .network_settings
            .ports
            .iter()
            .filter_map(|(key, bindings)| {
                let container = parse_port_key(key)?;
                let host = bindings
                    .as_ref()?
                    .iter()
                    .find_map(|b| b.host_port.parse::<u16>().ok())?;
                Some((container, host))
            })
            .collect();
        ports.sort_unstable();
        ports.first().map(|(_, host)| *host)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInfo {
    #[serde(default)]
    pub config: Option<ImageConfig>,
    #[serde(default)]
    pub container_config: Option<ImageConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageConfig {
    #[serde(default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl ImageInfo {
    /// Lowest exposed container port. Older daemons only fill
    /// `ContainerConfig`.
    pub fn exposed_port(&self) -> Option<u16> {
        [&self.config, &self.container_config]
            .into_iter()
            .flatten()
            .filter_map(|c| c.exposed_ports.as_ref())
            .find_map(|ports| ports.keys().filter_map(|k| parse_port_key(k)).min())
    }
}

fn parse_port_key(key: &str) -> Option<u16> {
    key.split('/').next()?.parse().ok()
}

/// Control-plane operations the lifecycle roles depend on.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    async fn inspect(&self, id: &InstanceId) -> Result<InstanceInfo, RuntimeError>;

    /// Forcibly removes the instance, running or not.
    async fn destroy(&self, id: &InstanceId) -> Result<(), RuntimeError>;
}

/// Docker Engine HTTP API client.
#[derive(Debug, Clone)]
pub struct DockerApi {
    client: Client,
    endpoint: RuntimeEndpoint,
}

impl DockerApi {
    /// Every request is bounded by `timeout` so a hung daemon surfaces as a
    /// transport error.
    pub fn new(endpoint: RuntimeEndpoint, timeout: Duration) -> Result<Self, RuntimeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &RuntimeEndpoint {
        &self.endpoint
    }

    pub async fn inspect_image(&self, name: &str) -> Result<ImageInfo, RuntimeError> {
        let url = self.endpoint.url(&["images", name, "json"]);
        self.get_json(url, name).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: url::Url,
        what: &str,
    ) -> Result<T, RuntimeError> {
        debug!(%url, "GET");
        let resp = self.client.get(url.clone()).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(what.to_string())),
            status if !status.is_success() => Err(RuntimeError::Status {
                status,
                url: url.to_string(),
            }),
            _ => {
                let body = resp.bytes().await?;
                serde_json::from_slice(&body).map_err(|e| RuntimeError::Decode(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl InstanceRuntime for DockerApi {
    async fn inspect(&self, id: &InstanceId) -> Result<InstanceInfo, RuntimeError> {
        let url = self.endpoint.url(&["containers", id.as_str(), "json"]);
        self.get_json(url, id.as_str()).await
    }

    async fn destroy(&self, id: &InstanceId) -> Result<(), RuntimeError> {
        let mut url = self.endpoint.url(&["containers", id.as_str()]);
        url.query_pairs_mut().append_pair("force", "true");
        debug!(%url, "DELETE");
        let resp = self.client.delete(url.clone()).send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(RuntimeError::NotFound(id.to_string())),
            status if !status.is_success() => Err(RuntimeError::Status {
                status,
                url: url.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
