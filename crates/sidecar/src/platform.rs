use serde::Deserialize;
use thiserror::Error;

pub const VCAP_APPLICATION: &str = "VCAP_APPLICATION";
pub const VCAP_APP_PORT: &str = "VCAP_APP_PORT";
pub const DOCKER_HOST_PORT: &str = "DOCKER_HOST_PORT";

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("VCAP_APPLICATION is not set")]
    NotDeployed,
    #[error("invalid VCAP_APPLICATION: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error("invalid VCAP_APP_PORT: {0:?}")]
    Port(String),
}

#[derive(Debug, Deserialize)]
struct ApplicationDescriptor {
    version: String,
}

/// What the hosting platform tells a deployed sidecar about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEnv {
    /// Application version id; also the tag of a freshly built image.
    pub app_id: String,
    /// Public port assigned by the platform, if any.
    pub port: Option<u16>,
    /// Fixed host port to publish the instance on.
    pub host_port: Option<String>,
}

impl PlatformEnv {
    /// Whether this process was deployed by the platform, which selects the
    /// sidecar role.
    pub fn is_deployed(lookup: impl Fn(&str) -> Option<String>) -> bool {
        lookup(VCAP_APPLICATION).is_some_and(|v| !v.is_empty())
    }

    pub fn from_env() -> Result<Self, PlatformError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PlatformError> {
        let raw = lookup(VCAP_APPLICATION)
            .filter(|v| !v.is_empty())
            .ok_or(PlatformError::NotDeployed)?;
        let descriptor: ApplicationDescriptor = serde_json::from_str(&raw)?;

        let port = match lookup(VCAP_APP_PORT).filter(|v| !v.is_empty()) {
            Some(v) => Some(v.trim().parse().map_err(|_| PlatformError::Port(v))?),
            None => None,
        };

        Ok(Self {
            app_id: descriptor.version,
            port,
            host_port: lookup(DOCKER_HOST_PORT).filter(|v| !v.is_empty()),
        })
    }
}
