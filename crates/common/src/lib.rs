use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

mod endpoint;
mod runtime;

pub use endpoint::{EndpointError, RuntimeEndpoint};
pub use runtime::{DockerApi, ImageInfo, InstanceInfo, InstanceRuntime, RuntimeError};

/// Exit status used by a sidecar whose instance no longer exists, so the
/// platform supervisor restarts it and a fresh instance is provisioned.
pub const EXIT_INSTANCE_GONE: i32 = 255;

/// Route served by the monitor and called by every sidecar heartbeat.
pub const REGISTER_PATH: &str = "/register";

/// Opaque identifier the runtime assigned to a workload instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub instance_id: InstanceId,
    pub last_seen: DateTime<Utc>,
}

/// Query string of a heartbeat: `/register?cid=<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterQuery {
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaseList {
    pub leases: Vec<Lease>,
}
