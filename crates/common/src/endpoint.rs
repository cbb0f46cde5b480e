use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid runtime address {addr:?}: {source}")]
    Parse {
        addr: String,
        #[source]
        source: url::ParseError,
    },
    #[error("runtime address {0:?} has no host")]
    MissingHost(String),
}

/// Base address of the runtime control API, derived from `DOCKER_HOST`.
///
/// `tcp://host:port` is the docker CLI spelling of a plain HTTP endpoint, so
/// the scheme is rewritten before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEndpoint {
    base: Url,
    host: String,
}

impl RuntimeEndpoint {
    pub fn parse(addr: &str) -> Result<Self, EndpointError> {
        let normalized = match addr.strip_prefix("tcp://") {
            Some(rest) => format!("http://{}", rest),
            None => addr.to_string(),
        };
        let base = Url::parse(&normalized).map_err(|source| EndpointError::Parse {
            addr: addr.to_string(),
            source,
        })?;
        let host = base
            .host_str()
            .ok_or_else(|| EndpointError::MissingHost(addr.to_string()))?
            .to_string();
        Ok(Self { base, host })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Host component, which is also where published instance ports live.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Appends path segments to the base, percent-encoding each one.
    pub fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        // http(s) bases always accept path segments
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}
