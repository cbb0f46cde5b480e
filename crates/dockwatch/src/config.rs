use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::RuntimeEndpoint;
use monitor::{MonitorConfig, ReaperConfig};
use sidecar::SidecarConfig;
use url::Url;

pub const DOCKER_HOST: &str = "DOCKER_HOST";
pub const DOCKER_MONITOR: &str = "DOCKER_MONITOR";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Listen port number
    #[arg(short, long, default_value_t = 9999)]
    pub port: u16,

    /// Turn on debugging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Just do the docker build step
    #[arg(short = 'b', long)]
    pub build_only: bool,

    /// Seconds between sidecar heartbeats
    #[arg(long, default_value_t = 3)]
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before an instance is reaped
    #[arg(long, default_value_t = 9)]
    pub expiry_window_secs: u64,

    /// Seconds between reaper sweeps
    #[arg(long, default_value_t = 1)]
    pub reap_interval_secs: u64,

    /// Timeout for each call to the docker daemon
    #[arg(long, default_value_t = 5)]
    pub runtime_timeout_secs: u64,
}

/// Settings shared by both roles, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub build_only: bool,
    pub runtime: RuntimeEndpoint,
    pub runtime_timeout: Duration,
    pub monitor_url: Option<Url>,
    pub heartbeat_interval: Duration,
    pub reaper: ReaperConfig,
}

impl Settings {
    pub fn resolve(cli: &Cli, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let docker_host = lookup(DOCKER_HOST)
            .filter(|v| !v.is_empty())
            .with_context(|| format!("{DOCKER_HOST} must be set"))?;
        let runtime = RuntimeEndpoint::parse(&docker_host)?;

        let monitor_url = lookup(DOCKER_MONITOR)
            .filter(|v| !v.is_empty())
            .map(|v| Url::parse(&v).with_context(|| format!("invalid {DOCKER_MONITOR}: {v:?}")))
            .transpose()?;

        let heartbeat_interval = Duration::from_secs(cli.heartbeat_interval_secs);
        let expiry_window = Duration::from_secs(cli.expiry_window_secs);
        if heartbeat_interval.is_zero() || cli.reap_interval_secs == 0 {
            bail!("heartbeat and reap intervals must be positive");
        }
        if cli.runtime_timeout_secs == 0 {
            bail!("runtime timeout must be positive");
        }
        if heartbeat_interval >= expiry_window {
            bail!(
                "heartbeat interval ({}s) must be shorter than the expiry window ({}s)",
                cli.heartbeat_interval_secs,
                cli.expiry_window_secs
            );
        }

        Ok(Self {
            port: cli.port,
            build_only: cli.build_only,
            runtime,
            runtime_timeout: Duration::from_secs(cli.runtime_timeout_secs),
            monitor_url,
            heartbeat_interval,
            reaper: ReaperConfig {
                interval: Duration::from_secs(cli.reap_interval_secs),
                expiry_window,
            },
        })
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)),
            reaper: self.reaper.clone(),
        }
    }

    pub fn sidecar(&self) -> Result<SidecarConfig> {
        if self.monitor_url.is_none() && !self.build_only {
            bail!("{DOCKER_MONITOR} must be set");
        }
        Ok(SidecarConfig {
            port: self.port,
            monitor: self.monitor_url.clone(),
            heartbeat_interval: self.heartbeat_interval,
            build_only: self.build_only,
        })
    }
}
