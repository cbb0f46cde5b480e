use std::path::PathBuf;
use std::process::Stdio;

use common::{DockerApi, InstanceId, InstanceRuntime, RuntimeError};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// File in the working directory naming a prebuilt image.
pub const IMAGE_FILE: &str = "Dockerimage";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("`{0}` printed no instance id")]
    NoInstanceId(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("instance {0} publishes no host port")]
    NoPublishedPort(InstanceId),
}

/// Where the proxy forwards to, fixed for the life of the sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub host: String,
    pub port: u16,
}

impl Binding {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builds and starts workload instances through the docker CLI.
#[derive(Debug, Clone)]
pub struct Provisioner {
    program: String,
    workdir: PathBuf,
    env_file: PathBuf,
}

impl Provisioner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: "docker".to_string(),
            workdir: workdir.into(),
            env_file: PathBuf::from("../env.lst"),
        }
    }

    /// Replaces the `docker` executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_env_file(mut self, env_file: impl Into<PathBuf>) -> Self {
        self.env_file = env_file.into();
        self
    }

    /// Image named in [`IMAGE_FILE`], or a fresh build tagged `app_id`.
    pub async fn resolve_image(&self, app_id: &str) -> Result<String, ProvisionError> {
        let image = match tokio::fs::read_to_string(self.workdir.join(IMAGE_FILE)).await {
            Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
            _ => {
                info!(image = app_id, "Building image");
                self.exec(&["build", "-t", app_id, "."]).await?;
                app_id.to_string()
            }
        };
        debug!(%image, "Image resolved");
        Ok(image)
    }

    /// `--publish-all=true`, or a fixed mapping from `host_port` to the
    /// image's exposed port when both are known.
    pub async fn publish_option(
        &self,
        api: &DockerApi,
        image: &str,
        host_port: Option<&str>,
    ) -> Result<String, ProvisionError> {
        if let Some(host_port) = host_port {
            if let Some(port) = api.inspect_image(image).await?.exposed_port() {
                return Ok(format!("--publish={}:{}", host_port, port));
            }
        }
        Ok("--publish-all=true".to_string())
    }

    pub async fn run_instance(
        &self,
        image: &str,
        publish: &str,
    ) -> Result<InstanceId, ProvisionError> {
        let env_file = self.env_file.to_string_lossy();
        let args = ["run", "-d", "--env-file", &*env_file, publish, image];
        let stdout = self.exec(&args).await?;
        // the daemon may print pull progress before the id
        let id = stdout
            .lines()
            .map(str::trim)
            .rev()
            .find(|l| !l.is_empty())
            .ok_or_else(|| ProvisionError::NoInstanceId(self.render(&args)))?;
        info!(instance_id = id, %image, "Instance started");
        Ok(InstanceId::from(id))
    }

    async fn exec(&self, args: &[&str]) -> Result<String, ProvisionError> {
        debug!(command = %self.render(args), "Exec");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProvisionError::Command {
                command: self.render(args),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn render(&self, args: &[&str]) -> String {
        std::iter::once(self.program.as_str())
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Resolves the instance's published port once; the host is the runtime
/// daemon's own host.
pub async fn resolve_binding(
    api: &DockerApi,
    id: &InstanceId,
) -> Result<Binding, ProvisionError> {
    let info = api.inspect(id).await?;
    let port = info
        .published_port()
        .ok_or_else(|| ProvisionError::NoPublishedPort(id.clone()))?;
    Ok(Binding {
        host: api.endpoint().host().to_string(),
        port,
    })
}
