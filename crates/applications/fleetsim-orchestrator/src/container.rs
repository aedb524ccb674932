//! Container runtime gateway
//!
//! Everything that touches containers goes through [`ContainerRuntime`].
//! [`DockerCli`] drives the `docker` command line; tests substitute an
//! in-memory runtime.

use crate::error::{Result, SimulationError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Opaque handle to a container created or looked up through the runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    /// Full container ID
    pub id: String,

    /// Container name (without leading slash)
    pub name: String,
}

impl ContainerHandle {
    /// Create a handle from an ID and a name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into().trim_start_matches('/').to_string(),
        }
    }

    /// 12-character short ID
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(12)]
    }
}

/// Container lifecycle status as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown(String),
}

impl ContainerStatus {
    /// Parse a `State.Status` string
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Restart policy of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
}

impl RestartPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
        }
    }
}

/// Everything needed to run a detached container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    /// `(host, container)` TCP port pairs
    pub ports: Vec<(u16, u16)>,
    /// `(host path, container path, read_only)`
    pub volumes: Vec<(String, String, bool)>,
    pub labels: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub cap_add: Vec<String>,
}

impl RunSpec {
    /// Create a run spec for an image and container name
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Join a network (`host` selects host networking)
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(key.into(), value.to_string());
        self
    }

    /// Publish a TCP port
    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push((host, container));
        self
    }

    /// Bind-mount a host path
    pub fn with_volume(
        mut self,
        host: impl Into<String>,
        container: impl Into<String>,
        read_only: bool,
    ) -> Self {
        self.volumes.push((host.into(), container.into(), read_only));
        self
    }

    /// Attach a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the restart policy
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Add a Linux capability
    pub fn with_cap_add(mut self, cap: impl Into<String>) -> Self {
        self.cap_add.push(cap.into());
        self
    }

    /// Build `docker run` arguments
    fn docker_run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];

        if let Some(ref network) = self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }

        for (host, container) in &self.ports {
            args.push("-p".to_string());
            args.push(format!("{}:{}/tcp", host, container));
        }

        for (host, container, read_only) in &self.volumes {
            args.push("-v".to_string());
            let mode = if *read_only { "ro" } else { "rw" };
            args.push(format!("{}:{}:{}", host, container, mode));
        }

        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        if self.restart != RestartPolicy::No {
            args.push("--restart".to_string());
            args.push(self.restart.as_str().to_string());
        }

        for cap in &self.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }

        args.push(self.image.clone());
        args
    }
}

/// Filter for listing containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFilter {
    /// Exact container name
    Name(String),
    /// `key=value` label match
    Label(String, String),
}

/// Operations the engine needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Reuse the named network, creating it when missing
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Run a detached container
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle>;

    /// List containers (running or not) matching a filter
    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerHandle>>;

    /// Look a container up by ID or name; `NotFound` when absent
    async fn get(&self, id_or_name: &str) -> Result<ContainerHandle>;

    /// Current lifecycle status
    async fn status(&self, container: &ContainerHandle) -> Result<ContainerStatus>;

    /// Block until the container exits and return its exit code
    async fn wait(&self, container: &ContainerHandle) -> Result<i64>;

    /// Graceful stop with a grace period before the kill
    async fn stop(&self, container: &ContainerHandle, timeout: Duration) -> Result<()>;

    /// Remove the container
    async fn remove(&self, container: &ContainerHandle, force: bool) -> Result<()>;

    /// Combined stdout/stderr log stream
    async fn logs(&self, container: &ContainerHandle) -> Result<Vec<u8>>;

    /// Copy a path out of the container onto the host
    async fn copy_out(&self, container: &ContainerHandle, src: &str, dest: &Path) -> Result<()>;

    /// One-shot resource statistics of every running container
    async fn stats(&self) -> Result<String>;
}

/// Container runtime backed by the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    /// Use `docker` from `PATH`
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use a specific docker-compatible binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec<I, S>(&self, args: I) -> Result<std::process::Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        AsyncCommand::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SimulationError::docker(format!("Failed to run {}: {}", self.binary, e)))
    }

    /// Run a docker command and return trimmed stdout, mapping "No such" to `NotFound`
    async fn exec_checked(&self, what: &str, target: &str, args: &[&str]) -> Result<String> {
        debug!("docker {:?}", args);
        let output = self.exec(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(SimulationError::NotFound(target.to_string()));
            }
            return Err(SimulationError::docker(format!(
                "{} failed for {}: {}",
                what,
                target,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// A container ID as printed by `docker run -d`
fn is_container_id(s: &str) -> bool {
    s.len() >= 12 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self.exec_checked("network inspect", name, &["network", "inspect", name]).await {
            Ok(_) => {
                info!("Using docker network: {}", name);
                Ok(())
            }
            Err(_) => {
                info!("Creating docker network: {}", name);
                self.exec_checked("network create", name, &["network", "create", name])
                    .await
                    .map(|_| ())
                    .map_err(|e| SimulationError::provisioning(format!("Network {}: {}", name, e)))
            }
        }
    }

    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle> {
        let args = spec.docker_run_args();
        debug!("Docker run command: {:?}", args);

        let output = self
            .exec(&args)
            .await
            .map_err(|e| SimulationError::provisioning(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SimulationError::provisioning(format!(
                "Container {} failed to start: {}",
                spec.name,
                stderr.trim()
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !is_container_id(&id) {
            return Err(SimulationError::provisioning(format!(
                "Container {} returned an unexpected handle: {:?}",
                spec.name, id
            )));
        }

        Ok(ContainerHandle::new(id, spec.name.clone()))
    }

    async fn list(&self, filter: &ContainerFilter) -> Result<Vec<ContainerHandle>> {
        let filter_arg = match filter {
            ContainerFilter::Name(name) => format!("name=^/?{}$", name),
            ContainerFilter::Label(key, value) => format!("label={}={}", key, value),
        };

        let stdout = self
            .exec_checked(
                "ps",
                &filter_arg,
                &[
                    "ps",
                    "-a",
                    "--no-trunc",
                    "--filter",
                    &filter_arg,
                    "--format",
                    "{{.ID}} {{.Names}}",
                ],
            )
            .await?;

        Ok(stdout
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(id, name)| ContainerHandle::new(id, name))
            .collect())
    }

    async fn get(&self, id_or_name: &str) -> Result<ContainerHandle> {
        let stdout = self
            .exec_checked(
                "inspect",
                id_or_name,
                &["container", "inspect", "--format", "{{.Id}} {{.Name}}", id_or_name],
            )
            .await?;

        stdout
            .split_once(' ')
            .map(|(id, name)| ContainerHandle::new(id, name))
            .ok_or_else(|| SimulationError::NotFound(id_or_name.to_string()))
    }

    async fn status(&self, container: &ContainerHandle) -> Result<ContainerStatus> {
        let stdout = self
            .exec_checked(
                "inspect",
                &container.name,
                &["container", "inspect", "--format", "{{.State.Status}}", &container.id],
            )
            .await?;
        Ok(ContainerStatus::parse(&stdout))
    }

    async fn wait(&self, container: &ContainerHandle) -> Result<i64> {
        let stdout = self
            .exec_checked("wait", &container.name, &["wait", &container.id])
            .await?;
        stdout.parse().map_err(|_| {
            SimulationError::docker(format!(
                "Unexpected exit code from {}: {:?}",
                container.name, stdout
            ))
        })
    }

    async fn stop(&self, container: &ContainerHandle, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        self.exec_checked("stop", &container.name, &["stop", "-t", &secs, &container.id])
            .await
            .map(|_| ())
    }

    async fn remove(&self, container: &ContainerHandle, force: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(&container.id);
        self.exec_checked("rm", &container.name, &args).await.map(|_| ())
    }

    async fn logs(&self, container: &ContainerHandle) -> Result<Vec<u8>> {
        let output = self.exec(["logs", container.id.as_str()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such") {
                return Err(SimulationError::NotFound(container.name.clone()));
            }
            return Err(SimulationError::docker(format!(
                "Failed to get logs of {}: {}",
                container.name,
                stderr.trim()
            )));
        }

        let mut data = output.stdout;
        data.extend_from_slice(&output.stderr);
        Ok(data)
    }

    async fn copy_out(&self, container: &ContainerHandle, src: &str, dest: &Path) -> Result<()> {
        let source = format!("{}:{}", container.name, src);
        let dest = dest.to_string_lossy();
        self.exec_checked("cp", &container.name, &["cp", &source, &dest])
            .await
            .map(|_| ())
    }

    async fn stats(&self) -> Result<String> {
        self.exec_checked(
            "stats",
            "all",
            &["stats", "--no-stream", "--format", crate::stats::DOCKER_STATS_FORMAT],
        )
        .await
    }
}
