//! Built-in server adapter backed by `docker compose`
//!
//! Brings the platform stack up from a compose file, waits until its HTTP
//! endpoint answers 200, and on cleanup saves the logs of every container the
//! compose file created before tearing the stack (and its volumes) down.

use crate::adapter::ServerAdapter;
use crate::config::SimulationConfig;
use crate::container::{ContainerFilter, ContainerRuntime};
use crate::error::{Result, SimulationError};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info};

/// Label docker compose puts on every container it creates
pub const COMPOSE_CONFIG_LABEL: &str = "com.docker.compose.project.config_files";

/// Interval between health checks of the server endpoint
pub const HEALTH_POLL_SECS: u64 = 10;

/// Platform started from a compose file
pub struct ComposeServer {
    runtime: Arc<dyn ContainerRuntime>,
    compose_file: PathBuf,
    endpoint: Option<String>,
    binary: String,
    client: reqwest::Client,
    poll_interval: Duration,
}

impl ComposeServer {
    /// Build from the `server` section; `dockerCompose` is required
    pub fn from_config(
        runtime: Arc<dyn ContainerRuntime>,
        config: &SimulationConfig,
    ) -> Result<Self> {
        let compose_file = config.server.docker_compose.as_ref().ok_or_else(|| {
            SimulationError::import("server.dockerCompose is required by the compose driver")
        })?;

        Ok(Self {
            runtime,
            compose_file: std::path::absolute(compose_file)?,
            endpoint: config.server.endpoint.clone(),
            binary: "docker".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HEALTH_POLL_SECS))
                .build()?,
            poll_interval: Duration::from_secs(HEALTH_POLL_SECS),
        })
    }

    /// Use a specific docker-compatible binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn compose(&self, args: &[&str]) -> Result<()> {
        let file = self.compose_file.to_string_lossy();
        let mut full = vec!["compose", "-f", file.as_ref()];
        full.extend_from_slice(args);
        debug!("{} {:?}", self.binary, full);

        let status = AsyncCommand::new(&self.binary)
            .args(&full)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| SimulationError::docker(format!("Failed to run {}: {}", self.binary, e)))?;

        if !status.success() {
            return Err(SimulationError::docker(format!(
                "docker compose {} exited with {}",
                args.join(" "),
                status
            )));
        }
        Ok(())
    }

    /// Poll `http://<endpoint>` until it answers 200
    async fn wait_healthy(&self, endpoint: &str) {
        let url = format!("http://{}", endpoint);
        loop {
            match self.client.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    info!("Server is ready.");
                    return;
                }
                Ok(response) => info!("Server is not ready: HTTP {}", response.status()),
                Err(e) => info!("Server is not ready: {}", e),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn save_logs(&self, output: &Path) -> Result<()> {
        tokio::fs::create_dir_all(output).await?;

        let filter = ContainerFilter::Label(
            COMPOSE_CONFIG_LABEL.to_string(),
            self.compose_file.to_string_lossy().to_string(),
        );
        for container in self.runtime.list(&filter).await? {
            let file = output.join(format!("{}_logs.txt", container.name));
            match self.runtime.logs(&container).await {
                Ok(data) => {
                    tokio::fs::write(&file, data).await?;
                    info!("[{}] Logs saved to {}", container.name, file.display());
                }
                Err(e) => error!("[{}] Failed to fetch logs: {}", container.name, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ServerAdapter for ComposeServer {
    async fn start(&mut self) -> Result<()> {
        info!("Starting server...");
        self.compose(&["up", "-d"])
            .await
            .map_err(|e| SimulationError::provisioning(format!("Fail to start server containers: {}", e)))?;

        match &self.endpoint {
            Some(endpoint) => self.wait_healthy(endpoint).await,
            None => info!("No server endpoint configured, not waiting for readiness"),
        }
        Ok(())
    }

    async fn trigger(&mut self) -> Result<()> {
        info!("Compose server has no task to trigger");
        Ok(())
    }

    async fn store_and_cleanup(&mut self, output: &Path) {
        if let Err(e) = self.save_logs(output).await {
            error!("Failed to save server logs: {}", e);
        }

        info!("Stopping server...");
        if let Err(e) = self.compose(&["down", "-v"]).await {
            error!("Fail to stop server containers: {}", e);
        }
    }
}
