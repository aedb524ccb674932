//! Device fleet lifecycle
//!
//! The default device adapter. A population of simulated devices is spread
//! over N `device-simulator` containers; each container runs an HTTP control
//! server on `base_port + index`:
//!
//! ```text
//! GET  /ready      200 once every device is registered, 503 before
//! GET  /connected  200 once every device is connected,  503 before
//! POST /start      connect the devices to the platform
//! POST /stop       stop the simulation inside the container
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Setup**: ensure the network, replace same-named containers, run the
//!    workers, poll `/ready`
//! 2. **Start**: `POST /start`, poll `/connected` (parallel or sequential)
//! 3. **Wait**: collect exit codes; exit 0 marks a worker finished
//! 4. **Cleanup**: save logs, copy results of finished workers, stop, remove
//!
//! Polling has no timeout of its own; the global simulation timeout bounds it.

use crate::adapter::DeviceAdapter;
use crate::config::{SimulationConfig, StartMode};
use crate::container::{ContainerFilter, ContainerHandle, ContainerRuntime, ContainerStatus, RunSpec};
use crate::error::{Result, SimulationError};
use crate::partition::{plan_workers, WorkerSpec};
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Name prefix of worker containers; worker i is `device-simulator-{i}`
pub const CONTAINER_NAME_PREFIX: &str = "device-simulator";

/// Mount point of the device template inside a worker
pub const CONTAINER_TEMPLATE_PATH: &str = "/app/plugin";

/// Results directory copied out of finished workers
pub const CONTAINER_RESULTS_PATH: &str = "/app/results/.";

/// Environment variables handed to each worker
pub const ENV_CLIENT_NUM: &str = "CLIENT_NUM";
pub const ENV_IDX_OFFSET: &str = "IDX_OFFSET";
pub const ENV_INFLUENCE: &str = "INFLUENCE";
pub const ENV_PORT: &str = "STATUS_SERVER_PORT";
pub const ENV_CONFIG: &str = "CONFIG";

/// Label that makes the shaping sidecar pick a container up
pub const SHAPING_LABEL: (&str, &str) = ("com.docker-tc.enabled", "1");

/// Host the worker control ports are published on
pub const SIMULATOR_ENDPOINT_HOST: &str = "localhost";

/// Interval between readiness/connectivity polls
pub const POLL_INTERVAL_SECS: u64 = 10;

/// Grace period of `docker stop` during cleanup
pub const STOP_GRACE_SECS: u64 = 10;

/// Per-request timeout of control calls; a timeout counts as a transport failure
const REQUEST_TIMEOUT_SECS: u64 = 10;

fn control_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

/// A provisioned worker
#[derive(Debug, Clone)]
struct Worker {
    spec: WorkerSpec,
    container: ContainerHandle,
    finished: bool,
}

/// Default device adapter: a fleet of device-simulator containers
pub struct DeviceFleet {
    runtime: Arc<dyn ContainerRuntime>,
    config: Arc<SimulationConfig>,
    client: reqwest::Client,
    host: String,
    poll_interval: Duration,
    workers: Vec<Worker>,
}

impl DeviceFleet {
    /// Create a fleet manager for a configuration
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: Arc<SimulationConfig>) -> Result<Self> {
        Ok(Self {
            runtime,
            config,
            client: control_client(Duration::from_secs(REQUEST_TIMEOUT_SECS))?,
            host: SIMULATOR_ENDPOINT_HOST.to_string(),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            workers: Vec::new(),
        })
    }

    /// Set the per-request timeout of control calls
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = control_client(timeout)?;
        Ok(self)
    }

    /// Set the host worker control ports are reached on
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the polling interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handles of the provisioned worker containers
    pub fn worker_containers(&self) -> Vec<ContainerHandle> {
        self.workers.iter().map(|w| w.container.clone()).collect()
    }

    /// Names of workers that exited successfully
    pub fn finished_workers(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|w| w.finished)
            .map(|w| w.container.name.clone())
            .collect()
    }

    fn url(&self, worker: &Worker, endpoint: &str) -> String {
        format!("http://{}:{}/{}", self.host, worker.spec.port, endpoint)
    }

    /// Build the container definition of a worker
    fn run_spec(&self, spec: &WorkerSpec) -> Result<RunSpec> {
        let client = &self.config.client;
        let name = format!("{}-{}", CONTAINER_NAME_PREFIX, spec.index);

        let mut run = RunSpec::new(&client.image, name)
            .with_network(&client.network)
            .with_port(spec.port, spec.port)
            .with_env(ENV_CONFIG, &self.config.raw)
            .with_env(ENV_CLIENT_NUM, spec.devices)
            .with_env(ENV_IDX_OFFSET, spec.offset)
            .with_env(ENV_INFLUENCE, serde_json::to_string(&spec.influence)?)
            .with_env(ENV_PORT, spec.port)
            .with_label(SHAPING_LABEL.0, SHAPING_LABEL.1);

        if let Some(template) = &client.template {
            let template = std::path::absolute(template)?;
            run = run.with_volume(template.to_string_lossy(), CONTAINER_TEMPLATE_PATH, true);
        }

        Ok(run)
    }

    /// Remove containers (running or not) that carry a worker's name
    async fn remove_duplicated_container(&self, name: &str) -> Result<()> {
        for container in self.runtime.list(&ContainerFilter::Name(name.to_string())).await? {
            info!("Container {} already exists. Removing it.", container.name);
            self.runtime.remove(&container, true).await?;
        }
        Ok(())
    }

    /// Poll `endpoint` on each worker in order until it answers 200.
    async fn wait_state(&self, workers: &[Worker], endpoint: &str) -> Result<()> {
        for worker in workers {
            let url = self.url(worker, endpoint);
            let name = &worker.container.name;

            loop {
                match self.client.get(&url).send().await {
                    Ok(response) if response.status() == StatusCode::OK => {
                        debug!("[{}] Positive response from {}", name, url);
                        break;
                    }
                    Ok(response) if response.status() == StatusCode::SERVICE_UNAVAILABLE => {
                        debug!("[{}] Negative response from {}. Waiting...", name, url);
                    }
                    Ok(response) => {
                        warn!(
                            "[{}] Unexpected HTTP code {} from {}. Waiting...",
                            name,
                            response.status(),
                            url
                        );
                    }
                    Err(e) => match self.runtime.status(&worker.container).await {
                        Ok(ContainerStatus::Exited) | Ok(ContainerStatus::Dead) => {
                            return Err(SimulationError::worker_failure(name, e.to_string()));
                        }
                        Err(status_err) if status_err.is_not_found() => {
                            return Err(SimulationError::worker_failure(name, e.to_string()));
                        }
                        Ok(_) => {
                            debug!("[{}] No response from {}: {}. Waiting...", name, url, e);
                        }
                        Err(status_err) => {
                            warn!("[{}] Failed to inspect container: {}", name, status_err);
                        }
                    },
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        }

        Ok(())
    }

    /// `POST /start` on one worker
    async fn start_worker(&self, worker: &Worker) -> Result<()> {
        let url = self.url(worker, "start");
        let name = &worker.container.name;

        match self.client.post(&url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                info!("[{}] Devices connection to server started", name);
                Ok(())
            }
            Ok(response) => {
                error!("[{}] Failed to start devices connection to server", name);
                Err(SimulationError::connection(format!(
                    "{} answered {} to start",
                    name,
                    response.status()
                )))
            }
            Err(e) => {
                error!("[{}] Failed to start devices connection to server", name);
                Err(SimulationError::connection(format!("{}: {}", name, e)))
            }
        }
    }

    async fn store_logs(&self, output: &Path) {
        for worker in &self.workers {
            let name = &worker.container.name;
            let dir = output.join(name);

            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                error!("[{}] Failed to create {}: {}", name, dir.display(), e);
                continue;
            }

            match self.runtime.logs(&worker.container).await {
                Ok(data) => match tokio::fs::write(dir.join("logs.txt"), data).await {
                    Ok(()) => info!("[{}] Logs saved to {}", name, dir.display()),
                    Err(e) => error!("[{}] Failed to write logs: {}", name, e),
                },
                Err(e) => error!("[{}] Failed to fetch logs: {}", name, e),
            }
        }
    }

    async fn store_results(&self, output: &Path) {
        for worker in self.workers.iter().filter(|w| w.finished) {
            let name = &worker.container.name;
            let dir = output.join(name);

            match self
                .runtime
                .copy_out(&worker.container, CONTAINER_RESULTS_PATH, &dir)
                .await
            {
                Ok(()) => info!("[{}] Analysis saved to {}", name, dir.display()),
                Err(e) => error!("[{}] Failed to save simulation analysis: {}", name, e),
            }
        }
    }

    async fn stop_workers(&self) {
        for worker in &self.workers {
            let name = &worker.container.name;

            match self.runtime.status(&worker.container).await {
                Ok(ContainerStatus::Running) => {
                    info!("[{}] Stopping container...", name);
                    if let Err(e) = self.client.post(self.url(worker, "stop")).send().await {
                        debug!("[{}] Stop notification failed: {}", name, e);
                    }
                    match self
                        .runtime
                        .stop(&worker.container, Duration::from_secs(STOP_GRACE_SECS))
                        .await
                    {
                        Ok(()) => info!("[{}] Container stopped", name),
                        Err(e) => error!("[{}] Container stopped with error: {}", name, e),
                    }
                }
                Ok(_) => info!("[{}] Container already stopped", name),
                Err(e) => warn!("[{}] Failed to inspect container: {}", name, e),
            }
        }
    }

    async fn remove_workers(&self) {
        for worker in &self.workers {
            if let Err(e) = self.runtime.remove(&worker.container, true).await {
                error!("[{}] Failed to remove container: {}", worker.container.name, e);
            }
        }
    }

    /// Remove worker containers started but never tracked, e.g. when setup was
    /// abandoned while `docker run` was in flight.
    async fn sweep_untracked(&self) {
        for index in 0..self.config.client.number_of_containers {
            let name = format!("{}-{}", CONTAINER_NAME_PREFIX, index);
            let found = match self.runtime.list(&ContainerFilter::Name(name.clone())).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("[{}] Failed to look up container: {}", name, e);
                    continue;
                }
            };
            for container in found {
                if self.workers.iter().any(|w| w.container.id == container.id) {
                    continue;
                }
                info!("[{}] Removing untracked container", name);
                if let Err(e) = self.runtime.remove(&container, true).await {
                    error!("[{}] Failed to remove container: {}", name, e);
                }
            }
        }
    }
}

#[async_trait]
impl DeviceAdapter for DeviceFleet {
    async fn setup(&mut self) -> Result<()> {
        let network = self.config.client.network.clone();
        self.runtime
            .ensure_network(&network)
            .await
            .map_err(|e| match e {
                SimulationError::Provisioning(_) => e,
                other => SimulationError::provisioning(format!("Network {}: {}", network, other)),
            })?;

        let plan = plan_workers(&self.config)?;
        info!(
            "Start simulation in container mode. {} container(s) with total {} device(s) to be created.",
            plan.len(),
            self.config.client.number_of_devices
        );

        for spec in plan {
            let run = self.run_spec(&spec)?;
            info!(
                worker = spec.index,
                devices = spec.devices,
                offset = spec.offset,
                dummy_work = spec.influence.dummy_work,
                crash = spec.influence.crash,
                "Creating {}",
                run.name
            );

            self.remove_duplicated_container(&run.name)
                .await
                .map_err(|e| SimulationError::provisioning(format!("{}: {}", run.name, e)))?;

            let container = self.runtime.run(&run).await.map_err(|e| match e {
                SimulationError::Provisioning(_) => e,
                other => SimulationError::provisioning(format!("{}: {}", run.name, other)),
            })?;

            self.workers.push(Worker {
                spec,
                container,
                finished: false,
            });
        }

        self.wait_state(&self.workers, "ready").await
    }

    async fn start(&mut self) -> Result<()> {
        match self.config.client.container_start_mode {
            StartMode::Parallel => {
                try_join_all(self.workers.iter().map(|w| self.start_worker(w))).await?;
                info!("Waiting for containers connection to the server...");
                self.wait_state(&self.workers, "connected").await
            }
            StartMode::Sequential => {
                for worker in &self.workers {
                    self.start_worker(worker).await?;
                    info!("Waiting for container connection to the server...");
                    self.wait_state(std::slice::from_ref(worker), "connected").await?;
                }
                Ok(())
            }
        }
    }

    async fn wait_finish(&mut self) -> Result<()> {
        for worker in self.workers.iter_mut() {
            let name = &worker.container.name;
            match self.runtime.wait(&worker.container).await {
                Ok(0) => {
                    info!("{} finished successfully", name);
                    worker.finished = true;
                }
                Ok(code) => warn!("{} ends with error. Exit code: {}", name, code),
                Err(e) => error!("Failed to wait for {}: {}", name, e),
            }
        }
        Ok(())
    }

    async fn store_and_cleanup(&mut self, output: &Path) {
        self.store_logs(output).await;
        self.store_results(output).await;
        self.stop_workers().await;
        self.remove_workers().await;
        self.sweep_untracked().await;
        self.workers.clear();
    }

    async fn containers(&self) -> Result<Vec<ContainerHandle>> {
        Ok(self.worker_containers())
    }
}
