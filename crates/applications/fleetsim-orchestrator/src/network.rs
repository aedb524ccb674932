//! Network impairment through the docker-tc sidecar
//!
//! A single `docker-tc` container watches for containers labelled
//! `com.docker-tc.enabled=1` and applies tc qdiscs to their interfaces. The
//! controller starts it, registers every device container with the shaping
//! parameters, and queries the active rules once as a sanity check.

use crate::config::NetworkRule;
use crate::container::{ContainerHandle, ContainerRuntime, ContainerStatus, RestartPolicy, RunSpec};
use crate::error::{Result, SimulationError};
use reqwest::{Method, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Sidecar container name
pub const SIDECAR_NAME: &str = "docker-tc";

/// Sidecar image
pub const SIDECAR_IMAGE: &str = "lukaszlach/docker-tc";

/// Sidecar HTTP API
pub const SIDECAR_URL: &str = "http://localhost:4080";

/// Kernel timer frequency the token bucket is refilled at
pub const KERNEL_HZ: u64 = 250;

/// Queueing latency of the token-bucket filter
pub const TBF_LATENCY: &str = "50ms";

/// Interval between sidecar status checks
pub const STATUS_POLL_SECS: u64 = 5;

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Parse a rate such as `8mbps` or `512KBps` into bits per second.
///
/// Bit units (`bps`, `kbps`, `mbit`, `gbitps`, ...) are case-insensitive.
/// Byte units (`Bps`, `KBps`, `kBps`, `MBps`, `GBps`) are case-sensitive, since
/// the capital `B` is the only thing telling them apart. Multipliers are binary.
pub fn parse_rate(rate: &str) -> Result<u64> {
    let rate = rate.trim();
    let split = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rate.len());
    let (digits, unit) = rate.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| SimulationError::value(format!("invalid rate '{}'", rate)))?;

    let bytes_per_sec = match unit {
        "Bps" => Some(1),
        "KBps" | "kBps" => Some(1 << 10),
        "MBps" => Some(1 << 20),
        "GBps" => Some(1 << 30),
        _ => None,
    };
    if let Some(multiplier) = bytes_per_sec {
        return scale(value, multiplier * 8, rate);
    }

    let multiplier: u64 = match unit.to_ascii_lowercase().as_str() {
        "bps" | "bit" | "bitps" => 1,
        "kbps" | "kbit" | "kbitps" => 1 << 10,
        "mbps" | "mbit" | "mbitps" => 1 << 20,
        "gbps" | "gbit" | "gbitps" => 1 << 30,
        _ => {
            return Err(SimulationError::value(format!(
                "invalid rate unit '{}' in '{}'",
                unit, rate
            )));
        }
    };

    scale(value, multiplier, rate)
}

fn scale(value: u64, multiplier: u64, rate: &str) -> Result<u64> {
    value
        .checked_mul(multiplier)
        .ok_or_else(|| SimulationError::value(format!("rate '{}' is out of range", rate)))
}

/// Token-bucket burst for a rate, formatted as `"<n>kb"`
///
/// One timer tick must be able to drain a full tick's worth of traffic, so the
/// burst is the per-tick volume rounded up to a multiple of 5 KB.
pub fn calculate_burst(rate: &str) -> Result<String> {
    let bits_per_tick = parse_rate(rate)? / KERNEL_HZ;
    let bytes = bits_per_tick / 8;
    let kb = bytes.div_ceil(1024).max(1);
    let burst = kb.div_ceil(5) * 5;
    debug!(rate, bits_per_tick, burst, "Computed token-bucket burst");
    Ok(format!("{}kb", burst))
}

/// Owner of the shaping sidecar
pub struct NetworkController {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    sidecar: Option<ContainerHandle>,
}

impl NetworkController {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            runtime,
            client,
            base_url: SIDECAR_URL.to_string(),
            poll_interval: Duration::from_secs(STATUS_POLL_SECS),
            sidecar: None,
        })
    }

    /// Point the controller at a different sidecar API
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The running sidecar, once started
    pub fn sidecar(&self) -> Option<&ContainerHandle> {
        self.sidecar.as_ref()
    }

    fn sidecar_spec(rule: Option<&NetworkRule>) -> Result<RunSpec> {
        let mut spec = RunSpec::new(SIDECAR_IMAGE, SIDECAR_NAME)
            .with_network("host")
            .with_restart(RestartPolicy::Always)
            .with_cap_add("NET_ADMIN")
            .with_volume("/var/run/docker.sock", "/var/run/docker.sock", false)
            .with_volume("/var/docker-tc", "/var/docker-tc", false);

        if let Some(rate) = rule.and_then(NetworkRule::rate) {
            spec = spec
                .with_env("TC_QDISC_TBF_BURST", calculate_burst(rate)?)
                .with_env("TC_QDISC_TBF_LATENCY", TBF_LATENCY);
        }

        Ok(spec)
    }

    /// Start the sidecar and wait until it is running
    pub async fn init(&mut self, rule: Option<&NetworkRule>) -> Result<()> {
        let spec = Self::sidecar_spec(rule)?;
        info!("Starting {} container", SIDECAR_NAME);
        let sidecar = self.runtime.run(&spec).await?;
        self.sidecar = Some(sidecar.clone());

        loop {
            match self.runtime.status(&sidecar).await? {
                ContainerStatus::Running => {
                    info!("{} container is running", SIDECAR_NAME);
                    return Ok(());
                }
                ContainerStatus::Exited | ContainerStatus::Dead => {
                    return Err(SimulationError::runtime(format!(
                        "{} container exited before reaching running",
                        SIDECAR_NAME
                    )));
                }
                other => debug!("{} container is {:?}. Waiting...", SIDECAR_NAME, other),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Start the sidecar and apply `rule` to every target container
    pub async fn simulate(&mut self, rule: &NetworkRule, targets: &[ContainerHandle]) -> Result<()> {
        self.init(Some(rule)).await?;

        let body = rule.form_body();
        for target in targets {
            let url = format!("{}/{}", self.base_url, target.short_id());
            if let Err(e) = self.client.put(&url).send().await {
                warn!("[{}] Failed to register container: {}", target.name, e);
            }

            let url = format!("{}/{}", self.base_url, target.name);
            match self
                .client
                .post(&url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.clone())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    info!(container = %target.name, rule = %body, "Network rule applied");
                }
                Ok(response) => warn!(
                    "[{}] Network rule rejected with {}",
                    target.name,
                    response.status()
                ),
                Err(e) => warn!("[{}] Failed to apply network rule: {}", target.name, e),
            }
        }

        self.verify_rules().await
    }

    /// `LIST /` on the sidecar; anything but 200 means the rules are unconfirmed
    async fn verify_rules(&self) -> Result<()> {
        let list = Method::from_bytes(b"LIST")
            .map_err(|e| SimulationError::runtime(format!("LIST method: {}", e)))?;
        let url = format!("{}/", self.base_url);

        match self.client.request(list, &url).send().await {
            Ok(response) if response.status() == StatusCode::OK => {
                let rules = response.text().await.unwrap_or_default();
                info!("Active network rules: {}", rules.trim());
                Ok(())
            }
            Ok(response) => Err(SimulationError::runtime(format!(
                "{} answered {} to LIST",
                SIDECAR_NAME,
                response.status()
            ))),
            Err(e) => Err(SimulationError::runtime(format!(
                "{} unreachable: {}",
                SIDECAR_NAME, e
            ))),
        }
    }

    /// Force-remove a sidecar left over from an earlier run
    pub async fn remove_stale_container(&self) -> Result<()> {
        match self.runtime.get(SIDECAR_NAME).await {
            Ok(stale) => {
                info!("Removing stale {} container", SIDECAR_NAME);
                self.runtime.remove(&stale, true).await
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Save sidecar logs under `output/docker-tc/` and remove it
    pub async fn store_and_cleanup(&mut self, output: &Path) {
        self.sidecar = None;

        let sidecar = match self.runtime.get(SIDECAR_NAME).await {
            Ok(sidecar) => sidecar,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                error!("Failed to look up {} container: {}", SIDECAR_NAME, e);
                return;
            }
        };

        let dir = output.join(SIDECAR_NAME);
        match self.runtime.logs(&sidecar).await {
            Ok(data) => {
                let written = match tokio::fs::create_dir_all(&dir).await {
                    Ok(()) => tokio::fs::write(dir.join("logs.txt"), data).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok(()) => info!("{} logs saved to {}", SIDECAR_NAME, dir.display()),
                    Err(e) => error!("Failed to write {} logs: {}", SIDECAR_NAME, e),
                }
            }
            Err(e) => error!("Failed to fetch {} logs: {}", SIDECAR_NAME, e),
        }

        if let Err(e) = self.runtime.remove(&sidecar, true).await {
            error!("Failed to remove {} container: {}", SIDECAR_NAME, e);
        }
    }
}
