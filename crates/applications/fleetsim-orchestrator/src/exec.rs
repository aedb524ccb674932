//! External executable drivers
//!
//! Any executable can act as a server or device adapter. On load the driver is
//! asked to describe itself:
//!
//! ```text
//! $ ./my-driver describe
//! {"kind": "server", "capabilities": ["start", "trigger", "store-and-cleanup"]}
//! ```
//!
//! Each capability is then invoked as a subcommand with the raw YAML
//! configuration in `FLEETSIM_CONFIG`. `store-and-cleanup` receives the output
//! directory as its argument; `containers` prints a JSON array of container
//! names. A non-zero exit fails the capability.

use crate::adapter::{DeviceAdapter, ServerAdapter};
use crate::container::{ContainerHandle, ContainerRuntime};
use crate::error::{Result, SimulationError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, error, info};

/// Environment variable carrying the raw YAML configuration
pub const CONFIG_ENV: &str = "FLEETSIM_CONFIG";

/// Capabilities a server driver must provide
pub const SERVER_CAPABILITIES: &[&str] = &["start", "trigger", "store-and-cleanup"];

/// Capabilities a device driver must provide
pub const DEVICE_CAPABILITIES: &[&str] =
    &["setup", "start", "wait-finish", "store-and-cleanup", "containers"];

/// Which adapter an executable implements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Server,
    Devices,
}

impl DriverKind {
    fn required_capabilities(self) -> &'static [&'static str] {
        match self {
            Self::Server => SERVER_CAPABILITIES,
            Self::Devices => DEVICE_CAPABILITIES,
        }
    }
}

/// Output of `<driver> describe`
#[derive(Debug, Clone, Deserialize)]
pub struct DriverManifest {
    pub kind: DriverKind,
    pub capabilities: Vec<String>,
}

/// A validated driver executable
#[derive(Debug, Clone)]
pub struct ExecDriver {
    path: PathBuf,
    config: String,
}

fn is_executable(metadata: &std::fs::Metadata) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        metadata.is_file()
    }
}

/// Error class of a failed capability
fn capability_error(verb: &str, msg: String) -> SimulationError {
    match verb {
        "setup" => SimulationError::provisioning(msg),
        "start" | "trigger" => SimulationError::connection(msg),
        _ => SimulationError::runtime(msg),
    }
}

impl ExecDriver {
    /// Resolve `path` as a driver of `kind`
    pub async fn load(path: &Path, kind: DriverKind, config: &str) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            SimulationError::import(format!("driver {} not found: {}", path.display(), e))
        })?;
        if !is_executable(&metadata) {
            return Err(SimulationError::import(format!(
                "driver {} is not executable",
                path.display()
            )));
        }

        let driver = Self {
            path: path.to_path_buf(),
            config: config.to_string(),
        };

        let stdout = driver
            .output("describe", &[])
            .await
            .map_err(|e| SimulationError::import(format!("driver {}: {}", path.display(), e)))?;
        let manifest: DriverManifest = serde_json::from_str(&stdout).map_err(|e| {
            SimulationError::import(format!(
                "driver {} printed an invalid description: {}",
                path.display(),
                e
            ))
        })?;

        if manifest.kind != kind {
            return Err(SimulationError::import(format!(
                "driver {} is a {:?} driver, expected {:?}",
                path.display(),
                manifest.kind,
                kind
            )));
        }
        for capability in kind.required_capabilities() {
            if !manifest.capabilities.iter().any(|c| c == capability) {
                return Err(SimulationError::import(format!(
                    "driver {} lacks capability '{}'",
                    path.display(),
                    capability
                )));
            }
        }

        info!(driver = %path.display(), ?kind, "Loaded executable driver");
        Ok(driver)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a subcommand and return its stdout; the error carries stderr
    async fn output(&self, verb: &str, args: &[&str]) -> std::result::Result<String, String> {
        debug!("{} {} {:?}", self.path.display(), verb, args);
        let output = AsyncCommand::new(&self.path)
            .arg(verb)
            .args(args)
            .env(CONFIG_ENV, &self.config)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run '{}': {}", verb, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("'{}' exited with {}: {}", verb, output.status, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Invoke a capability, mapping failures to its error class
    pub async fn invoke(&self, verb: &str, args: &[&str]) -> Result<String> {
        self.output(verb, args).await.map_err(|msg| {
            capability_error(verb, format!("driver {}: {}", self.path.display(), msg))
        })
    }

    async fn store_and_cleanup(&self, output: &Path) {
        if let Err(e) = tokio::fs::create_dir_all(output).await {
            error!("Failed to create {}: {}", output.display(), e);
        }
        let dir = output.to_string_lossy();
        if let Err(e) = self.invoke("store-and-cleanup", &[dir.as_ref()]).await {
            error!("{}", e);
        }
    }
}

/// Server adapter backed by an executable
pub struct ExecServer {
    driver: ExecDriver,
}

impl ExecServer {
    pub async fn load(path: &Path, config: &str) -> Result<Self> {
        Ok(Self {
            driver: ExecDriver::load(path, DriverKind::Server, config).await?,
        })
    }
}

#[async_trait]
impl ServerAdapter for ExecServer {
    async fn start(&mut self) -> Result<()> {
        self.driver.invoke("start", &[]).await.map(|_| ())
    }

    async fn trigger(&mut self) -> Result<()> {
        self.driver.invoke("trigger", &[]).await.map(|_| ())
    }

    async fn store_and_cleanup(&mut self, output: &Path) {
        self.driver.store_and_cleanup(output).await
    }
}

/// Device adapter backed by an executable
pub struct ExecDevices {
    driver: ExecDriver,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ExecDevices {
    pub async fn load(path: &Path, config: &str, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        Ok(Self {
            driver: ExecDriver::load(path, DriverKind::Devices, config).await?,
            runtime,
        })
    }
}

#[async_trait]
impl DeviceAdapter for ExecDevices {
    async fn setup(&mut self) -> Result<()> {
        self.driver.invoke("setup", &[]).await.map(|_| ())
    }

    async fn start(&mut self) -> Result<()> {
        self.driver.invoke("start", &[]).await.map(|_| ())
    }

    async fn wait_finish(&mut self) -> Result<()> {
        self.driver.invoke("wait-finish", &[]).await.map(|_| ())
    }

    async fn store_and_cleanup(&mut self, output: &Path) {
        self.driver.store_and_cleanup(output).await
    }

    async fn containers(&self) -> Result<Vec<ContainerHandle>> {
        let stdout = self.driver.invoke("containers", &[]).await?;
        let names: Vec<String> = serde_json::from_str(&stdout).map_err(|e| {
            SimulationError::runtime(format!(
                "driver {} printed an invalid container list: {}",
                self.driver.path().display(),
                e
            ))
        })?;

        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            handles.push(self.runtime.get(&name).await?);
        }
        Ok(handles)
    }
}
