//! Driver resolution
//!
//! A driver reference is either `builtin:<name>` or a filesystem path to an
//! executable speaking the protocol in [`crate::exec`].

use crate::adapter::{DeviceAdapter, ServerAdapter};
use crate::compose::ComposeServer;
use crate::config::SimulationConfig;
use crate::container::ContainerRuntime;
use crate::error::{Result, SimulationError};
use crate::exec::{ExecDevices, ExecServer};
use crate::fleet::DeviceFleet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Prefix of built-in driver references
pub const BUILTIN_PREFIX: &str = "builtin:";

/// Built-in compose server driver
pub const COMPOSE_DRIVER: &str = "compose";

/// Built-in device fleet driver
pub const FLEET_DRIVER: &str = "fleet";

/// A parsed driver reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRef {
    Builtin(String),
    Executable(PathBuf),
}

impl DriverRef {
    pub fn parse(reference: &str) -> Self {
        match reference.strip_prefix(BUILTIN_PREFIX) {
            Some(name) => Self::Builtin(name.to_string()),
            None => Self::Executable(PathBuf::from(reference)),
        }
    }
}

/// What a driver factory gets to work with
#[derive(Clone)]
pub struct DriverContext {
    pub config: Arc<SimulationConfig>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

pub type ServerFactory = fn(&DriverContext) -> Result<Box<dyn ServerAdapter>>;
pub type DeviceFactory = fn(&DriverContext) -> Result<Box<dyn DeviceAdapter>>;

fn compose_server(ctx: &DriverContext) -> Result<Box<dyn ServerAdapter>> {
    Ok(Box::new(ComposeServer::from_config(
        ctx.runtime.clone(),
        &ctx.config,
    )?))
}

fn device_fleet(ctx: &DriverContext) -> Result<Box<dyn DeviceAdapter>> {
    Ok(Box::new(DeviceFleet::new(
        ctx.runtime.clone(),
        ctx.config.clone(),
    )?))
}

/// Registry of built-in adapters
pub struct DriverRegistry {
    servers: HashMap<String, ServerFactory>,
    devices: HashMap<String, DeviceFactory>,
}

impl DriverRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
            devices: HashMap::new(),
        }
    }

    /// A registry holding `builtin:compose` and `builtin:fleet`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_server(COMPOSE_DRIVER, compose_server);
        registry.register_devices(FLEET_DRIVER, device_fleet);
        registry
    }

    pub fn register_server(&mut self, name: impl Into<String>, factory: ServerFactory) {
        self.servers.insert(name.into(), factory);
    }

    pub fn register_devices(&mut self, name: impl Into<String>, factory: DeviceFactory) {
        self.devices.insert(name.into(), factory);
    }

    /// Resolve `server.driver`
    ///
    /// Without a driver, a configured compose file selects the compose driver.
    pub async fn load_server(&self, ctx: &DriverContext) -> Result<Box<dyn ServerAdapter>> {
        let reference = match (&ctx.config.server.driver, &ctx.config.server.docker_compose) {
            (Some(driver), _) => DriverRef::parse(driver),
            (None, Some(_)) => DriverRef::Builtin(COMPOSE_DRIVER.to_string()),
            (None, None) => {
                return Err(SimulationError::import(
                    "Unspecified server driver: set server.driver or server.dockerCompose",
                ));
            }
        };
        info!(?reference, "Loading server driver");

        match reference {
            DriverRef::Builtin(name) => {
                let factory = self.servers.get(&name).ok_or_else(|| {
                    SimulationError::import(format!("unknown built-in server driver '{}'", name))
                })?;
                factory(ctx)
            }
            DriverRef::Executable(path) => {
                Ok(Box::new(ExecServer::load(&path, &ctx.config.raw).await?))
            }
        }
    }

    /// Resolve `client.driver`, defaulting to the device fleet
    pub async fn load_devices(&self, ctx: &DriverContext) -> Result<Box<dyn DeviceAdapter>> {
        let reference = ctx
            .config
            .client
            .driver
            .as_deref()
            .map(DriverRef::parse)
            .unwrap_or_else(|| DriverRef::Builtin(FLEET_DRIVER.to_string()));
        info!(?reference, "Loading device driver");

        match reference {
            DriverRef::Builtin(name) => {
                let factory = self.devices.get(&name).ok_or_else(|| {
                    SimulationError::import(format!("unknown built-in device driver '{}'", name))
                })?;
                factory(ctx)
            }
            DriverRef::Executable(path) => Ok(Box::new(
                ExecDevices::load(&path, &ctx.config.raw, ctx.runtime.clone()).await?,
            )),
        }
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
