//! Capability sets of the pluggable server and device adapters
//!
//! The orchestrator only ever talks to these traits. Implementations are
//! resolved by [`crate::loader::DriverRegistry`]: built-ins such as
//! [`crate::fleet::DeviceFleet`] and [`crate::compose::ComposeServer`], or
//! external executables wrapped by [`crate::exec`].

use crate::container::ContainerHandle;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// The fleet-management platform under test
#[async_trait]
pub trait ServerAdapter: Send + Sync {
    /// Bring the platform up and wait until it accepts devices
    async fn start(&mut self) -> Result<()>;

    /// Kick off the configured task (e.g. an update rollout)
    async fn trigger(&mut self) -> Result<()>;

    /// Persist platform logs under `output` and tear the platform down.
    ///
    /// Best effort: failures are logged, never returned.
    async fn store_and_cleanup(&mut self, output: &Path);
}

/// The simulated device population
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Provision the device containers and wait until they are ready
    async fn setup(&mut self) -> Result<()>;

    /// Connect the devices to the platform
    async fn start(&mut self) -> Result<()>;

    /// Block until every device container has exited
    async fn wait_finish(&mut self) -> Result<()>;

    /// Persist logs and results under `output`, then remove the containers.
    ///
    /// Best effort: failures are logged, never returned.
    async fn store_and_cleanup(&mut self, output: &Path);

    /// Containers network shaping applies to
    async fn containers(&self) -> Result<Vec<ContainerHandle>>;
}
