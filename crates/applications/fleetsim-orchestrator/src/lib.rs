//! # Fleetsim Orchestrator
//!
//! Large-scale IoT fleet simulations against a fleet-management platform,
//! with every participant running as a container.
//!
//! ## Architecture
//!
//! ```text
//! Simulation (state machine)
//! ├── ServerAdapter   ── compose stack / executable driver
//! ├── DeviceAdapter   ── DeviceFleet: N device-simulator containers
//! │                      GET /ready, POST /start, GET /connected, POST /stop
//! └── NetworkController ── docker-tc sidecar (rate, delay, loss...)
//!          │
//!          └── ContainerRuntime (docker CLI)
//! ```
//!
//! ## Run
//!
//! 1. **Setup**: server start, device provisioning, stale sidecar removal,
//!    network shaping when a rule is configured
//! 2. **Trigger**: device start; with a task, server trigger and wait for the
//!    devices to finish
//! 3. **Cleanup**: devices, server, network, exactly once, whatever happened
//!    before (failure, Ctrl+C, timeout)
//!
//! See [`simulation`] and [`fleet`] for details.

#![warn(clippy::all)]

pub mod adapter;
pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod exec;
pub mod fleet;
pub mod loader;
pub mod network;
pub mod partition;
pub mod shutdown;
pub mod simulation;
pub mod stats;

#[cfg(test)]
pub(crate) mod testing;

// Orchestration
pub use simulation::{Simulation, SimulationState};
pub use shutdown::{ShutdownReason, ShutdownSignal};

// Adapters
pub use adapter::{DeviceAdapter, ServerAdapter};
pub use compose::ComposeServer;
pub use exec::{DriverKind, DriverManifest, ExecDevices, ExecDriver, ExecServer};
pub use fleet::DeviceFleet;
pub use loader::{DriverContext, DriverRef, DriverRegistry};

// Configuration
pub use config::{parse_duration, NetworkRule, SimulationConfig, StartMode};

// Workload partitioning
pub use partition::{plan_workers, split, Influence, WorkerSpec};

// Container runtime
pub use container::{
    ContainerFilter, ContainerHandle, ContainerRuntime, ContainerStatus, DockerCli, RestartPolicy,
    RunSpec,
};

// Network shaping
pub use network::{calculate_burst, parse_rate, NetworkController};

// Stats
pub use stats::StatsRecorder;

// Error handling
pub use error::{Result, SimulationError};
