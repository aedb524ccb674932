//! Simulation state machine
//!
//! ```text
//! Starting ──► Setup ──► Running ──► Stopping ──► Stopped
//!     │          │          │            ▲
//!     └──────────┴──────────┴────────────┘   (failure, signal, timeout)
//! ```
//!
//! Transitions only move forward. Whoever wins the CAS into `Stopping` runs
//! cleanup; every other caller returns immediately.

use crate::adapter::{DeviceAdapter, ServerAdapter};
use crate::config::{NetworkRule, SimulationConfig};
use crate::error::Result;
use crate::network::NetworkController;
use crate::shutdown::ShutdownSignal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Lifecycle state of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SimulationState {
    Starting = 0,
    Setup = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
}

impl SimulationState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Setup,
            2 => Self::Running,
            3 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// One simulation run over a server, a device fleet and the network shaper
pub struct Simulation {
    state: AtomicU8,
    output: PathBuf,
    network_rule: Option<NetworkRule>,
    has_task: bool,
    server: Mutex<Box<dyn ServerAdapter>>,
    devices: Mutex<Box<dyn DeviceAdapter>>,
    network: Mutex<NetworkController>,
    shutdown: ShutdownSignal,
}

impl Simulation {
    pub fn new(
        config: &SimulationConfig,
        server: Box<dyn ServerAdapter>,
        devices: Box<dyn DeviceAdapter>,
        network: NetworkController,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            state: AtomicU8::new(SimulationState::Starting as u8),
            output: config.output.path.clone(),
            network_rule: config.network.clone(),
            has_task: config.has_task(),
            server: Mutex::new(server),
            devices: Mutex::new(devices),
            network: Mutex::new(network),
            shutdown,
        }
    }

    pub fn state(&self) -> SimulationState {
        SimulationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move forward to `next`; refused once stopping has begun
    fn advance(&self, next: SimulationState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= next as u8 || current >= SimulationState::Stopping as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                next as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Run the simulation to completion.
    ///
    /// Setup and trigger errors are logged, never returned; a shutdown request
    /// abandons them at the next await point. Cleanup always runs.
    pub async fn run(&self) {
        tokio::select! {
            result = self.setup_and_trigger() => {
                match result {
                    Ok(()) => info!("Simulation finished"),
                    Err(e) => error!(error = ?e, "Simulation failed: {}", e),
                }
            }
            _ = self.shutdown.cancelled() => {
                warn!(reason = ?self.shutdown.reason(), "Simulation interrupted");
            }
        }

        self.stop_and_cleanup().await;
    }

    async fn setup_and_trigger(&self) -> Result<()> {
        self.setup().await?;
        self.trigger().await
    }

    async fn setup(&self) -> Result<()> {
        if !self.advance(SimulationState::Setup) {
            return Ok(());
        }
        info!("Setting up simulation");

        self.server.lock().await.start().await?;
        self.devices.lock().await.setup().await?;

        let mut network = self.network.lock().await;
        network.remove_stale_container().await?;
        if let Some(rule) = &self.network_rule {
            let targets = self.devices.lock().await.containers().await?;
            info!("Applying network rule to {} container(s)", targets.len());
            network.simulate(rule, &targets).await?;
        }

        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        if !self.advance(SimulationState::Running) {
            return Ok(());
        }
        info!("Starting devices");

        self.devices.lock().await.start().await?;

        if self.has_task {
            info!("Triggering task on server");
            self.server.lock().await.trigger().await?;
            info!("Waiting for devices to finish");
            self.devices.lock().await.wait_finish().await?;
        } else {
            info!("No task configured, skipping trigger");
        }

        Ok(())
    }

    /// Save artifacts and remove everything the run created. Runs once.
    pub async fn stop_and_cleanup(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= SimulationState::Stopping as u8 {
                return;
            }
            match self.state.compare_exchange(
                current,
                SimulationState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        info!("Stopping simulation and cleaning up");

        self.devices
            .lock()
            .await
            .store_and_cleanup(&self.output.join("devices"))
            .await;
        self.server
            .lock()
            .await
            .store_and_cleanup(&self.output.join("server"))
            .await;
        self.network
            .lock()
            .await
            .store_and_cleanup(&self.output.join("network"))
            .await;

        self.state
            .store(SimulationState::Stopped as u8, Ordering::SeqCst);
        info!("Simulation stopped");
    }
}
