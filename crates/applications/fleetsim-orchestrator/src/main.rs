//! Fleetsim - containerized IoT fleet simulations
//!
//! ## Usage
//!
//! ```bash
//! # Run a simulation described by a YAML file
//! fleetsim --config-file simulation.yaml
//!
//! # Inline configuration
//! fleetsim --config "$(cat simulation.yaml)"
//! ```
//!
//! Exit codes: 0 when the run completed (even if setup failed and was cleaned
//! up), 1 for configuration or driver errors, 2 on SIGINT, 3 on SIGTERM or
//! timeout.

use anyhow::Context;
use clap::{ArgGroup, Parser};
use fleetsim_orchestrator::{
    DockerCli, DriverContext, DriverRegistry, NetworkController, ShutdownSignal, Simulation,
    SimulationConfig, StatsRecorder,
};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Log file inside the output directory
const LOG_FILE: &str = "simulator_logs.log";

/// Copy of the configuration inside the output directory
const CONFIG_COPY: &str = "config.yaml";

/// Fleetsim: IoT fleet simulation orchestrator
#[derive(Parser)]
#[command(name = "fleetsim")]
#[command(about = "Simulate IoT device fleets against a fleet-management platform", long_about = None)]
#[command(group(ArgGroup::new("source").required(true).args(["config_file", "config"])))]
struct Cli {
    /// Path to the YAML simulation configuration
    #[arg(long)]
    config_file: Option<String>,

    /// Inline YAML simulation configuration
    #[arg(long)]
    config: Option<String>,

    /// Docker-compatible CLI to drive containers with
    #[arg(long, default_value = "docker")]
    docker: String,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SimulationConfig> {
        match (&self.config_file, &self.config) {
            (Some(path), _) => SimulationConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path)),
            (None, Some(raw)) => {
                SimulationConfig::from_yaml(raw).context("Failed to parse inline configuration")
            }
            (None, None) => anyhow::bail!("either --config-file or --config is required"),
        }
    }
}

/// Recreate the output directory and keep a copy of the configuration in it
fn prepare_output(config: &SimulationConfig) -> anyhow::Result<()> {
    let output = &config.output.path;
    if output.exists() {
        std::fs::remove_dir_all(output)
            .with_context(|| format!("Failed to clear {}", output.display()))?;
    }
    std::fs::create_dir_all(output)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    std::fs::write(output.join(CONFIG_COPY), &config.raw)?;
    Ok(())
}

/// Console logging plus a plain-text copy in the output directory
fn init_tracing(output: &Path, log_level: &str) -> WorkerGuard {
    let level = log_level.to_lowercase();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("fleetsim_orchestrator={level},fleetsim={level},warn").into()
    });

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(output, LOG_FILE));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    guard
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    let timeout = config.timeout()?;
    let stats_period = config.stats_period()?;

    prepare_output(&config)?;
    let _log_guard = init_tracing(&config.output.path, &config.log_level);

    info!("🚀 Starting fleet simulation");
    info!(
        "   Devices: {} across {} container(s)",
        config.client.number_of_devices, config.client.number_of_containers
    );
    info!("   Output: {}", config.output.path.display());

    let shutdown = ShutdownSignal::new();
    let _signals = shutdown
        .spawn_signal_listener()
        .context("Failed to install signal handlers")?;
    let _timeout = timeout.map(|t| {
        info!("   Timeout: {:?}", t);
        shutdown.spawn_timeout(t)
    });

    let config = Arc::new(config);
    let runtime = Arc::new(DockerCli::with_binary(&cli.docker));

    let ctx = DriverContext {
        config: config.clone(),
        runtime: runtime.clone(),
    };
    let registry = DriverRegistry::with_builtins();
    let server = registry.load_server(&ctx).await?;
    let devices = registry.load_devices(&ctx).await?;

    let stats = StatsRecorder::new(runtime.clone(), &config.output.path);

    let simulation = Simulation::new(
        &config,
        server,
        devices,
        NetworkController::new(runtime)?,
        shutdown.clone(),
    );
    stats.record_during(stats_period, simulation.run()).await;

    match shutdown.reason() {
        Some(reason) => {
            info!("🛑 Simulation ended early ({:?})", reason);
            Ok(ExitCode::from(reason.exit_code()))
        }
        None => {
            info!("✅ Simulation complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
