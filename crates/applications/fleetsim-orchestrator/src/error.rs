//! Error types for the simulation engine

use thiserror::Error;

/// Simulation result type
pub type Result<T> = std::result::Result<T, SimulationError>;

/// Errors that can occur while bringing a simulation up or tearing it down
#[derive(Error, Debug)]
pub enum SimulationError {
    /// Container or network creation failed
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// A start/trigger control call did not succeed
    #[error("Connection error: {0}")]
    Connection(String),

    /// A worker container exited while it was being polled
    #[error("Worker {container} failed: {reason}")]
    WorkerFailure { container: String, reason: String },

    /// Shaping sidecar never reached running, or its state could not be confirmed
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Adapter driver could not be resolved
    #[error("Import error: {0}")]
    Import(String),

    /// Malformed rate, unit or duration string
    #[error("Invalid value: {0}")]
    Value(String),

    /// Container lookup found nothing
    #[error("Container {0} not found")]
    NotFound(String),

    /// Docker CLI error
    #[error("Docker error: {0}")]
    Docker(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SimulationError {
    /// Create a provisioning error
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a worker failure for the named container
    pub fn worker_failure(container: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WorkerFailure {
            container: container.into(),
            reason: reason.into(),
        }
    }

    /// Create a runtime error
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Create an import error
    pub fn import(msg: impl Into<String>) -> Self {
        Self::Import(msg.into())
    }

    /// Create a value error
    pub fn value(msg: impl Into<String>) -> Self {
        Self::Value(msg.into())
    }

    /// Create a Docker CLI error
    pub fn docker(msg: impl Into<String>) -> Self {
        Self::Docker(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True if this error reports a missing container
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
