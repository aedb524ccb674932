//! Cancellation context shared by the signal handler, the timeout task and the
//! simulation.
//!
//! The first reason recorded wins; later triggers only re-cancel the already
//! cancelled token.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Why a run was cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM or the configured timeout elapsed
    Terminate,
}

impl ShutdownReason {
    /// Process exit code for this reason
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Interrupt => 2,
            Self::Terminate => 3,
        }
    }
}

/// Cloneable cancellation handle carrying the first shutdown reason
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.reason.set(reason).is_ok() {
            info!(?reason, "Shutdown requested");
        }
        self.token.cancel();
    }

    /// Resolves once shutdown has been requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// First recorded reason, if any
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Trigger [`ShutdownReason::Terminate`] after `timeout`
    pub fn spawn_timeout(&self, timeout: Duration) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    warn!("Simulation timeout of {:?} reached", timeout);
                    signal.trigger(ShutdownReason::Terminate);
                }
                _ = signal.cancelled() => {}
            }
        })
    }

    /// Map SIGINT to `Interrupt` and SIGTERM to `Terminate`
    #[cfg(unix)]
    pub fn spawn_signal_listener(&self) -> std::io::Result<JoinHandle<()>> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let shutdown = self.clone();

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interrupt.recv() => {
                        info!("Received SIGINT, stopping simulation...");
                        shutdown.trigger(ShutdownReason::Interrupt);
                    }
                    _ = terminate.recv() => {
                        info!("Received SIGTERM, stopping simulation...");
                        shutdown.trigger(ShutdownReason::Terminate);
                    }
                }
            }
        }))
    }

    /// Map Ctrl-C to `Interrupt`
    #[cfg(not(unix))]
    pub fn spawn_signal_listener(&self) -> std::io::Result<JoinHandle<()>> {
        let shutdown = self.clone();
        Ok(tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping simulation...");
                shutdown.trigger(ShutdownReason::Interrupt);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.reason(), None);
        assert!(!signal.is_cancelled());

        signal.trigger(ShutdownReason::Interrupt);
        signal.clone().trigger(ShutdownReason::Terminate);

        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(ShutdownReason::Interrupt));
        assert_eq!(signal.reason().map(ShutdownReason::exit_code), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_terminates() {
        let signal = ShutdownSignal::new();
        let task = signal.spawn_timeout(Duration::from_secs(60));

        tokio::time::timeout(Duration::from_secs(61), signal.cancelled())
            .await
            .unwrap();
        task.await.unwrap();

        assert_eq!(signal.reason(), Some(ShutdownReason::Terminate));
        assert_eq!(ShutdownReason::Terminate.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_timeout_task_exits_on_earlier_shutdown() {
        let signal = ShutdownSignal::new();
        let task = signal.spawn_timeout(Duration::from_secs(3600));

        signal.trigger(ShutdownReason::Interrupt);
        task.await.unwrap();

        assert_eq!(signal.reason(), Some(ShutdownReason::Interrupt));
    }
}
