//! Stop signal shared by the reservation loop and the OS signal listener.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Why a run stopped voluntarily.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// [`Client::stop`](crate::Client::stop) was called.
    Requested,
    /// The process received SIGINT (Ctrl+C).
    Interrupted,
    /// The process received SIGTERM.
    Terminated,
}

/// One-shot stop event, created fresh for every run.
///
/// The first trigger wins and records its reason; later triggers are ignored.
#[derive(Debug, Default)]
pub struct StopSignal {
    token: CancellationToken,
    reason: OnceLock<StopReason>,
}

impl StopSignal {
    /// Create an untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Returns `false` if it had already fired.
    pub fn trigger(&self, reason: StopReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.token.cancel();
        true
    }

    /// Fire the signal without a voluntary reason, after a fatal fault.
    pub(crate) fn abort(&self) {
        self.token.cancel();
    }

    /// Whether the signal has fired.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason recorded by the first trigger.
    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }

    /// Wait until the signal fires.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Turns the first SIGINT or SIGTERM into a stop.
pub struct SignalListener {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Register the process signal handlers.
    ///
    /// Registration happens here rather than in [`run`](SignalListener::run)
    /// so a failure surfaces before the loop starts.
    #[cfg(unix)]
    pub fn install() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    /// Register the process signal handlers.
    #[cfg(not(unix))]
    pub fn install() -> Result<Self> {
        Ok(Self {})
    }

    /// Wait for a signal or for `stop` to fire by other means.
    #[cfg(unix)]
    pub async fn run(mut self, stop: Arc<StopSignal>) {
        let reason = tokio::select! {
            _ = stop.stopped() => return,
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                StopReason::Interrupted
            }
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                StopReason::Terminated
            }
        };
        stop.trigger(reason);
    }

    /// Wait for Ctrl+C or for `stop` to fire by other means.
    #[cfg(not(unix))]
    pub async fn run(self, stop: Arc<StopSignal>) {
        tokio::select! {
            _ = stop.stopped() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                    stop.trigger(StopReason::Interrupted);
                }
            }
        }
    }
}
