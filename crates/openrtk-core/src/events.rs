//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front-ends to follow an upgrade run without tight coupling
//! to the core logic.

use std::fmt;

/// Coarse phases of a provider's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtkPhase {
    /// Normal command traffic.
    Idle,
    /// Upgrade pipeline owns the channel.
    Upgrading,
    /// Upgrade finished, device back in application mode.
    Complete,
    /// Upgrade aborted.
    Error,
}

impl fmt::Display for RtkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtkPhase::Idle => write!(f, "Idle"),
            RtkPhase::Upgrading => write!(f, "Upgrading"),
            RtkPhase::Complete => write!(f, "Complete"),
            RtkPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the provider and the upgrade pipeline.
#[derive(Debug, Clone)]
pub enum RtkEvent {
    /// Phase changed.
    PhaseChanged { from: RtkPhase, to: RtkPhase },
    /// Pipeline assembled and about to run.
    UpgradeStarted { workers: usize },
    /// A worker began running.
    WorkerStarted {
        index: usize,
        total: usize,
        worker: String,
    },
    /// Bytes acknowledged by the device for the running worker.
    Progress {
        worker: String,
        current: u64,
        total: u64,
    },
    /// A worker reached `Done`.
    WorkerFinished { worker: String },
    /// A worker failed; the run stops here.
    WorkerFailed { worker: String, message: String },
    /// Every worker finished.
    Complete,
}

/// Observer trait for receiving events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait RtkObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &RtkEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl RtkObserver for NullObserver {
    fn on_event(&self, _event: &RtkEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl RtkObserver for TracingObserver {
    fn on_event(&self, event: &RtkEvent) {
        match event {
            RtkEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            RtkEvent::UpgradeStarted { workers } => {
                tracing::info!(workers, "Upgrade started");
            }
            RtkEvent::WorkerStarted {
                index,
                total,
                worker,
            } => {
                tracing::info!(worker = %worker, step = %format!("{}/{}", index + 1, total), "Worker started");
            }
            RtkEvent::Progress {
                worker,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(worker = %worker, progress = %format!("{}%", pct), "Progress");
            }
            RtkEvent::WorkerFinished { worker } => {
                tracing::info!(worker = %worker, "Worker finished");
            }
            RtkEvent::WorkerFailed { worker, message } => {
                tracing::error!(worker = %worker, "Worker failed: {}", message);
            }
            RtkEvent::Complete => {
                tracing::info!("Upgrade complete");
            }
        }
    }
}
