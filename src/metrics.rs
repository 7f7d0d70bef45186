//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle counters maintained by the engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Launches that entered the lifecycle.
    pub containers_launched: AtomicU64,
    /// Containers whose destroy completed (termination fulfilled).
    pub containers_destroyed: AtomicU64,
    /// Destroy-path failures (children, launcher kill, isolator
    /// cleanup, or provisioner teardown).
    pub container_destroy_errors: AtomicU64,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Launches that entered the lifecycle.
    pub containers_launched: u64,
    /// Containers whose destroy completed.
    pub containers_destroyed: u64,
    /// Destroy-path failures.
    pub container_destroy_errors: u64,
}

impl EngineMetrics {
    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            containers_launched: self.containers_launched.load(Ordering::Relaxed),
            containers_destroyed: self.containers_destroyed.load(Ordering::Relaxed),
            container_destroy_errors: self.container_destroy_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_launch(&self) {
        self.containers_launched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_destroy(&self) {
        self.containers_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_destroy_error(&self) {
        self.container_destroy_errors.fetch_add(1, Ordering::Relaxed);
    }
}
