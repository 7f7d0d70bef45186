//! # warden
//!
//! **Container lifecycle engine for cluster agents.**
//!
//! This crate takes a declarative container configuration and drives
//! it through provisioning, isolation preparation, process launch,
//! monitoring, and teardown, keeping crash-recoverable state on disk.
//! The collaborators that actually touch the kernel — isolators, the
//! launcher, the provisioner, the fetcher, the container logger — are
//! traits; this crate owns the state machine and its ordering
//! guarantees.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             Engine                                 │
//! │                                                                    │
//! │  launch ─▶ provisioning ─▶ preparing ─▶ isolating ─▶ fetching ─▶   │
//! │                │               │            │            │         │
//! │                ▼               ▼            ▼            ▼         │
//! │           Provisioner    Isolator[0..n] Isolator[0..n] Fetcher     │
//! │                          (serial)       (parallel)                 │
//! │                                                                    │
//! │  running ──▶ destroying ──▶ (removed)                              │
//! │                 │                                                  │
//! │                 ▼                                                  │
//! │           Launcher.destroy ─▶ cleanup (reverse) ─▶ Provisioner     │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  Registry (parent/child tree)   │   Runtime directory (pid,        │
//! │                                 │   status, termination)           │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! A launch provisions the requested image, runs every isolator's
//! `prepare` strictly in pipeline order, forks the container init
//! through the launcher (the child blocks on an exec-gate pipe), runs
//! `isolate` on all isolators in parallel, fetches URI assets into the
//! sandbox, and finally writes one byte to the pipe to let the child
//! exec.
//!
//! A destroy flips the container into `destroying` — racing any
//! in-flight launch, which re-checks after every suspension point —
//! recursively destroys nested containers first, selects a stage-aware
//! unwind path, cleans up isolators in reverse of the prepare order
//! that succeeded, and fulfills a single termination record for every
//! `wait` observer.
//!
//! Nested containers share their root's sandbox and runtime directory
//! subtree; recovery after an agent crash reconciles persisted agent
//! state, the runtime directory, and the launcher's view, destroying
//! whatever nobody claims.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden::{CommandSpec, ContainerConfig, ContainerId, Engine, EngineConfig};
//!
//! let engine = Engine::new(config, launcher, provisioner, fetcher, logger, reaper, isolators);
//! engine.recover(None).await?;
//!
//! let id = ContainerId::root("executor-1");
//! let config = ContainerConfig::new(CommandSpec::shell("./run.sh"), "/srv/sandbox/executor-1");
//! engine.launch(&id, config, Default::default(), true).await?;
//!
//! let termination = engine.wait(&id).await?;
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod isolator;
pub mod launcher;
pub mod logger;
pub mod metrics;
pub mod paths;
pub mod provisioner;
pub mod state;

pub use config::{
    CommandSpec, ContainerConfig, ContainerInfo, ContainerKind, EnvironmentMap, ExecutorInfo,
    Image, ImageKind, Resources, Uri,
};
pub use engine::{
    AgentState, Engine, EngineConfig, ExecutorState, FrameworkState, PostFetchHook, RunState,
};
pub use error::{Error, Result};
pub use fetcher::Fetcher;
pub use isolator::{
    ContainerStatus, Isolator, LaunchInfo, NetworkInfo, RecoveredContainer, ResourceStatistics,
};
pub use launcher::{IoRedirect, LaunchFlags, Launcher, OsReaper, Reaper};
pub use logger::{ContainerLogger, SandboxLogger, SubprocessInfo};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use provisioner::{ProvisionInfo, Provisioner};
pub use state::{
    ContainerId, ContainerLimitation, ContainerTermination, LifecycleState, LimitationReason,
    TaskState,
};
