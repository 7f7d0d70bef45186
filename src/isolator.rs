//! Isolator interface.
//!
//! An isolator attaches, monitors, updates, and detaches one facet of
//! container isolation (cgroups, namespaces, filesystem mounts, device
//! access, network interfaces, ...). The engine composes isolators as
//! an ordered pipeline:
//!
//! - `prepare` runs serially in declared order (filesystem isolators
//!   are moved to the front of the order at engine construction);
//! - `isolate`, `update`, `usage`, and `status` run in parallel;
//! - `cleanup` runs serially in reverse order of the prepares that
//!   succeeded, and is best-effort (all are attempted).
//!
//! Isolators that do not support nested containers are skipped for any
//! container whose id has a parent.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{CommandSpec, ContainerConfig, ExecutorInfo, Resources};
use crate::error::Result;
use crate::state::{ContainerId, ContainerLimitation};

// =============================================================================
// Launch Info
// =============================================================================

/// Per-isolator contribution to a container launch, returned from
/// `prepare`. The engine merges contributions by explicit rules:
/// environment is last-writer-wins, commands are field-merged, at most
/// one isolator may supply a working directory or capabilities,
/// pre-exec commands concatenate, namespace bitmaps are ORed.
#[derive(Debug, Clone, Default)]
pub struct LaunchInfo {
    /// Environment additions for the container init.
    pub environment: Vec<(String, String)>,
    /// Command overlay.
    pub command: Option<CommandSpec>,
    /// Working directory inside the container.
    pub working_directory: Option<PathBuf>,
    /// Commands the helper runs before exec'ing the container command.
    pub pre_exec_commands: Vec<CommandSpec>,
    /// `CLONE_*` namespace bitmap to fork with.
    pub namespaces: u32,
    /// Capabilities to grant the container.
    pub capabilities: Option<Vec<String>>,
}

// =============================================================================
// Statistics & Status
// =============================================================================

/// Resource usage statistics for a container, aggregated across
/// isolators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatistics {
    /// Collection time, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    /// User-mode CPU time consumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_user_time_secs: Option<f64>,
    /// Kernel-mode CPU time consumed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_system_time_secs: Option<f64>,
    /// Allocated CPU limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_limit: Option<f64>,
    /// Resident set size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_rss_bytes: Option<u64>,
    /// Allocated memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit_bytes: Option<u64>,
    /// Sandbox disk usage in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_used_bytes: Option<u64>,
}

impl ResourceStatistics {
    /// Overlays `other` onto `self`; fields set in `other` win.
    pub fn merge_from(&mut self, other: &ResourceStatistics) {
        macro_rules! overlay {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        overlay!(timestamp);
        overlay!(cpus_user_time_secs);
        overlay!(cpus_system_time_secs);
        overlay!(cpus_limit);
        overlay!(mem_rss_bytes);
        overlay!(mem_limit_bytes);
        overlay!(disk_used_bytes);
    }
}

/// A network attachment reported in a container status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Network name, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Assigned addresses.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

/// Point-in-time status of a container, aggregated across isolators
/// and the launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    /// Pid of the container init.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_pid: Option<u32>,
    /// Network attachments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_infos: Vec<NetworkInfo>,
}

impl ContainerStatus {
    /// Overlays `other` onto `self`; scalar fields set in `other` win,
    /// network attachments accumulate.
    pub fn merge_from(&mut self, other: &ContainerStatus) {
        if other.executor_pid.is_some() {
            self.executor_pid = other.executor_pid;
        }
        self.network_infos.extend(other.network_infos.iter().cloned());
    }
}

// =============================================================================
// Recovery Input
// =============================================================================

/// A container known to be running at recovery time, reconstructed
/// from persisted agent state or the runtime directory.
#[derive(Debug, Clone)]
pub struct RecoveredContainer {
    /// The container's id.
    pub id: ContainerId,
    /// Pid of the container init.
    pub pid: u32,
    /// Host sandbox directory.
    pub directory: PathBuf,
    /// Executor description; absent for nested containers.
    pub executor_info: Option<ExecutorInfo>,
}

// =============================================================================
// Isolator Trait
// =============================================================================

/// One facet of container isolation, composed into an ordered
/// pipeline by the engine.
///
/// Implementations only override the operations they participate in;
/// every operation except `name` has a neutral default.
#[async_trait]
pub trait Isolator: Send + Sync {
    /// Returns the isolator name (e.g. `"filesystem/posix"`,
    /// `"cgroups/mem"`). Names starting with `filesystem/` are moved
    /// to the front of the pipeline.
    fn name(&self) -> &str;

    /// Whether this isolator can handle nested containers. Isolators
    /// answering false are skipped for nested ids.
    fn supports_nesting(&self) -> bool {
        false
    }

    /// Re-adopts known containers after an agent restart. `orphans`
    /// are containers about to be destroyed; the isolator may clean up
    /// any state it holds for ids in neither set.
    async fn recover(
        &self,
        containers: &[RecoveredContainer],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        let _ = (containers, orphans);
        Ok(())
    }

    /// Runs before the container is forked; returns this isolator's
    /// contribution to the launch, if any.
    async fn prepare(
        &self,
        id: &ContainerId,
        config: &ContainerConfig,
    ) -> Result<Option<LaunchInfo>> {
        let _ = (id, config);
        Ok(None)
    }

    /// Attaches isolation to the forked (not yet exec'd) init.
    async fn isolate(&self, id: &ContainerId, pid: u32) -> Result<()> {
        let _ = (id, pid);
        Ok(())
    }

    /// Resolves when the container breaches a resource policy this
    /// isolator enforces. The default never resolves.
    async fn watch(&self, id: &ContainerId) -> Result<ContainerLimitation> {
        let _ = id;
        std::future::pending().await
    }

    /// Applies a new resource allocation to a running container.
    async fn update(&self, id: &ContainerId, resources: &Resources) -> Result<()> {
        let _ = (id, resources);
        Ok(())
    }

    /// Reports current resource usage.
    async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        let _ = id;
        Ok(ResourceStatistics::default())
    }

    /// Reports isolation status (addresses, pids, ...).
    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let _ = id;
        Ok(ContainerStatus::default())
    }

    /// Detaches this isolator's state from a dead container. Runs in
    /// reverse pipeline order, after all container processes exited.
    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        let _ = id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_overlay_prefers_set_fields() {
        let mut base = ResourceStatistics {
            mem_rss_bytes: Some(1024),
            cpus_limit: Some(2.0),
            ..ResourceStatistics::default()
        };
        let overlay = ResourceStatistics {
            mem_rss_bytes: Some(2048),
            disk_used_bytes: Some(512),
            ..ResourceStatistics::default()
        };

        base.merge_from(&overlay);

        assert_eq!(base.mem_rss_bytes, Some(2048));
        assert_eq!(base.cpus_limit, Some(2.0));
        assert_eq!(base.disk_used_bytes, Some(512));
    }

    #[test]
    fn status_merge_accumulates_networks() {
        let mut base = ContainerStatus {
            executor_pid: Some(1),
            network_infos: vec![NetworkInfo {
                name: Some("cni".to_string()),
                ip_addresses: vec!["10.0.0.2".to_string()],
            }],
        };
        let overlay = ContainerStatus {
            executor_pid: None,
            network_infos: vec![NetworkInfo::default()],
        };

        base.merge_from(&overlay);

        assert_eq!(base.executor_pid, Some(1));
        assert_eq!(base.network_infos.len(), 2);
    }
}
