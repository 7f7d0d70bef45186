//! Launcher interface.
//!
//! The launcher is the low-level forker and killer of container init
//! processes. It forks the helper binary (which blocks on the
//! exec-gate pipe until the engine signals it to exec), and on destroy
//! kills every process in the container.
//!
//! This module also defines the [`Reaper`], the engine's window onto
//! OS process exit. Keeping it a trait lets tests script exits without
//! real children; [`OsReaper`] is the `waitpid`-backed default.

use std::collections::HashSet;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::config::{CommandSpec, EnvironmentMap};
use crate::error::Result;
use crate::isolator::{ContainerStatus, RecoveredContainer};
use crate::state::ContainerId;

// =============================================================================
// Stdio
// =============================================================================

/// Where one of the forked child's standard streams goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRedirect {
    /// Inherit the agent's stream.
    Inherit,
    /// Redirect to a file (append).
    File(PathBuf),
    /// Discard.
    Null,
}

// =============================================================================
// Launch Flags
// =============================================================================

/// Flags handed to the helper binary through the launcher.
#[derive(Debug, Clone)]
pub struct LaunchFlags {
    /// The merged command to exec.
    pub command: CommandSpec,
    /// Working directory for the command.
    pub working_directory: PathBuf,
    /// Root filesystem to pivot into, if any.
    pub rootfs: Option<PathBuf>,
    /// User to switch to before exec.
    pub user: Option<String>,
    /// Read end of the exec-gate pipe; the helper blocks reading it.
    pub pipe_read: RawFd,
    /// Write end of the exec-gate pipe.
    pub pipe_write: RawFd,
    /// Commands the helper runs (in order) before exec.
    pub pre_exec_commands: Vec<CommandSpec>,
    /// Capabilities to apply before exec.
    pub capabilities: Option<Vec<String>>,
    /// The container's runtime directory, where the helper checkpoints
    /// the exit status on container exit.
    pub runtime_directory: PathBuf,
}

// =============================================================================
// Launcher Trait
// =============================================================================

/// Forker and killer of container init processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Re-adopts known containers after an agent restart. Returns the
    /// ids of containers the launcher knows about that are *not* in
    /// `containers` — these are orphans the engine must destroy.
    async fn recover(
        &self,
        containers: &[RecoveredContainer],
    ) -> Result<HashSet<ContainerId>>;

    /// Forks the helper binary for a container and returns its pid.
    /// The child must not exec until the engine writes to the
    /// exec-gate pipe in `flags`.
    #[allow(clippy::too_many_arguments)]
    async fn fork(
        &self,
        id: &ContainerId,
        helper_path: &Path,
        argv: &[String],
        stdin: IoRedirect,
        stdout: IoRedirect,
        stderr: IoRedirect,
        flags: &LaunchFlags,
        environment: &EnvironmentMap,
        namespaces: u32,
    ) -> Result<u32>;

    /// Kills every process in the container.
    async fn destroy(&self, id: &ContainerId) -> Result<()>;

    /// Reports launcher-level status (e.g. the init pid).
    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus>;
}

// =============================================================================
// Reaper
// =============================================================================

/// Observes OS process exit for forked container inits.
#[async_trait]
pub trait Reaper: Send + Sync {
    /// Resolves with the raw wait status once `pid` exits, or `None`
    /// if the exit cannot be observed (e.g. the process is not a
    /// child of this agent).
    async fn reap(&self, pid: u32) -> Option<i32>;
}

/// `waitpid`-backed reaper. Each reap parks one blocking thread until
/// the child exits.
#[derive(Debug, Default)]
pub struct OsReaper;

#[async_trait]
impl Reaper for OsReaper {
    async fn reap(&self, pid: u32) -> Option<i32> {
        let handle = tokio::task::spawn_blocking(move || {
            let mut status: libc::c_int = 0;
            // SAFETY: status points at a live c_int for the duration
            // of the call.
            let reaped = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
            if reaped == pid as libc::pid_t {
                Some(status)
            } else {
                None
            }
        });

        match handle.await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pid, error = %e, "reap task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn os_reaper_observes_child_exit() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let status = OsReaper.reap(child.id()).await;
        assert_eq!(status, Some(0));
    }

    #[tokio::test]
    async fn os_reaper_returns_none_for_foreign_pids() {
        // pid 1 is not our child; waitpid must refuse it.
        assert_eq!(OsReaper.reap(1).await, None);
    }
}
