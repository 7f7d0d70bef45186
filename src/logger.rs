//! Container logger interface.
//!
//! The container logger decides where a container's stdout and stderr
//! go (files in the sandbox, a journal, ...). The engine calls
//! `prepare` right before forking and passes the returned redirects to
//! the launcher.

use std::path::Path;

use async_trait::async_trait;

use crate::config::ExecutorInfo;
use crate::error::Result;
use crate::launcher::IoRedirect;

/// Stdio destinations produced by the logger for one container.
#[derive(Debug, Clone)]
pub struct SubprocessInfo {
    /// Destination for the container's stdout.
    pub stdout: IoRedirect,
    /// Destination for the container's stderr.
    pub stderr: IoRedirect,
}

impl Default for SubprocessInfo {
    fn default() -> Self {
        Self {
            stdout: IoRedirect::Inherit,
            stderr: IoRedirect::Inherit,
        }
    }
}

/// Sink chooser for container stdout/stderr.
#[async_trait]
pub trait ContainerLogger: Send + Sync {
    /// Re-attaches logging for a recovered container. Failures are
    /// tolerated with a warning.
    async fn recover(&self, executor_info: Option<&ExecutorInfo>, directory: &Path) -> Result<()>;

    /// Chooses stdio destinations for a container about to be forked.
    async fn prepare(
        &self,
        executor_info: Option<&ExecutorInfo>,
        directory: &Path,
    ) -> Result<SubprocessInfo>;
}

/// Logger that writes `stdout` and `stderr` files into the sandbox.
#[derive(Debug, Default)]
pub struct SandboxLogger;

#[async_trait]
impl ContainerLogger for SandboxLogger {
    async fn recover(&self, _executor_info: Option<&ExecutorInfo>, _directory: &Path) -> Result<()> {
        Ok(())
    }

    async fn prepare(
        &self,
        _executor_info: Option<&ExecutorInfo>,
        directory: &Path,
    ) -> Result<SubprocessInfo> {
        Ok(SubprocessInfo {
            stdout: IoRedirect::File(directory.join("stdout")),
            stderr: IoRedirect::File(directory.join("stderr")),
        })
    }
}
