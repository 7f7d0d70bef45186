//! Fetcher interface.
//!
//! The fetcher downloads a command's URI assets into the sandbox
//! before the container execs.

use std::path::Path;

use async_trait::async_trait;

use crate::config::CommandSpec;
use crate::error::Result;
use crate::state::ContainerId;

/// Downloader of task assets into container sandboxes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches `command`'s URIs into `directory`, optionally as
    /// `user`. `agent_id` scopes any fetcher-level caching.
    async fn fetch(
        &self,
        id: &ContainerId,
        command: &CommandSpec,
        directory: &Path,
        user: Option<&str>,
        agent_id: &str,
    ) -> Result<()>;

    /// Aborts any in-flight fetches for the container.
    async fn kill(&self, id: &ContainerId);
}
