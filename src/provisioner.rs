//! Provisioner interface.
//!
//! The provisioner materializes a root filesystem from a container
//! image and tears it down when the container is destroyed.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::Image;
use crate::error::Result;
use crate::state::ContainerId;

/// Result of provisioning an image for a container.
#[derive(Debug, Clone)]
pub struct ProvisionInfo {
    /// Path of the materialized root filesystem.
    pub rootfs: PathBuf,
    /// Docker image manifest, if the image was a Docker image.
    pub docker_manifest: Option<serde_json::Value>,
    /// Appc image manifest, if the image was an Appc image.
    pub appc_manifest: Option<serde_json::Value>,
}

impl ProvisionInfo {
    /// Creates a provision result with just a rootfs.
    #[must_use]
    pub fn new(rootfs: impl Into<PathBuf>) -> Self {
        Self {
            rootfs: rootfs.into(),
            docker_manifest: None,
            appc_manifest: None,
        }
    }
}

/// Materializer of root filesystems from images.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Re-adopts provisioned filesystems after an agent restart.
    /// `known_ids` is the union of recoverable and orphaned
    /// containers; state for any other id may be cleaned up.
    async fn recover(&self, known_ids: &HashSet<ContainerId>) -> Result<()>;

    /// Provisions a root filesystem for the container from `image`.
    async fn provision(&self, id: &ContainerId, image: &Image) -> Result<ProvisionInfo>;

    /// Destroys any filesystems provisioned for the container.
    /// Returns true if something was torn down.
    async fn destroy(&self, id: &ContainerId) -> Result<bool>;
}
