//! Container configuration types.
//!
//! A [`ContainerConfig`] is the declarative input to a launch: what to
//! run, where the sandbox lives, which user to run as, and (optionally)
//! which image to provision a root filesystem from. The provisioner
//! fills in `rootfs` and manifests after the image is materialized.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// =============================================================================
// Command
// =============================================================================

/// An asset to download into the sandbox before the command runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Uri {
    /// Source location of the asset.
    pub value: String,
    /// Mark the downloaded file executable.
    #[serde(default)]
    pub executable: bool,
    /// Extract the asset (archive) after download.
    #[serde(default)]
    pub extract: bool,
}

/// Description of the command a container runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Run `value` through a shell. When false, `value` is the
    /// executable and `arguments` are passed verbatim.
    pub shell: bool,
    /// The command line (shell mode) or executable path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Arguments, only meaningful when `shell` is false.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Command-level environment variables.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<(String, String)>,
    /// Assets to fetch into the sandbox.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<Uri>,
    /// User to run the command as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl Default for CommandSpec {
    fn default() -> Self {
        Self {
            shell: true,
            value: None,
            arguments: Vec::new(),
            environment: Vec::new(),
            uris: Vec::new(),
            user: None,
        }
    }
}

impl CommandSpec {
    /// Creates a shell command.
    #[must_use]
    pub fn shell(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Overlays `other` onto `self`: scalar fields present in `other`
    /// overwrite, repeated fields are appended in order.
    ///
    /// Isolators that contribute command overlays are responsible for
    /// the merged command being valid.
    pub fn merge_from(&mut self, other: &CommandSpec) {
        self.shell = other.shell;
        if other.value.is_some() {
            self.value.clone_from(&other.value);
        }
        if other.user.is_some() {
            self.user.clone_from(&other.user);
        }
        self.arguments.extend(other.arguments.iter().cloned());
        self.environment.extend(other.environment.iter().cloned());
        self.uris.extend(other.uris.iter().cloned());
    }
}

// =============================================================================
// Resources
// =============================================================================

/// Resource allocation for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU shares.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    /// Memory limit in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_bytes: Option<u64>,
    /// Disk quota in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<u64>,
}

// =============================================================================
// Image
// =============================================================================

/// Image format understood by the provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Docker registry image.
    Docker,
    /// Appc image.
    Appc,
}

/// A root filesystem image reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Image format.
    pub kind: ImageKind,
    /// Format-specific reference (e.g. `alpine:3.20`).
    pub reference: String,
}

// =============================================================================
// Container Info
// =============================================================================

/// Isolation backend requested for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Handled by this engine.
    Native,
    /// Handled by an external containerizer; this engine skips it.
    External,
}

/// Container-level settings carried alongside the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Which containerizer handles this container.
    pub kind: ContainerKind,
    /// Optional root filesystem image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

impl ContainerInfo {
    /// Creates a native container info with an image.
    #[must_use]
    pub fn with_image(image: Image) -> Self {
        Self {
            kind: ContainerKind::Native,
            image: Some(image),
        }
    }
}

// =============================================================================
// Executor Info
// =============================================================================

/// Description of the executor a root container hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    /// Executor identifier, unique within its framework.
    pub executor_id: String,
    /// Owning framework.
    pub framework_id: String,
    /// The executor command.
    pub command: CommandSpec,
    /// Declared resources.
    #[serde(default)]
    pub resources: Resources,
    /// Container settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

// =============================================================================
// Container Config
// =============================================================================

/// Declarative input to a container launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Executor description; absent for nested containers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_info: Option<ExecutorInfo>,
    /// The command to run.
    pub command: CommandSpec,
    /// Host sandbox directory.
    pub directory: PathBuf,
    /// User to run as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Container settings (isolation backend, image).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_info: Option<ContainerInfo>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Resources,
    /// Root filesystem path, set by the engine after provisioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    /// Docker image manifest, set after provisioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_manifest: Option<serde_json::Value>,
    /// Appc image manifest, set after provisioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub appc_manifest: Option<serde_json::Value>,
}

impl ContainerConfig {
    /// Creates a config for `command` in the given sandbox directory.
    #[must_use]
    pub fn new(command: CommandSpec, directory: impl Into<PathBuf>) -> Self {
        Self {
            command,
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Returns the image to provision, if one is requested.
    #[must_use]
    pub fn image(&self) -> Option<&Image> {
        self.container_info.as_ref().and_then(|info| info.image.as_ref())
    }
}

/// Environment map passed into a launch and handed to the forked init.
pub type EnvironmentMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_scalars_and_appends_repeated() {
        let mut base = CommandSpec::shell("echo hello");
        base.arguments.push("--verbose".to_string());

        let mut overlay = CommandSpec::default();
        overlay.shell = false;
        overlay.value = Some("/bin/runner".to_string());
        overlay.arguments.push("--quiet".to_string());

        base.merge_from(&overlay);

        assert!(!base.shell);
        assert_eq!(base.value.as_deref(), Some("/bin/runner"));
        assert_eq!(base.arguments, vec!["--verbose", "--quiet"]);
    }

    #[test]
    fn merge_keeps_scalars_absent_in_overlay() {
        let mut base = CommandSpec::shell("sleep 1");
        base.user = Some("nobody".to_string());

        base.merge_from(&CommandSpec::default());

        assert_eq!(base.value.as_deref(), Some("sleep 1"));
        assert_eq!(base.user.as_deref(), Some("nobody"));
    }

    #[test]
    fn image_accessor_reads_container_info() {
        let mut config = ContainerConfig::new(CommandSpec::shell("true"), "/tmp/sandbox");
        assert!(config.image().is_none());

        config.container_info = Some(ContainerInfo::with_image(Image {
            kind: ImageKind::Docker,
            reference: "alpine:3.20".to_string(),
        }));
        assert_eq!(config.image().unwrap().reference, "alpine:3.20");
    }
}
