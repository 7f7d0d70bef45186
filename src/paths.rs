//! Runtime directory layout and checkpoint helpers.
//!
//! The engine keeps private per-container state under its runtime
//! directory, laid out hierarchically so that removing a root
//! container's directory reclaims all of its descendants:
//!
//! ```text
//! <runtime_dir>/
//! └── containers/
//!     └── <root>/
//!         ├── pid            (forked init's pid)
//!         ├── status         (init exit status, written by the helper)
//!         ├── termination    (nested containers only)
//!         └── containers/
//!             └── <child>/...
//! ```
//!
//! Checkpoints are written atomically via a temp file + rename so a
//! crash never leaves a partially written record.

use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{
    CHECKPOINT_TMP_SUFFIX, CONTAINERS_DIR, PID_FILE, STATUS_FILE, TERMINATION_FILE,
};
use crate::error::{Error, Result};
use crate::state::{ContainerId, ContainerTermination};

// =============================================================================
// Layout
// =============================================================================

/// Returns the runtime directory of a container.
#[must_use]
pub fn runtime_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    let mut path = runtime_dir.to_path_buf();
    for ancestor in id.ancestry() {
        path.push(CONTAINERS_DIR);
        path.push(ancestor.name());
    }
    path
}

/// Returns the sandbox directory of a container, given its root
/// container's sandbox. Nested sandboxes live at a deterministic path
/// under the root's sandbox.
#[must_use]
pub fn sandbox_path(root_sandbox: &Path, id: &ContainerId) -> PathBuf {
    let mut path = root_sandbox.to_path_buf();
    for ancestor in id.ancestry().into_iter().skip(1) {
        path.push(CONTAINERS_DIR);
        path.push(ancestor.name());
    }
    path
}

/// Returns the path of a container's pid file.
#[must_use]
pub fn pid_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(PID_FILE)
}

/// Returns the path of a container's exit status file.
#[must_use]
pub fn status_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(STATUS_FILE)
}

/// Returns the path of a nested container's termination file.
#[must_use]
pub fn termination_path(runtime_dir: &Path, id: &ContainerId) -> PathBuf {
    runtime_path(runtime_dir, id).join(TERMINATION_FILE)
}

/// Enumerates all container ids present in the runtime directory,
/// parents before children.
///
/// # Errors
///
/// Returns an error if a directory level cannot be read.
pub fn container_ids(runtime_dir: &Path) -> Result<Vec<ContainerId>> {
    let mut ids = Vec::new();
    collect_ids(&runtime_dir.join(CONTAINERS_DIR), None, &mut ids)?;
    Ok(ids)
}

fn collect_ids(
    dir: &Path,
    parent: Option<&ContainerId>,
    ids: &mut Vec<ContainerId>,
) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let id = match parent {
            Some(parent) => ContainerId::nested(parent, name),
            None => ContainerId::root(name),
        };

        ids.push(id.clone());
        collect_ids(&entry.path().join(CONTAINERS_DIR), Some(&id), ids)?;
    }
    Ok(())
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Atomically writes `contents` to `path`, creating parent directories.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn checkpoint(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| Error::Checkpoint {
        path: path.to_path_buf(),
        reason: "path has no parent directory".to_string(),
    })?;
    fs::create_dir_all(parent)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(CHECKPOINT_TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents).map_err(|e| Error::Checkpoint {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    fs::rename(&tmp, path).map_err(|e| Error::Checkpoint {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Checkpoints the forked init's pid into the runtime directory.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn checkpoint_pid(runtime_dir: &Path, id: &ContainerId, pid: u32) -> Result<()> {
    checkpoint(&pid_path(runtime_dir, id), pid.to_string().as_bytes())
}

/// Reads the checkpointed pid, if any. An absent file means the agent
/// crashed between fork and checkpoint.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn read_pid(runtime_dir: &Path, id: &ContainerId) -> Result<Option<u32>> {
    let path = pid_path(runtime_dir, id);
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&path)?;
    let pid = raw.trim().parse::<u32>().map_err(|e| Error::Checkpoint {
        path,
        reason: format!("malformed pid '{}': {e}", raw.trim()),
    })?;
    Ok(Some(pid))
}

/// Reads the exit status checkpointed by the helper child. An absent or
/// empty file means the init was interrupted before it could write.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn read_status(runtime_dir: &Path, id: &ContainerId) -> Result<Option<i32>> {
    let path = status_path(runtime_dir, id);
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&path)?;
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let status = raw.trim().parse::<i32>().map_err(|e| Error::Checkpoint {
        path,
        reason: format!("malformed status '{}': {e}", raw.trim()),
    })?;
    Ok(Some(status))
}

/// Checkpoints a nested container's termination record.
///
/// # Errors
///
/// Returns an error if serialization or the write fails.
pub fn checkpoint_termination(
    runtime_dir: &Path,
    id: &ContainerId,
    termination: &ContainerTermination,
) -> Result<()> {
    let bytes = serde_json::to_vec(termination)?;
    checkpoint(&termination_path(runtime_dir, id), &bytes)
}

/// Reads a checkpointed termination record, if present.
///
/// # Errors
///
/// Returns an error if the record cannot be deserialized.
pub fn read_termination(
    runtime_dir: &Path,
    id: &ContainerId,
) -> Result<Option<ContainerTermination>> {
    let path = termination_path(runtime_dir, id);
    if !path.exists() {
        return Ok(None);
    }

    let bytes = fs::read(&path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}
