//! In-memory container registry.
//!
//! The registry maps live [`ContainerId`]s to their engine-side
//! records. A container is in the registry iff the engine considers it
//! live; destruction removes it only after its termination settles.
//! Parent/child edges are maintained symmetrically on insert and
//! remove, and all mutation is serialized through the registry's lock,
//! which is never held across an await.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::{ContainerConfig, Resources};
use crate::engine::promise::Promise;
use crate::error::{Error, Result};
use crate::isolator::LaunchInfo;
use crate::provisioner::ProvisionInfo;
use crate::state::{ContainerId, ContainerLimitation, ContainerTermination, LifecycleState};

/// Result of an in-flight stage; errors are carried as messages so
/// every waiter can clone them.
pub(crate) type StageResult<T> = std::result::Result<T, String>;

/// Result a termination promise settles with. `Err` means the destroy
/// itself failed and the container stays observable in the registry.
pub(crate) type TerminationResult = std::result::Result<ContainerTermination, String>;

/// Engine-side record of one container.
#[derive(Debug)]
pub(crate) struct Container {
    /// Lifecycle state; advances monotonically until `Destroying`.
    pub state: LifecycleState,
    /// The launch configuration (rootfs and manifests filled in after
    /// provisioning).
    pub config: ContainerConfig,
    /// Current resource allocation.
    pub resources: Resources,
    /// Host sandbox directory.
    pub directory: Option<PathBuf>,
    /// Pid of the container init; set at most once, after fork.
    pub pid: Option<u32>,
    /// Pending reap result for `pid` (raw wait status).
    pub status: Option<Promise<Option<i32>>>,
    /// Pending image provisioning result.
    pub provisioning: Option<Promise<StageResult<ProvisionInfo>>>,
    /// Pending result of the serial isolator prepare chain.
    pub launch_infos: Option<Promise<StageResult<Vec<Option<LaunchInfo>>>>>,
    /// Pending result of the parallel isolation step.
    pub isolation: Option<Promise<StageResult<()>>>,
    /// Pipeline indices of isolators whose `prepare` succeeded, in the
    /// order they ran. Cleanup walks this in reverse.
    pub prepared: Vec<usize>,
    /// Ids of nested containers whose parent is this container.
    pub children: BTreeSet<ContainerId>,
    /// Limitations reported by isolator watches.
    pub limitations: Vec<ContainerLimitation>,
    /// The termination every `wait` observer receives.
    pub termination: Promise<TerminationResult>,
    /// Fair queue serializing `status` requests for this container.
    pub sequence: Arc<tokio::sync::Mutex<()>>,
}

impl Container {
    /// Creates a record for a container entering the lifecycle.
    pub(crate) fn launching(config: ContainerConfig) -> Self {
        let resources = config.resources;
        let directory = Some(config.directory.clone());
        Self {
            state: LifecycleState::Provisioning,
            config,
            resources,
            directory,
            pid: None,
            status: None,
            provisioning: None,
            launch_infos: None,
            isolation: None,
            prepared: Vec::new(),
            children: BTreeSet::new(),
            limitations: Vec::new(),
            termination: Promise::new(),
            sequence: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Creates a record for a container found running at recovery.
    /// `prepared` is set to every applicable isolator so cleanup still
    /// runs when the container is eventually destroyed.
    pub(crate) fn recovered(
        directory: Option<PathBuf>,
        pid: Option<u32>,
        status: Promise<Option<i32>>,
        prepared: Vec<usize>,
    ) -> Self {
        Self {
            state: LifecycleState::Running,
            config: ContainerConfig::default(),
            resources: Resources::default(),
            directory,
            pid,
            status: Some(status),
            provisioning: None,
            launch_infos: None,
            isolation: None,
            prepared,
            children: BTreeSet::new(),
            limitations: Vec::new(),
            termination: Promise::new(),
            sequence: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Table of live containers.
#[derive(Default)]
pub(crate) struct Registry {
    containers: Mutex<HashMap<ContainerId, Container>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Inserts a container, linking it into its parent's `children`
    /// set when the parent is present. Used during recovery, where a
    /// parent may legitimately be absent (launcher-reported orphans).
    pub(crate) fn insert(&self, id: ContainerId, container: Container) -> Result<()> {
        let mut containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;

        if containers.contains_key(&id) {
            return Err(Error::ContainerAlreadyExists(id.to_string()));
        }

        if let Some(parent) = id.parent() {
            if let Some(parent_container) = containers.get_mut(parent) {
                parent_container.children.insert(id.clone());
            } else {
                tracing::debug!(id = %id, "inserting container whose parent is not registered");
            }
        }

        containers.insert(id, container);
        Ok(())
    }

    /// Inserts a launching container, validating atomically that a
    /// nested id's parent is present and not being destroyed.
    pub(crate) fn insert_for_launch(&self, id: ContainerId, container: Container) -> Result<()> {
        let mut containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;

        if containers.contains_key(&id) {
            return Err(Error::ContainerAlreadyExists(id.to_string()));
        }

        if let Some(parent) = id.parent() {
            match containers.get_mut(parent) {
                None => return Err(Error::ParentNotFound(parent.to_string())),
                Some(parent_container)
                    if parent_container.state == LifecycleState::Destroying =>
                {
                    return Err(Error::ParentDestroying(parent.to_string()));
                }
                Some(parent_container) => {
                    parent_container.children.insert(id.clone());
                }
            }
        }

        containers.insert(id, container);
        Ok(())
    }

    /// Removes a container, unlinking it from its parent's `children`.
    pub(crate) fn remove(&self, id: &ContainerId) -> Result<Option<Container>> {
        let mut containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;

        let removed = containers.remove(id);
        if removed.is_some() {
            if let Some(parent) = id.parent() {
                if let Some(parent_container) = containers.get_mut(parent) {
                    parent_container.children.remove(id);
                }
            }
        }
        Ok(removed)
    }

    /// Runs `f` against the container's record under the registry
    /// lock. Returns `None` if the container is not registered.
    pub(crate) fn with<R>(
        &self,
        id: &ContainerId,
        f: impl FnOnce(&mut Container) -> R,
    ) -> Result<Option<R>> {
        let mut containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(containers.get_mut(id).map(f))
    }

    /// Returns whether the container is registered.
    pub(crate) fn contains(&self, id: &ContainerId) -> Result<bool> {
        let containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(containers.contains_key(id))
    }

    /// Returns all registered ids.
    pub(crate) fn keys(&self) -> Result<Vec<ContainerId>> {
        let containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;
        Ok(containers.keys().cloned().collect())
    }

    /// Returns all (parent, child) edges.
    pub(crate) fn edges(&self) -> Result<Vec<(ContainerId, ContainerId)>> {
        let containers = self.containers.lock().map_err(|_| Error::LockPoisoned)?;
        let mut edges = Vec::new();
        for (id, container) in containers.iter() {
            for child in &container.children {
                edges.push((id.clone(), child.clone()));
            }
        }
        Ok(edges)
    }
}
