//! Crash recovery.
//!
//! On agent restart the engine reconciles three views of the world:
//!
//! 1. the agent's persisted state (frameworks → executors → latest
//!    runs), which names the containers the agent expects to exist;
//! 2. the engine's runtime directory, which names every container the
//!    engine ever started and has not finalized;
//! 3. the launcher's own notion of live containers.
//!
//! Containers in the first view come back as `Running`. Runtime-
//! directory entries unknown to the agent are either recoverable
//! nested containers (their root survived) or orphans; the launcher
//! may contribute further orphans. Orphans are destroyed once every
//! collaborator has been told about them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{ContainerKind, ExecutorInfo};
use crate::engine::promise::Promise;
use crate::engine::registry::Container;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::isolator::RecoveredContainer;
use crate::paths;
use crate::state::ContainerId;

// =============================================================================
// Persisted Agent State
// =============================================================================

/// Persisted agent state handed to [`Engine::recover`].
#[derive(Debug, Clone, Default)]
pub struct AgentState {
    /// All frameworks with checkpointed executors.
    pub frameworks: Vec<FrameworkState>,
}

/// Persisted per-framework state.
#[derive(Debug, Clone)]
pub struct FrameworkState {
    /// Framework identifier.
    pub id: String,
    /// Executors the framework had running.
    pub executors: Vec<ExecutorState>,
}

/// Persisted per-executor state.
#[derive(Debug, Clone)]
pub struct ExecutorState {
    /// Executor identifier.
    pub id: String,
    /// Executor description; `None` if it could not be recovered.
    pub info: Option<ExecutorInfo>,
    /// Container id of the executor's latest run.
    pub latest: Option<ContainerId>,
    /// All known runs of this executor.
    pub runs: Vec<RunState>,
}

/// Persisted per-run state.
#[derive(Debug, Clone)]
pub struct RunState {
    /// The run's container id.
    pub id: ContainerId,
    /// Checkpointed pid of the forked init, if the launch got far
    /// enough to write it.
    pub forked_pid: Option<u32>,
    /// Whether the run already completed.
    pub completed: bool,
    /// The run's sandbox directory.
    pub directory: PathBuf,
}

impl Engine {
    /// Recovers containers after an agent restart.
    ///
    /// A failure here fails recovery as a whole; the agent is expected
    /// to restart rather than run with a partially recovered engine.
    ///
    /// # Errors
    ///
    /// Fails when persisted state is inconsistent with the filesystem,
    /// or when the launcher, an isolator, the provisioner, or an
    /// orphan destroy fails.
    pub async fn recover(&self, state: Option<AgentState>) -> Result<()> {
        tracing::info!("recovering containerizer");

        // Gather the executor runs worth recovering.
        let mut recoverable: Vec<RecoveredContainer> = Vec::new();
        if let Some(state) = state {
            for framework in state.frameworks {
                for executor in framework.executors {
                    let Some(info) = executor.info else {
                        tracing::warn!(
                            executor = %executor.id,
                            framework = %framework.id,
                            "skipping recovery: executor info could not be recovered"
                        );
                        continue;
                    };
                    let Some(latest) = executor.latest else {
                        tracing::warn!(
                            executor = %executor.id,
                            framework = %framework.id,
                            "skipping recovery: latest run could not be recovered"
                        );
                        continue;
                    };
                    let Some(run) = executor.runs.iter().find(|run| run.id == latest) else {
                        tracing::warn!(
                            executor = %executor.id,
                            "skipping recovery: latest run is not among the checkpointed runs"
                        );
                        continue;
                    };

                    // Without a pid there is nothing to monitor; the
                    // agent's wait on this container fails and cleans
                    // up through the usual path.
                    let Some(pid) = run.forked_pid else {
                        continue;
                    };

                    if run.completed {
                        tracing::debug!(executor = %executor.id, "skipping recovery: run completed");
                        continue;
                    }

                    if info
                        .container
                        .as_ref()
                        .is_some_and(|c| c.kind != ContainerKind::Native)
                    {
                        tracing::info!(
                            executor = %executor.id,
                            "skipping recovery: not launched by this engine"
                        );
                        continue;
                    }

                    // The sandbox is created before the executor is
                    // checkpointed, so it must exist.
                    if !run.directory.exists() {
                        return Err(Error::Recovery(format!(
                            "sandbox directory '{}' for container {latest} does not exist",
                            run.directory.display()
                        )));
                    }

                    tracing::info!(
                        id = %latest,
                        executor = %executor.id,
                        framework = %framework.id,
                        "recovering container"
                    );
                    recoverable.push(RecoveredContainer {
                        id: latest,
                        pid,
                        directory: run.directory.clone(),
                        executor_info: Some(info),
                    });
                }
            }
        }

        // Pids are checkpointed only after a successful launch, so
        // checkpointed containers are running after recovery.
        let mut alive: HashSet<ContainerId> = HashSet::new();
        for recovered in &recoverable {
            alive.insert(recovered.id.clone());
            let status = self.reap(&recovered.id, recovered.pid);
            let container = Container::recovered(
                Some(recovered.directory.clone()),
                Some(recovered.pid),
                status,
                self.prepared_indices(&recovered.id),
            );
            self.inner.registry.insert(recovered.id.clone(), container)?;
        }

        // Reconcile the runtime directory against the agent's view.
        // Discovered orphans are "known orphans", aggregated with
        // whatever the launcher reports below.
        let mut orphans: HashSet<ContainerId> = HashSet::new();
        let runtime_dir = self.inner.config.runtime_dir.clone();
        for id in paths::container_ids(&runtime_dir)? {
            if alive.contains(&id) {
                continue;
            }

            // A checkpointed termination means an already-destroyed
            // nested container whose directory outlives it; skip.
            if paths::termination_path(&runtime_dir, &id).exists() {
                continue;
            }

            // An absent pid file means the agent crashed between fork
            // and checkpoint; the child exits on its own through the
            // closed exec-gate pipe, so there is nothing to reap.
            let pid = paths::read_pid(&runtime_dir, &id)?;

            let mut directory = None;
            if id.has_parent() {
                let root = id.root_id();
                if let Some(root_sandbox) = self
                    .inner
                    .registry
                    .with(root, |c| c.directory.clone())?
                    .flatten()
                {
                    directory = Some(paths::sandbox_path(&root_sandbox, &id));
                }
            }

            let status = match pid {
                Some(pid) => self.reap(&id, pid),
                None => Promise::resolved(None),
            };
            let container = Container::recovered(
                directory.clone(),
                pid,
                status,
                self.prepared_indices(&id),
            );
            self.inner.registry.insert(id.clone(), container)?;

            // A nested container whose root survived is recoverable,
            // so isolators get to see it; everything else is an
            // orphan.
            match (pid, directory) {
                (Some(pid), Some(directory)) if alive.contains(id.root_id()) => {
                    alive.insert(id.clone());
                    recoverable.push(RecoveredContainer {
                        id,
                        pid,
                        directory,
                        executor_info: None,
                    });
                }
                _ => {
                    orphans.insert(id);
                }
            }
        }

        // The launcher may know about containers the engine does not;
        // register stubs for them and fold them into the orphan set.
        let launcher_orphans = self.inner.launcher.recover(&recoverable).await?;
        for id in launcher_orphans {
            if !self.inner.registry.contains(&id)? {
                let container = Container::recovered(
                    None,
                    None,
                    Promise::resolved(None),
                    self.prepared_indices(&id),
                );
                self.inner.registry.insert(id.clone(), container)?;
            }
            if !alive.contains(&id) {
                orphans.insert(id);
            }
        }

        // Isolators next (stripping nested entries for those unaware
        // of nesting), then the provisioner over every known id, so
        // both can clean up state for containers nobody claims.
        let root_recoverable: Vec<RecoveredContainer> = recoverable
            .iter()
            .filter(|r| !r.id.has_parent())
            .cloned()
            .collect();
        let root_orphans: HashSet<ContainerId> = orphans
            .iter()
            .filter(|o| !o.has_parent())
            .cloned()
            .collect();

        let isolator_futures = self.inner.isolators.iter().map(|isolator| {
            let isolator = Arc::clone(isolator);
            let (containers, orphan_set) = if isolator.supports_nesting() {
                (&recoverable, &orphans)
            } else {
                (&root_recoverable, &root_orphans)
            };
            async move { isolator.recover(containers, orphan_set).await }
        });
        futures::future::try_join_all(isolator_futures)
            .await
            .map_err(|e| Error::Recovery(format!("failed to recover isolators: {e}")))?;

        let known: HashSet<ContainerId> = alive.union(&orphans).cloned().collect();
        self.inner
            .provisioner
            .recover(&known)
            .await
            .map_err(|e| Error::Recovery(format!("failed to recover provisioner: {e}")))?;

        // Limitation watches and logger re-attachment for recovered
        // containers; reap callbacks for everything registered, now
        // that parent/child links are in place and destroy can rely
        // on them.
        for recovered in &recoverable {
            for (_, isolator) in self.applicable_isolators(&recovered.id) {
                self.install_limitation_watch(recovered.id.clone(), isolator);
            }

            if !recovered.id.has_parent() {
                if let Err(e) = self
                    .inner
                    .logger
                    .recover(recovered.executor_info.as_ref(), &recovered.directory)
                    .await
                {
                    tracing::warn!(
                        id = %recovered.id,
                        error = %e,
                        "container logger failed to recover executor"
                    );
                }
            }
        }

        for id in self.inner.registry.keys()? {
            let status = self.inner.registry.with(&id, |c| c.status.clone())?.flatten();
            if let Some(status) = status {
                self.install_reap_callback(id.clone(), status);
            }
        }

        // Orphans go last, with every collaborator already aware of
        // them.
        let destroys: Vec<_> = orphans
            .iter()
            .map(|id| {
                tracing::info!(id = %id, "cleaning up orphan container");
                self.destroy(id)
            })
            .collect();
        for result in futures::future::join_all(destroys).await {
            if let Err(e) = result {
                return Err(Error::Recovery(format!(
                    "failed to destroy orphan container: {e}"
                )));
            }
        }

        Ok(())
    }

    /// Every applicable isolator index for `id`; recovered containers
    /// are treated as if all of them had prepared, so cleanup runs on
    /// eventual destroy.
    fn prepared_indices(&self, id: &ContainerId) -> Vec<usize> {
        self.applicable_isolators(id)
            .into_iter()
            .map(|(index, _)| index)
            .collect()
    }
}
