//! Stage-aware container teardown.
//!
//! Destroy races the launch by flipping the container into
//! `Destroying`; every launch stage converts itself into a failure at
//! its next re-check. The unwind path is selected by the state the
//! container was in when destroy arrived:
//!
//! - `Provisioning`: wait out the provisioner, no processes to kill;
//! - `Preparing`: wait out the prepare chain (and the init's exit, if
//!   one was forked — the closing exec-gate pipe kills it);
//! - `Isolating`: wait out isolation, then kill;
//! - `Fetching`: abort the fetch, then kill;
//! - `Running`: kill.
//!
//! After the container's processes are gone, isolators are cleaned up
//! in reverse of the prepare order that succeeded, the provisioner
//! tears down the rootfs, and the termination is composed and
//! fulfilled. Any failure on this path fails the termination instead,
//! bumps the destroy-error counter, and leaves the container in the
//! registry so the stuck state stays observable.

use std::fs;
use std::future::Future;
use std::pin::Pin;

use crate::engine::promise::Promise;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::paths;
use crate::state::{ContainerId, ContainerTermination, LifecycleState, TaskState};

impl Engine {
    /// Destroys a container and everything nested under it.
    ///
    /// Idempotent: a destroy of an unknown id returns `Ok(false)`;
    /// concurrent destroys all converge on the same termination.
    ///
    /// # Errors
    ///
    /// Fails when the teardown itself failed (processes that would
    /// not die, isolator cleanup errors, provisioner errors).
    pub fn destroy<'a>(
        &'a self,
        id: &'a ContainerId,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move {
            let decision = self.inner.registry.with(id, |container| {
                if container.state == LifecycleState::Destroying {
                    (container.termination.clone(), None)
                } else {
                    let previous = container.state;
                    container.state = LifecycleState::Destroying;
                    let children: Vec<ContainerId> = container.children.iter().cloned().collect();
                    (container.termination.clone(), Some((previous, children)))
                }
            })?;

            let Some((termination, work)) = decision else {
                tracing::warn!(id = %id, "attempted to destroy unknown container");
                return Ok(false);
            };

            if let Some((previous, children)) = work {
                tracing::info!(id = %id, state = %previous, "destroying container");

                // The teardown runs detached so that a cancelled caller
                // cannot abandon the unwind halfway.
                let engine = self.clone();
                let teardown_id = id.clone();
                tokio::spawn(async move {
                    engine.teardown(teardown_id, previous, children).await;
                });
            }

            match termination.wait().await {
                Ok(_) => Ok(true),
                Err(reason) => Err(Error::DestroyFailed {
                    id: id.to_string(),
                    reason,
                }),
            }
        })
    }

    async fn teardown(
        &self,
        id: ContainerId,
        previous: LifecycleState,
        children: Vec<ContainerId>,
    ) {
        // Children must be fully destroyed before any of the parent's
        // teardown stages run. Boxed: destroy and teardown are
        // mutually recursive futures.
        let destroys = children.iter().map(|child| Box::pin(self.destroy(child)));
        let results = futures::future::join_all(destroys).await;

        let errors: Vec<String> = results
            .into_iter()
            .filter_map(|result| result.err())
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            self.fail_termination(
                &id,
                format!("failed to destroy nested containers: {}", errors.join("; ")),
            );
            return;
        }

        let pending = self.inner.registry.with(&id, |c| {
            (
                c.provisioning.clone(),
                c.launch_infos.clone(),
                c.isolation.clone(),
                c.status.clone(),
            )
        });
        let Ok(Some((provisioning, launch_infos, isolation, mut status))) = pending else {
            tracing::error!(id = %id, "container disappeared during teardown");
            return;
        };

        match previous {
            LifecycleState::Provisioning => {
                // No isolator entered prepare, so the unwind continues
                // straight to the provisioner once provisioning has
                // settled either way.
                if let Some(provisioning) = provisioning {
                    tracing::debug!(id = %id, "waiting for provisioning to complete");
                    let _ = provisioning.wait().await;
                }
            }
            LifecycleState::Preparing => {
                // Cleanup must not overtake a prepare that is still in
                // flight.
                if let Some(launch_infos) = launch_infos {
                    tracing::debug!(id = %id, "waiting for isolators to complete preparing");
                    let _ = launch_infos.wait().await;
                }

                // The launcher may have forked while the chain was
                // settling; the failing launch drops the exec-gate
                // pipe, the child exits on its own, and the reap
                // confirms it. Re-read the reap handle, which may have
                // appeared after the first snapshot.
                status = self
                    .inner
                    .registry
                    .with(&id, |c| c.status.clone())
                    .ok()
                    .flatten()
                    .flatten();
                if let Some(status) = &status {
                    let _ = status.wait().await;
                }
            }
            LifecycleState::Isolating => {
                if let Some(isolation) = isolation {
                    tracing::debug!(id = %id, "waiting for isolators to complete isolation");
                    let _ = isolation.wait().await;
                }
                if !self.kill_processes(&id, status.as_ref()).await {
                    return;
                }
            }
            LifecycleState::Fetching => {
                self.inner.fetcher.kill(&id).await;
                if !self.kill_processes(&id, status.as_ref()).await {
                    return;
                }
            }
            LifecycleState::Running => {
                if !self.kill_processes(&id, status.as_ref()).await {
                    return;
                }
            }
            // `previous` is captured before the flip; it can never be
            // `Destroying` here.
            LifecycleState::Destroying => {
                tracing::error!(id = %id, "teardown entered with destroying as previous state");
            }
        }

        self.finish_teardown(&id, status).await;
    }

    /// Kills every process in the container, then awaits the reap so
    /// isolators may safely inspect a dead process. Returns false when
    /// the teardown must stop.
    async fn kill_processes(
        &self,
        id: &ContainerId,
        status: Option<&Promise<Option<i32>>>,
    ) -> bool {
        if let Err(e) = self.inner.launcher.destroy(id).await {
            // Isolators may require that all processes have exited;
            // with live processes left behind there is nothing safe to
            // do but surface the failure.
            self.fail_termination(
                id,
                format!("failed to kill all processes in the container: {e}"),
            );
            return false;
        }

        if let Some(status) = status {
            let _ = status.wait().await;
        }
        true
    }

    async fn finish_teardown(&self, id: &ContainerId, status: Option<Promise<Option<i32>>>) {
        // Clean up isolators in reverse of the prepare order that
        // succeeded. Best-effort: every isolator is attempted even if
        // an earlier one fails.
        let prepared = match self.inner.registry.with(id, |c| c.prepared.clone()) {
            Ok(Some(prepared)) => prepared,
            _ => return,
        };

        let mut errors = Vec::new();
        for index in prepared.iter().rev() {
            let Some(isolator) = self.inner.isolators.get(*index) else {
                continue;
            };
            if let Err(e) = isolator.cleanup(id).await {
                errors.push(format!("isolator '{}': {e}", isolator.name()));
            }
        }
        if !errors.is_empty() {
            self.fail_termination(
                id,
                format!(
                    "failed to clean up an isolator when destroying container: {}",
                    errors.join("; ")
                ),
            );
            return;
        }

        if let Err(e) = self.inner.provisioner.destroy(id).await {
            self.fail_termination(
                id,
                format!("failed to destroy the provisioned rootfs: {e}"),
            );
            return;
        }

        let limitations = match self.inner.registry.with(id, |c| c.limitations.clone()) {
            Ok(Some(limitations)) => limitations,
            _ => return,
        };

        let mut termination = ContainerTermination {
            status: status.as_ref().and_then(Promise::try_get).flatten(),
            ..ContainerTermination::default()
        };

        // A limitation may arrive just as the executor exits; both the
        // exit status and the limitation are preserved.
        if !limitations.is_empty() {
            termination.state = Some(TaskState::TaskFailed);
            termination.message = Some(
                limitations
                    .iter()
                    .map(|l| l.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            );
            termination.reasons = limitations.iter().filter_map(|l| l.reason).collect();
        }

        // Runtime directory disposal, under the registry lock so it
        // cannot interleave with a checkpoint from a racing launch:
        //
        // - nested containers keep their directory until the root is
        //   destroyed; the checkpointed termination answers later
        //   waits and stops repeat destroys;
        // - roots remove the whole directory, sweeping any surviving
        //   nested directories with it.
        let runtime_dir = self.inner.config.runtime_dir.clone();
        let checkpoint_result = self.inner.registry.with(id, |_| {
            if id.has_parent() {
                tracing::info!(id = %id, "checkpointing termination state to the runtime directory");
                if let Err(e) = paths::checkpoint_termination(&runtime_dir, id, &termination) {
                    tracing::error!(id = %id, error = %e, "failed to checkpoint termination state");
                }
            } else {
                let path = paths::runtime_path(&runtime_dir, id);
                if path.exists() {
                    if let Err(e) = fs::remove_dir_all(&path) {
                        tracing::warn!(id = %id, error = %e, "failed to remove the runtime directory");
                    }
                }
            }
            termination.clone()
        });

        let Ok(Some(termination)) = checkpoint_result else {
            return;
        };

        let fulfilled = self
            .inner
            .registry
            .with(id, |c| c.termination.set(Ok(termination)))
            .unwrap_or(None)
            .unwrap_or(false);
        if !fulfilled {
            tracing::error!(id = %id, "termination was already settled");
        }

        if let Err(e) = self.inner.registry.remove(id) {
            tracing::error!(id = %id, error = %e, "failed to remove container from registry");
        }
        self.inner.metrics.record_destroy();
    }

    pub(crate) fn fail_termination(&self, id: &ContainerId, reason: String) {
        tracing::error!(id = %id, reason = %reason, "container destroy failed");
        let _ = self
            .inner
            .registry
            .with(id, |c| c.termination.set(Err(reason)));
        self.inner.metrics.record_destroy_error();
    }
}
