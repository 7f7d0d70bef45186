//! The container lifecycle engine.
//!
//! The engine drives containers through
//! `provisioning → preparing → isolating → fetching → running` and,
//! on destroy, selects a stage-aware unwind path. It multiplexes a
//! pluggable isolator pipeline, a launcher, a provisioner, a fetcher,
//! and a container logger, and keeps crash-recoverable state in its
//! runtime directory.
//!
//! # Launching
//!
//! 1. Provision the root filesystem image, if one is requested.
//! 2. Run `prepare` on each isolator, strictly in pipeline order.
//! 3. Fork the helper via the launcher. The child blocks on the
//!    exec-gate pipe until it has been isolated.
//! 4. Run `isolate` on all isolators in parallel.
//! 5. Fetch the command's URI assets into the sandbox.
//! 6. Signal the child to exec by writing a byte to the pipe.
//!
//! Registry membership and the destroying flag are re-checked after
//! every suspension point; a concurrent destroy races the launch by
//! flipping the state and wins at the next re-check.

mod destroy;
mod promise;
mod recover;
mod registry;

pub use recover::{AgentState, ExecutorState, FrameworkState, RunState};

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::config::{
    CommandSpec, ContainerConfig, ContainerInfo, ContainerKind, EnvironmentMap, Resources,
};
use crate::constants::{
    FILESYSTEM_ISOLATOR_PREFIX, HELPER_BINARY, HELPER_LAUNCH_COMMAND, SANDBOX_ENV,
    SIGKILL_WAIT_STATUS,
};
use crate::error::{Error, Result};
use crate::fetcher::Fetcher;
use crate::isolator::{ContainerStatus, Isolator, LaunchInfo, ResourceStatistics};
use crate::launcher::{IoRedirect, LaunchFlags, Launcher, Reaper};
use crate::logger::ContainerLogger;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::paths;
use crate::provisioner::Provisioner;
use crate::state::{ContainerId, ContainerLimitation, ContainerTermination, LifecycleState};

use promise::Promise;
use registry::{Container, Registry};

/// Callback run after a container's assets were fetched.
pub type PostFetchHook = Arc<dyn Fn(&ContainerId, &Path) + Send + Sync>;

// =============================================================================
// Configuration
// =============================================================================

/// Static engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the engine's private runtime directory.
    pub runtime_dir: PathBuf,
    /// Agent meta directory for pid records requested via
    /// `checkpoint`; `None` disables meta checkpointing.
    pub meta_dir: Option<PathBuf>,
    /// Directory containing the helper binary.
    pub helper_dir: PathBuf,
    /// Sandbox mount point as seen from inside a container that uses
    /// a provisioned root filesystem.
    pub sandbox_mount_point: PathBuf,
    /// Identifier of the agent this engine runs in, passed through to
    /// the fetcher.
    pub agent_id: String,
}

// =============================================================================
// Engine
// =============================================================================

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) isolators: Vec<Arc<dyn Isolator>>,
    pub(crate) launcher: Arc<dyn Launcher>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) logger: Arc<dyn ContainerLogger>,
    pub(crate) reaper: Arc<dyn Reaper>,
    pub(crate) registry: Registry,
    pub(crate) metrics: EngineMetrics,
    post_fetch_hook: OnceLock<PostFetchHook>,
}

/// The container lifecycle engine. Cheap to clone; all clones share
/// one registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Creates an engine over the given collaborators.
    ///
    /// Isolators run in the given order, except that filesystem
    /// isolators are moved to the front (preserving their relative
    /// order) so every later isolator observes a prepared filesystem.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn Launcher>,
        provisioner: Arc<dyn Provisioner>,
        fetcher: Arc<dyn Fetcher>,
        logger: Arc<dyn ContainerLogger>,
        reaper: Arc<dyn Reaper>,
        isolators: Vec<Arc<dyn Isolator>>,
    ) -> Self {
        let (mut ordered, other): (Vec<_>, Vec<_>) = isolators
            .into_iter()
            .partition(|isolator| isolator.name().starts_with(FILESYSTEM_ISOLATOR_PREFIX));
        ordered.extend(other);

        Self {
            inner: Arc::new(Inner {
                config,
                isolators: ordered,
                launcher,
                provisioner,
                fetcher,
                logger,
                reaper,
                registry: Registry::new(),
                metrics: EngineMetrics::default(),
                post_fetch_hook: OnceLock::new(),
            }),
        }
    }

    /// Installs the post-fetch hook. Only the first call takes effect.
    pub fn set_post_fetch_hook(&self, hook: PostFetchHook) {
        let _ = self.inner.post_fetch_hook.set(hook);
    }

    /// Returns a snapshot of the engine counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Returns the ids of all live containers.
    pub fn containers(&self) -> Result<Vec<ContainerId>> {
        self.inner.registry.keys()
    }

    // =========================================================================
    // Launch
    // =========================================================================

    /// Launches a container.
    ///
    /// Returns `Ok(false)` when the config names an isolation backend
    /// this engine does not handle. On a stage failure the partially
    /// built container is destroyed before the error is returned; its
    /// termination is still fulfilled for `wait` observers.
    ///
    /// # Errors
    ///
    /// Fails if the id is already started, a nested id's parent is
    /// absent or being destroyed, or any lifecycle stage fails.
    pub async fn launch(
        &self,
        id: &ContainerId,
        config: ContainerConfig,
        environment: EnvironmentMap,
        checkpoint: bool,
    ) -> Result<bool> {
        if let Some(info) = &config.container_info {
            if info.kind != ContainerKind::Native {
                return Ok(false);
            }
        }

        if self.inner.registry.contains(id)? {
            return Err(Error::ContainerAlreadyExists(id.to_string()));
        }

        if let Some(parent) = id.parent() {
            match self.inner.registry.with(parent, |c| c.state)? {
                None => return Err(Error::ParentNotFound(parent.to_string())),
                Some(LifecycleState::Destroying) => {
                    return Err(Error::ParentDestroying(parent.to_string()));
                }
                Some(_) => {}
            }
        }

        // The runtime directory holds internal checkpoint state for
        // this container; it must exist before anything else happens.
        let runtime_path = paths::runtime_path(&self.inner.config.runtime_dir, id);
        fs::create_dir_all(&runtime_path).map_err(|e| Error::LaunchFailed {
            id: id.to_string(),
            reason: format!(
                "failed to create the runtime directory '{}': {e}",
                runtime_path.display()
            ),
        })?;

        tracing::info!(id = %id, "starting container");
        self.inner
            .registry
            .insert_for_launch(id.clone(), Container::launching(config))?;
        self.inner.metrics.record_launch();

        match self.launch_inner(id, environment, checkpoint).await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "launch failed, destroying container");
                if let Err(destroy_error) = self.destroy(id).await {
                    tracing::warn!(
                        id = %id,
                        error = %destroy_error,
                        "failed to destroy container after launch failure"
                    );
                }
                Err(e)
            }
        }
    }

    /// Launches a nested container under an existing parent.
    ///
    /// The nested sandbox is created under the root container's
    /// sandbox; `user`, when given, is applied to it best-effort. The
    /// launch then follows the same pipeline as root containers, with
    /// meta checkpointing disabled.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not nested, or the parent is absent or being
    /// destroyed.
    pub async fn launch_nested(
        &self,
        id: &ContainerId,
        command: CommandSpec,
        container_info: Option<ContainerInfo>,
        user: Option<String>,
    ) -> Result<bool> {
        let Some(parent) = id.parent() else {
            return Err(Error::Internal(format!(
                "nested launch requires a nested container id, got {id}"
            )));
        };

        match self.inner.registry.with(parent, |c| c.state)? {
            None => return Err(Error::ParentNotFound(parent.to_string())),
            Some(LifecycleState::Destroying) => {
                return Err(Error::ParentDestroying(parent.to_string()));
            }
            Some(_) => {}
        }

        tracing::info!(id = %id, "starting nested container");

        let root = id.root_id();
        let root_sandbox = self
            .inner
            .registry
            .with(root, |c| c.directory.clone())?
            .flatten()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "unexpected empty sandbox directory for root container {root}"
                ))
            })?;

        let directory = paths::sandbox_path(&root_sandbox, id);
        fs::create_dir_all(&directory)?;

        if let Some(user) = &user {
            chown_best_effort(&directory, user);
        }

        let mut config = ContainerConfig::new(command, directory);
        config.user = user;
        config.container_info = container_info;

        self.launch(id, config, EnvironmentMap::new(), false).await
    }

    async fn launch_inner(
        &self,
        id: &ContainerId,
        environment: EnvironmentMap,
        checkpoint: bool,
    ) -> Result<()> {
        let image = self
            .inner
            .registry
            .with(id, |c| c.config.image().cloned())?
            .flatten();

        let provision_info = match image {
            Some(image) => {
                // Install the pending result before the provisioner
                // runs, under the same lock that a concurrent destroy
                // takes to flip the state: either the destroy sees
                // this handle and awaits it, or this launch sees
                // `Destroying` and never starts provisioning.
                let promise = Promise::new();
                let installed = self
                    .inner
                    .registry
                    .with(id, |c| {
                        if c.state == LifecycleState::Destroying {
                            return false;
                        }
                        c.provisioning = Some(promise.clone());
                        true
                    })?
                    .unwrap_or(false);
                if !installed {
                    return Err(Error::LaunchFailed {
                        id: id.to_string(),
                        reason: "container is being destroyed during provisioning".to_string(),
                    });
                }

                let provisioner = Arc::clone(&self.inner.provisioner);
                let provision_id = id.clone();
                let settle = promise.clone();
                tokio::spawn(async move {
                    settle.set(
                        provisioner
                            .provision(&provision_id, &image)
                            .await
                            .map_err(|e| e.to_string()),
                    );
                });

                match promise.wait().await {
                    Ok(info) => Some(info),
                    Err(reason) => {
                        return Err(Error::LaunchFailed {
                            id: id.to_string(),
                            reason: format!("failed to provision image: {reason}"),
                        });
                    }
                }
            }
            None => None,
        };

        let launch_infos = self.prepare(id, provision_info).await?;
        self.finish_launch(id, environment, checkpoint, launch_infos)
            .await
    }

    /// Applies the provision result and runs the serial isolator
    /// prepare chain. The chain's pending result is stored on the
    /// container so a concurrent destroy can await it.
    async fn prepare(
        &self,
        id: &ContainerId,
        provision_info: Option<crate::provisioner::ProvisionInfo>,
    ) -> Result<Vec<Option<LaunchInfo>>> {
        self.ensure_live(id, LifecycleState::Provisioning)?;
        self.set_state(id, LifecycleState::Preparing)?;

        if let Some(info) = provision_info {
            if info.docker_manifest.is_some() && info.appc_manifest.is_some() {
                return Err(Error::LaunchFailed {
                    id: id.to_string(),
                    reason: "container cannot have both docker and appc manifests".to_string(),
                });
            }

            self.inner.registry.with(id, |c| {
                c.config.rootfs = Some(info.rootfs.clone());
                c.config.docker_manifest = info.docker_manifest.clone();
                c.config.appc_manifest = info.appc_manifest.clone();
            })?;
        }

        let config = self
            .inner
            .registry
            .with(id, |c| c.config.clone())?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let applicable = self.applicable_isolators(id);

        // As with provisioning: install the pending chain result
        // before the chain runs, so a destroy arriving mid-chain can
        // await it.
        let promise = Promise::new();
        let installed = self
            .inner
            .registry
            .with(id, |c| {
                if c.state == LifecycleState::Destroying {
                    return false;
                }
                c.launch_infos = Some(promise.clone());
                true
            })?
            .unwrap_or(false);
        if !installed {
            return Err(Error::LaunchFailed {
                id: id.to_string(),
                reason: "container is being destroyed during preparing".to_string(),
            });
        }

        let engine = self.clone();
        let chain_id = id.clone();
        let settle = promise.clone();
        tokio::spawn(async move {
            let mut infos = Vec::new();
            for (index, isolator) in applicable {
                match engine.inner.registry.with(&chain_id, |c| c.state) {
                    Ok(Some(state)) if state != LifecycleState::Destroying => {}
                    Ok(Some(_)) => {
                        settle.set(Err(
                            "container is being destroyed during preparing".to_string()
                        ));
                        return;
                    }
                    Ok(None) => {
                        settle.set(Err("container destroyed during preparing".to_string()));
                        return;
                    }
                    Err(e) => {
                        settle.set(Err(e.to_string()));
                        return;
                    }
                }

                match isolator.prepare(&chain_id, &config).await {
                    Ok(info) => {
                        let _ = engine
                            .inner
                            .registry
                            .with(&chain_id, |c| c.prepared.push(index));
                        infos.push(info);
                    }
                    Err(e) => {
                        settle.set(Err(format!(
                            "isolator '{}' failed to prepare: {e}",
                            isolator.name()
                        )));
                        return;
                    }
                }
            }
            settle.set(Ok(infos));
        });

        promise.wait().await.map_err(|reason| Error::LaunchFailed {
            id: id.to_string(),
            reason,
        })
    }

    /// Merges isolator contributions, forks the init through the
    /// launcher, and walks the remaining stages to `Running`.
    async fn finish_launch(
        &self,
        id: &ContainerId,
        mut environment: EnvironmentMap,
        checkpoint: bool,
        launch_infos: Vec<Option<LaunchInfo>>,
    ) -> Result<()> {
        self.ensure_live(id, LifecycleState::Preparing)?;
        let config = self
            .inner
            .registry
            .with(id, |c| c.config.clone())?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        // The sandbox path as the container sees it.
        let sandbox_env = if config.rootfs.is_some() {
            self.inner.config.sandbox_mount_point.clone()
        } else {
            config.directory.clone()
        };
        environment.insert(SANDBOX_ENV.to_string(), sandbox_env.display().to_string());

        let mut launch_command: Option<CommandSpec> = None;
        let mut working_directory: Option<PathBuf> = None;
        let mut pre_exec_commands: Vec<CommandSpec> = Vec::new();
        let mut namespaces: u32 = 0;
        let mut capabilities: Option<Vec<String>> = None;

        for info in launch_infos.iter().flatten() {
            for (name, value) in &info.environment {
                if environment.insert(name.clone(), value.clone()).is_some() {
                    tracing::debug!(id = %id, variable = %name, "overwriting environment variable");
                }
            }

            if let Some(command) = &info.command {
                match &mut launch_command {
                    // Isolators are responsible for the merged command
                    // being valid.
                    Some(merged) => {
                        tracing::debug!(id = %id, "merging launch commands from two isolators");
                        merged.merge_from(command);
                    }
                    None => launch_command = Some(command.clone()),
                }
            }

            if let Some(dir) = &info.working_directory {
                if working_directory.is_some() {
                    return Err(Error::LaunchFailed {
                        id: id.to_string(),
                        reason: "at most one working directory can be returned from isolators"
                            .to_string(),
                    });
                }
                working_directory = Some(dir.clone());
            }

            pre_exec_commands.extend(info.pre_exec_commands.iter().cloned());
            namespaces |= info.namespaces;

            if let Some(caps) = &info.capabilities {
                if capabilities.is_some() {
                    return Err(Error::LaunchFailed {
                        id: id.to_string(),
                        reason: "at most one capabilities set can be returned from isolators"
                            .to_string(),
                    });
                }
                capabilities = Some(caps.clone());
            }
        }

        let mut command = launch_command.unwrap_or_else(|| config.command.clone());

        // Command-level environment is carried out-of-band; fold it in
        // and strip the fields the helper must not see twice.
        for (name, value) in &config.command.environment {
            if environment.insert(name.clone(), value.clone()).is_some() {
                tracing::debug!(id = %id, variable = %name, "overwriting environment variable");
            }
        }
        command.uris.clear();
        command.environment.clear();
        command.user = None;

        let rootfs = config.rootfs.clone();
        let working_directory = if rootfs.is_none() {
            // The container shares the host filesystem; letting it cd
            // into an arbitrary directory would be a security issue.
            if let Some(dir) = &working_directory {
                tracing::warn!(
                    id = %id,
                    directory = %dir.display(),
                    "ignoring isolator working directory since the container uses the host filesystem"
                );
            }
            config.directory.clone()
        } else {
            working_directory.unwrap_or_else(|| self.inner.config.sandbox_mount_point.clone())
        };

        let subprocess = self
            .inner
            .logger
            .prepare(config.executor_info.as_ref(), &config.directory)
            .await
            .map_err(|e| Error::LaunchFailed {
                id: id.to_string(),
                reason: format!("failed to prepare the container logger: {e}"),
            })?;
        self.ensure_live(id, LifecycleState::Preparing)?;

        // Exec-gate pipe: the forked helper blocks reading until it
        // has been isolated and fetched.
        let (pipe_read, pipe_write) = make_pipe().map_err(|e| Error::LaunchFailed {
            id: id.to_string(),
            reason: format!("failed to create the exec-gate pipe: {e}"),
        })?;

        let flags = LaunchFlags {
            command,
            working_directory,
            rootfs,
            user: config.user.clone(),
            pipe_read: pipe_read.as_raw_fd(),
            pipe_write: pipe_write.as_raw_fd(),
            pre_exec_commands,
            capabilities,
            runtime_directory: paths::runtime_path(&self.inner.config.runtime_dir, id),
        };
        let argv = vec![
            HELPER_BINARY.to_string(),
            HELPER_LAUNCH_COMMAND.to_string(),
        ];
        let helper_path = self.inner.config.helper_dir.join(HELPER_BINARY);

        tracing::debug!(id = %id, helper = %helper_path.display(), "forking container init");

        let pid = self
            .inner
            .launcher
            .fork(
                id,
                &helper_path,
                &argv,
                IoRedirect::Inherit,
                subprocess.stdout,
                subprocess.stderr,
                &flags,
                &environment,
                namespaces,
            )
            .await
            .map_err(|e| Error::LaunchFailed {
                id: id.to_string(),
                reason: format!("failed to fork: {e}"),
            })?;

        // Monitor the init straight away, so the child never lingers
        // unreaped even if the record below loses against a destroy.
        let status = self.reap(id, pid);

        // The meta record must land before the runtime pid file: that
        // way a pid in the runtime directory with no meta record can
        // only mean the meta directory was wiped, and the container is
        // safely an orphan.
        if checkpoint {
            if let Some(meta_dir) = &self.inner.config.meta_dir {
                tracing::info!(id = %id, pid, "checkpointing container's forked pid");
                paths::checkpoint_pid(meta_dir, id, pid).map_err(|e| Error::LaunchFailed {
                    id: id.to_string(),
                    reason: format!("could not checkpoint container's pid: {e}"),
                })?;
            } else {
                tracing::warn!(id = %id, "checkpoint requested but no meta directory configured");
            }
        }

        // Record the pid and its pending reap, and write the runtime
        // pid file, atomically against a concurrent destroy: a
        // teardown either observes both the pid and the reap handle,
        // or this launch observes `Destroying` and bows out (dropping
        // the pipe, which makes the child exit).
        let recorded = self
            .inner
            .registry
            .with(id, |c| {
                if c.state == LifecycleState::Destroying {
                    return Err(Error::LaunchFailed {
                        id: id.to_string(),
                        reason: "container is being destroyed during preparing".to_string(),
                    });
                }
                c.pid = Some(pid);
                paths::checkpoint_pid(&self.inner.config.runtime_dir, id, pid).map_err(|e| {
                    Error::LaunchFailed {
                        id: id.to_string(),
                        reason: format!("failed to checkpoint the container pid: {e}"),
                    }
                })?;
                c.status = Some(status.clone());
                Ok(())
            })?
            .unwrap_or_else(|| {
                Err(Error::LaunchFailed {
                    id: id.to_string(),
                    reason: "container destroyed during preparing".to_string(),
                })
            });
        recorded?;

        self.install_reap_callback(id.clone(), status);

        self.isolate(id, pid).await?;
        self.fetch(id).await?;
        self.exec_child(id, pipe_write).await?;

        drop(pipe_read);
        Ok(())
    }

    /// Installs limitation watches and runs `isolate` on all
    /// applicable isolators in parallel.
    async fn isolate(&self, id: &ContainerId, pid: u32) -> Result<()> {
        self.ensure_live(id, LifecycleState::Preparing)?;
        self.set_state(id, LifecycleState::Isolating)?;

        for (_, isolator) in self.applicable_isolators(id) {
            self.install_limitation_watch(id.clone(), isolator);
        }

        // Install the pending isolation result before any isolator
        // runs, for the same reason as provisioning and the prepare
        // chain.
        let promise: Promise<registry::StageResult<()>> = Promise::new();
        let installed = self
            .inner
            .registry
            .with(id, |c| {
                if c.state == LifecycleState::Destroying {
                    return false;
                }
                c.isolation = Some(promise.clone());
                true
            })?
            .unwrap_or(false);
        if !installed {
            return Err(Error::LaunchFailed {
                id: id.to_string(),
                reason: "container is being destroyed during isolating".to_string(),
            });
        }

        // Isolation has no declared dependencies, unlike prepare and
        // cleanup, so all isolators run concurrently.
        let applicable = self.applicable_isolators(id);
        let isolate_id = id.clone();
        let settle = promise.clone();
        tokio::spawn(async move {
            let futures = applicable.into_iter().map(|(_, isolator)| {
                let id = isolate_id.clone();
                async move {
                    isolator.isolate(&id, pid).await.map_err(|e| {
                        format!("isolator '{}' failed to isolate: {e}", isolator.name())
                    })
                }
            });
            settle.set(
                futures::future::try_join_all(futures)
                    .await
                    .map(|_| ()),
            );
        });

        promise.wait().await.map_err(|reason| Error::LaunchFailed {
            id: id.to_string(),
            reason,
        })
    }

    /// Fetches the command's URI assets into the sandbox.
    async fn fetch(&self, id: &ContainerId) -> Result<()> {
        self.ensure_live(id, LifecycleState::Isolating)?;
        self.set_state(id, LifecycleState::Fetching)?;

        let (command, directory, user) = self
            .inner
            .registry
            .with(id, |c| {
                (
                    c.config.command.clone(),
                    c.config.directory.clone(),
                    c.config.user.clone(),
                )
            })?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        self.inner
            .fetcher
            .fetch(
                id,
                &command,
                &directory,
                user.as_deref(),
                &self.inner.config.agent_id,
            )
            .await
            .map_err(|e| Error::LaunchFailed {
                id: id.to_string(),
                reason: format!("failed to fetch: {e}"),
            })?;

        if let Some(hook) = self.inner.post_fetch_hook.get() {
            hook(id, &directory);
        }
        Ok(())
    }

    /// Unblocks the helper's exec by writing a byte to the pipe.
    async fn exec_child(&self, id: &ContainerId, pipe_write: OwnedFd) -> Result<()> {
        self.ensure_live(id, LifecycleState::Fetching)?;

        let mut gate = fs::File::from(pipe_write);
        gate.write_all(&[0]).map_err(|e| Error::LaunchFailed {
            id: id.to_string(),
            reason: format!("failed to synchronize child process: {e}"),
        })?;

        self.set_state(id, LifecycleState::Running)?;
        Ok(())
    }

    // =========================================================================
    // Wait, Update, Usage, Status
    // =========================================================================

    /// Waits for a container to terminate.
    ///
    /// Unknown nested ids fall back to the termination record
    /// checkpointed in the runtime directory; any other unknown id
    /// resolves to `None`.
    ///
    /// # Errors
    ///
    /// Fails if the container's destroy failed.
    pub async fn wait(&self, id: &ContainerId) -> Result<Option<ContainerTermination>> {
        let termination = self.inner.registry.with(id, |c| c.termination.clone())?;

        match termination {
            Some(promise) => match promise.wait().await {
                Ok(termination) => Ok(Some(termination)),
                Err(reason) => Err(Error::DestroyFailed {
                    id: id.to_string(),
                    reason,
                }),
            },
            None => {
                if id.has_parent() {
                    if let Some(termination) =
                        paths::read_termination(&self.inner.config.runtime_dir, id)?
                    {
                        return Ok(Some(termination));
                    }
                }
                Ok(None)
            }
        }
    }

    /// Applies a new resource allocation to a root container and fans
    /// it out to every isolator in parallel.
    ///
    /// Unknown or destroying containers are a warning, not an error:
    /// the agent updates on terminal task state changes and the
    /// executor may already be gone.
    ///
    /// # Errors
    ///
    /// Fails for nested ids and when any isolator rejects the update.
    pub async fn update(&self, id: &ContainerId, resources: Resources) -> Result<()> {
        if id.has_parent() {
            return Err(Error::NotRootContainer(id.to_string()));
        }

        match self.inner.registry.with(id, |c| c.state)? {
            None => {
                tracing::warn!(id = %id, "ignoring update for unknown container");
                return Ok(());
            }
            Some(LifecycleState::Destroying) => {
                tracing::warn!(id = %id, "ignoring update for container being destroyed");
                return Ok(());
            }
            Some(_) => {}
        }

        // Stored before the isolators see it so a subsequent usage
        // reports the new limits.
        self.inner.registry.with(id, |c| c.resources = resources)?;

        let futures = self.inner.isolators.iter().map(|isolator| {
            let isolator = Arc::clone(isolator);
            let id = id.clone();
            async move { isolator.update(&id, &resources).await }
        });
        futures::future::try_join_all(futures).await?;
        Ok(())
    }

    /// Gathers resource usage from every isolator in parallel,
    /// tolerating individual failures, and overlays the stored
    /// allocation limits.
    ///
    /// # Errors
    ///
    /// Fails for nested or unknown ids.
    pub async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        if id.has_parent() {
            return Err(Error::NotRootContainer(id.to_string()));
        }

        let resources = self
            .inner
            .registry
            .with(id, |c| c.resources)?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let futures = self.inner.isolators.iter().map(|isolator| {
            let isolator = Arc::clone(isolator);
            let id = id.clone();
            async move {
                let name = isolator.name().to_string();
                (name, isolator.usage(&id).await)
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut statistics = ResourceStatistics {
            timestamp: Some(chrono::Utc::now().timestamp_millis() as f64 / 1000.0),
            ..ResourceStatistics::default()
        };

        for (name, result) in results {
            match result {
                Ok(usage) => statistics.merge_from(&usage),
                Err(e) => {
                    tracing::warn!(id = %id, isolator = %name, error = %e, "skipping resource statistic");
                }
            }
        }

        if let Some(mem) = resources.mem_bytes {
            statistics.mem_limit_bytes = Some(mem);
        }
        if let Some(cpus) = resources.cpus {
            statistics.cpus_limit = Some(cpus);
        }

        Ok(statistics)
    }

    /// Gathers status from the applicable isolators and the launcher,
    /// tolerating individual failures.
    ///
    /// Requests for the same container are serialized through a
    /// per-container queue so the agent observes results in request
    /// order.
    ///
    /// # Errors
    ///
    /// Fails for unknown ids.
    pub async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        let sequence = self
            .inner
            .registry
            .with(id, |c| Arc::clone(&c.sequence))?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;

        let _slot = sequence.lock().await;

        let isolator_futures = self.applicable_isolators(id).into_iter().map(|(_, isolator)| {
            let id = id.clone();
            async move {
                let name = isolator.name().to_string();
                (name, isolator.status(&id).await)
            }
        });
        let mut results = futures::future::join_all(isolator_futures).await;
        results.push(("launcher".to_string(), self.inner.launcher.status(id).await));

        let mut status = ContainerStatus::default();
        for (name, result) in results {
            match result {
                Ok(partial) => status.merge_from(&partial),
                Err(e) => {
                    tracing::warn!(id = %id, source = %name, error = %e, "skipping status");
                }
            }
        }
        Ok(status)
    }

    // =========================================================================
    // Callbacks
    // =========================================================================

    /// Starts monitoring `pid` and returns the pending reap result.
    ///
    /// When the runtime directory still exists at exit time, the
    /// status checkpointed by the helper is preferred over the OS wait
    /// status; if the helper never wrote it, the init must have been
    /// interrupted by SIGKILL and that is what gets synthesized.
    pub(crate) fn reap(&self, id: &ContainerId, pid: u32) -> Promise<Option<i32>> {
        let engine = self.clone();
        let id = id.clone();
        Promise::spawn(async move {
            let status = engine.inner.reaper.reap(pid).await;

            let runtime_dir = &engine.inner.config.runtime_dir;
            if !paths::runtime_path(runtime_dir, &id).exists() {
                return status;
            }

            match paths::read_status(runtime_dir, &id) {
                Ok(Some(checkpointed)) => Some(checkpointed),
                Ok(None) => Some(SIGKILL_WAIT_STATUS),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "failed to read checkpointed status");
                    Some(SIGKILL_WAIT_STATUS)
                }
            }
        })
    }

    /// Destroys the container once its reap result settles.
    pub(crate) fn install_reap_callback(&self, id: ContainerId, status: Promise<Option<i32>>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let _ = status.wait().await;
            engine.reaped(&id).await;
        });
    }

    async fn reaped(&self, id: &ContainerId) {
        match self.inner.registry.contains(id) {
            Ok(true) => {}
            _ => return,
        }

        tracing::info!(id = %id, "container has exited");
        if let Err(e) = self.destroy(id).await {
            tracing::warn!(id = %id, error = %e, "failed to destroy exited container");
        }
    }

    /// Routes an isolator's watch resolution into `limited`.
    pub(crate) fn install_limitation_watch(&self, id: ContainerId, isolator: Arc<dyn Isolator>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let limitation = isolator.watch(&id).await;
            engine.limited(&id, limitation).await;
        });
    }

    async fn limited(&self, id: &ContainerId, limitation: Result<ContainerLimitation>) {
        let state = match self.inner.registry.with(id, |c| c.state) {
            Ok(Some(state)) => state,
            _ => return,
        };
        if state == LifecycleState::Destroying {
            return;
        }

        match limitation {
            Ok(limitation) => {
                tracing::info!(
                    id = %id,
                    resource = ?limitation.resource,
                    "container has reached its limit and will be terminated"
                );
                let _ = self
                    .inner
                    .registry
                    .with(id, |c| c.limitations.push(limitation));
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "error in a resource limitation");
            }
        }

        if let Err(e) = self.destroy(id).await {
            tracing::warn!(id = %id, error = %e, "failed to destroy limited container");
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Returns `(pipeline index, isolator)` pairs applicable to the
    /// container: all of them for roots, only nesting-aware ones for
    /// nested containers.
    pub(crate) fn applicable_isolators(&self, id: &ContainerId) -> Vec<(usize, Arc<dyn Isolator>)> {
        self.inner
            .isolators
            .iter()
            .enumerate()
            .filter(|(_, isolator)| !id.has_parent() || isolator.supports_nesting())
            .map(|(index, isolator)| (index, Arc::clone(isolator)))
            .collect()
    }

    /// Fails unless the container is still registered and not being
    /// destroyed. `during` names the stage the caller just came out
    /// of, for the failure message.
    fn ensure_live(&self, id: &ContainerId, during: LifecycleState) -> Result<()> {
        match self.inner.registry.with(id, |c| c.state)? {
            None => Err(Error::LaunchFailed {
                id: id.to_string(),
                reason: format!("container destroyed during {during}"),
            }),
            Some(LifecycleState::Destroying) => Err(Error::LaunchFailed {
                id: id.to_string(),
                reason: format!("container is being destroyed during {during}"),
            }),
            Some(_) => Ok(()),
        }
    }

    fn set_state(&self, id: &ContainerId, state: LifecycleState) -> Result<()> {
        self.inner
            .registry
            .with(id, |c| c.state = state)?
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        Ok(())
    }
}

/// Creates the exec-gate pipe.
fn make_pipe() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: fds is a valid two-element buffer for pipe(2).
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: pipe(2) handed us ownership of both descriptors.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Chowns a nested sandbox to `user`, tolerating failure: the user may
/// not exist on this agent.
fn chown_best_effort(directory: &Path, user: &str) {
    let Ok(name) = CString::new(user) else {
        tracing::warn!(user, "cannot chown sandbox to user with interior NUL");
        return;
    };

    // SAFETY: name is NUL-terminated; the returned record is read
    // immediately, before any other passwd lookup on this thread.
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        tracing::warn!(
            user,
            directory = %directory.display(),
            "failed to chown sandbox directory: unknown user"
        );
        return;
    }

    // SAFETY: non-null passwd points at a valid record.
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };
    if let Err(e) = std::os::unix::fs::chown(directory, Some(uid), Some(gid)) {
        tracing::warn!(
            user,
            directory = %directory.display(),
            error = %e,
            "failed to chown sandbox directory"
        );
    }
}
