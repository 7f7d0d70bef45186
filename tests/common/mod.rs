//! Shared test fixtures: an event log and scripted collaborator mocks.
//!
//! Every mock records its calls into one [`EventLog`] so tests can
//! assert cross-collaborator ordering (serial prepare, parallel
//! isolate, reverse cleanup, children before parents, ...).

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use warden::constants::STATUS_FILE;
use warden::{
    CommandSpec, ContainerConfig, ContainerId, ContainerLimitation, ContainerLogger,
    ContainerStatus, Engine, EngineConfig, EnvironmentMap, Error, Fetcher, Image, IoRedirect,
    Isolator, LaunchFlags, LaunchInfo, Launcher, NetworkInfo, ProvisionInfo, Provisioner, Reaper,
    RecoveredContainer, ResourceStatistics, Result, SubprocessInfo,
};

// =============================================================================
// Event Log
// =============================================================================

/// Shared, ordered record of collaborator calls.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    /// Index of the first occurrence; panics (with the full log) if
    /// the event never happened.
    pub fn index_of(&self, event: &str) -> usize {
        let events = self.0.lock().unwrap();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event '{event}' not found in log: {events:?}"))
    }

    /// Asserts the given events all occurred, in the given order.
    pub fn assert_order(&self, expected: &[&str]) {
        let mut last = None;
        for event in expected {
            let index = self.index_of(event);
            if let Some((previous_index, previous)) = last {
                assert!(
                    index > previous_index,
                    "expected '{event}' after '{previous}', log: {:?}",
                    self.events()
                );
            }
            last = Some((index, *event));
        }
    }

    /// Waits (bounded) until the event shows up.
    pub async fn wait_for(&self, event: &str) {
        for _ in 0..500 {
            if self.contains(event) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for event '{event}', log: {:?}", self.events());
    }
}

// =============================================================================
// Mock Reaper
// =============================================================================

/// Reaper whose exits are triggered by the test.
#[derive(Default)]
pub struct MockReaper {
    waiting: Mutex<HashMap<u32, oneshot::Sender<Option<i32>>>>,
    already: Mutex<HashMap<u32, Option<i32>>>,
}

impl MockReaper {
    /// Marks `pid` as exited with the given wait status. Safe to call
    /// before or after the engine started reaping the pid.
    pub fn exit(&self, pid: u32, status: Option<i32>) {
        let sender = self.waiting.lock().unwrap().remove(&pid);
        match sender {
            Some(tx) => {
                let _ = tx.send(status);
            }
            None => {
                self.already.lock().unwrap().insert(pid, status);
            }
        }
    }
}

#[async_trait]
impl Reaper for MockReaper {
    async fn reap(&self, pid: u32) -> Option<i32> {
        let rx = {
            if let Some(status) = self.already.lock().unwrap().remove(&pid) {
                return status;
            }
            let (tx, rx) = oneshot::channel();
            self.waiting.lock().unwrap().insert(pid, tx);
            rx
        };
        rx.await.unwrap_or(None)
    }
}

// =============================================================================
// Mock Isolator
// =============================================================================

pub struct MockIsolator {
    name: String,
    nesting: bool,
    log: EventLog,
    pub fail_prepare: AtomicBool,
    pub fail_isolate: AtomicBool,
    pub fail_cleanup: AtomicBool,
    pub fail_usage: AtomicBool,
    launch_info: Mutex<Option<LaunchInfo>>,
    usage: Mutex<ResourceStatistics>,
    status: Mutex<ContainerStatus>,
    limitation: Mutex<Option<oneshot::Receiver<ContainerLimitation>>>,
}

impl MockIsolator {
    fn build(name: &str, log: &EventLog, nesting: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            nesting,
            log: log.clone(),
            fail_prepare: AtomicBool::new(false),
            fail_isolate: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            fail_usage: AtomicBool::new(false),
            launch_info: Mutex::new(None),
            usage: Mutex::new(ResourceStatistics::default()),
            status: Mutex::new(ContainerStatus::default()),
            limitation: Mutex::new(None),
        })
    }

    pub fn new(name: &str, log: &EventLog) -> Arc<Self> {
        Self::build(name, log, true)
    }

    pub fn non_nesting(name: &str, log: &EventLog) -> Arc<Self> {
        Self::build(name, log, false)
    }

    pub fn set_launch_info(&self, info: LaunchInfo) {
        *self.launch_info.lock().unwrap() = Some(info);
    }

    pub fn set_usage(&self, usage: ResourceStatistics) {
        *self.usage.lock().unwrap() = usage;
    }

    pub fn set_status(&self, status: ContainerStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// Arms the next `watch` call; sending on the returned channel
    /// reports a limitation.
    pub fn arm_limitation(&self) -> oneshot::Sender<ContainerLimitation> {
        let (tx, rx) = oneshot::channel();
        *self.limitation.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl Isolator for MockIsolator {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_nesting(&self) -> bool {
        self.nesting
    }

    async fn recover(
        &self,
        containers: &[RecoveredContainer],
        orphans: &HashSet<ContainerId>,
    ) -> Result<()> {
        self.log.record(format!(
            "{}.recover {}+{}",
            self.name,
            containers.len(),
            orphans.len()
        ));
        Ok(())
    }

    async fn prepare(
        &self,
        id: &ContainerId,
        _config: &ContainerConfig,
    ) -> Result<Option<LaunchInfo>> {
        self.log.record(format!("{}.prepare {id}", self.name));
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} prepare failed", self.name)));
        }
        Ok(self.launch_info.lock().unwrap().clone())
    }

    async fn isolate(&self, id: &ContainerId, _pid: u32) -> Result<()> {
        self.log.record(format!("{}.isolate {id}", self.name));
        if self.fail_isolate.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} isolate failed", self.name)));
        }
        Ok(())
    }

    async fn watch(&self, _id: &ContainerId) -> Result<ContainerLimitation> {
        let rx = self.limitation.lock().unwrap().take();
        match rx {
            Some(rx) => match rx.await {
                Ok(limitation) => Ok(limitation),
                Err(_) => std::future::pending().await,
            },
            None => std::future::pending().await,
        }
    }

    async fn update(&self, id: &ContainerId, _resources: &warden::Resources) -> Result<()> {
        self.log.record(format!("{}.update {id}", self.name));
        Ok(())
    }

    async fn usage(&self, id: &ContainerId) -> Result<ResourceStatistics> {
        self.log.record(format!("{}.usage {id}", self.name));
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} usage failed", self.name)));
        }
        Ok(self.usage.lock().unwrap().clone())
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        self.log.record(format!("{}.status {id}", self.name));
        Ok(self.status.lock().unwrap().clone())
    }

    async fn cleanup(&self, id: &ContainerId) -> Result<()> {
        self.log.record(format!("{}.cleanup {id}", self.name));
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("{} cleanup failed", self.name)));
        }
        Ok(())
    }
}

// =============================================================================
// Mock Launcher
// =============================================================================

pub struct MockLauncher {
    log: EventLog,
    reaper: Arc<MockReaper>,
    next_pid: AtomicU32,
    pub fail_fork: AtomicBool,
    pub fail_destroy: AtomicBool,
    pub exit_status: AtomicI32,
    pids: Mutex<HashMap<ContainerId, (u32, PathBuf)>>,
    pub forked_envs: Mutex<HashMap<ContainerId, EnvironmentMap>>,
    pub forked_flags: Mutex<HashMap<ContainerId, LaunchFlags>>,
    recover_orphans: Mutex<HashSet<ContainerId>>,
}

impl MockLauncher {
    pub fn new(log: &EventLog, reaper: &Arc<MockReaper>) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            reaper: Arc::clone(reaper),
            next_pid: AtomicU32::new(1000),
            fail_fork: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
            pids: Mutex::new(HashMap::new()),
            forked_envs: Mutex::new(HashMap::new()),
            forked_flags: Mutex::new(HashMap::new()),
            recover_orphans: Mutex::new(HashSet::new()),
        })
    }

    pub fn pid_of(&self, id: &ContainerId) -> Option<u32> {
        self.pids.lock().unwrap().get(id).map(|(pid, _)| *pid)
    }

    pub fn set_recover_orphans(&self, orphans: HashSet<ContainerId>) {
        *self.recover_orphans.lock().unwrap() = orphans;
    }

    /// Simulates the container init exiting on its own: the helper
    /// checkpoints the wait status, then the process is reaped.
    pub fn exit_container(&self, id: &ContainerId, status: i32) {
        let entry = self.pids.lock().unwrap().get(id).cloned();
        if let Some((pid, runtime_directory)) = entry {
            let _ = std::fs::write(runtime_directory.join(STATUS_FILE), status.to_string());
            self.reaper.exit(pid, Some(status));
        }
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn recover(
        &self,
        containers: &[RecoveredContainer],
    ) -> Result<HashSet<ContainerId>> {
        self.log.record(format!("launcher.recover {}", containers.len()));
        Ok(self.recover_orphans.lock().unwrap().clone())
    }

    async fn fork(
        &self,
        id: &ContainerId,
        _helper_path: &Path,
        _argv: &[String],
        _stdin: IoRedirect,
        _stdout: IoRedirect,
        _stderr: IoRedirect,
        flags: &LaunchFlags,
        environment: &EnvironmentMap,
        _namespaces: u32,
    ) -> Result<u32> {
        self.log.record(format!("launcher.fork {id}"));
        if self.fail_fork.load(Ordering::SeqCst) {
            return Err(Error::Internal("fork failed".to_string()));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.pids
            .lock()
            .unwrap()
            .insert(id.clone(), (pid, flags.runtime_directory.clone()));
        self.forked_envs
            .lock()
            .unwrap()
            .insert(id.clone(), environment.clone());
        self.forked_flags
            .lock()
            .unwrap()
            .insert(id.clone(), flags.clone());

        // Stand in for the helper child blocked on the exec-gate
        // pipe: log the exec signal (one byte) or the pipe closing.
        // SAFETY: pipe_read is open for the duration of fork; the dup
        // outlives it independently.
        let gate = unsafe { libc::dup(flags.pipe_read) };
        if gate >= 0 {
            let log = self.log.clone();
            let gate_id = id.clone();
            tokio::task::spawn_blocking(move || {
                let mut byte = [0u8; 1];
                // SAFETY: gate is a valid fd owned by this task.
                let read = unsafe { libc::read(gate, byte.as_mut_ptr().cast(), 1) };
                match read {
                    1 => log.record(format!("exec {gate_id}")),
                    _ => log.record(format!("pipe-closed {gate_id}")),
                }
                // SAFETY: gate was dup'd above and is closed once.
                unsafe { libc::close(gate) };
            });
        }

        Ok(pid)
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        self.log.record(format!("launcher.destroy {id}"));
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Internal("launcher destroy failed".to_string()));
        }

        let status = self.exit_status.load(Ordering::SeqCst);
        self.exit_container(id, status);
        Ok(())
    }

    async fn status(&self, id: &ContainerId) -> Result<ContainerStatus> {
        self.log.record(format!("launcher.status {id}"));
        Ok(ContainerStatus {
            executor_pid: self.pid_of(id),
            network_infos: Vec::new(),
        })
    }
}

// =============================================================================
// Mock Provisioner
// =============================================================================

pub struct MockProvisioner {
    log: EventLog,
    pub fail_provision: AtomicBool,
    pub fail_destroy: AtomicBool,
    rootfs: PathBuf,
    manifests: Mutex<(Option<serde_json::Value>, Option<serde_json::Value>)>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockProvisioner {
    pub fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            fail_provision: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            rootfs: PathBuf::from("/var/lib/warden/provisioned/rootfs"),
            manifests: Mutex::new((None, None)),
            gate: Mutex::new(None),
        })
    }

    /// Makes the next `provision` block until the returned sender
    /// fires (or is dropped).
    pub fn arm_gate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_manifests(
        &self,
        docker: Option<serde_json::Value>,
        appc: Option<serde_json::Value>,
    ) {
        *self.manifests.lock().unwrap() = (docker, appc);
    }
}

#[async_trait]
impl Provisioner for MockProvisioner {
    async fn recover(&self, known_ids: &HashSet<ContainerId>) -> Result<()> {
        self.log.record(format!("provisioner.recover {}", known_ids.len()));
        Ok(())
    }

    async fn provision(&self, id: &ContainerId, _image: &Image) -> Result<ProvisionInfo> {
        self.log.record(format!("provisioner.provision {id}"));

        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(Error::Internal("provision failed".to_string()));
        }

        let (docker, appc) = self.manifests.lock().unwrap().clone();
        Ok(ProvisionInfo {
            rootfs: self.rootfs.clone(),
            docker_manifest: docker,
            appc_manifest: appc,
        })
    }

    async fn destroy(&self, id: &ContainerId) -> Result<bool> {
        self.log.record(format!("provisioner.destroy {id}"));
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(Error::Internal("provisioner destroy failed".to_string()));
        }
        Ok(true)
    }
}

// =============================================================================
// Mock Fetcher & Logger
// =============================================================================

pub struct MockFetcher {
    log: EventLog,
    pub fail_fetch: AtomicBool,
}

impl MockFetcher {
    pub fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            fail_fetch: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(
        &self,
        id: &ContainerId,
        _command: &CommandSpec,
        _directory: &Path,
        _user: Option<&str>,
        _agent_id: &str,
    ) -> Result<()> {
        self.log.record(format!("fetcher.fetch {id}"));
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::Internal("fetch failed".to_string()));
        }
        Ok(())
    }

    async fn kill(&self, id: &ContainerId) {
        self.log.record(format!("fetcher.kill {id}"));
    }
}

pub struct MockLogger {
    log: EventLog,
}

impl MockLogger {
    pub fn new(log: &EventLog) -> Arc<Self> {
        Arc::new(Self { log: log.clone() })
    }
}

#[async_trait]
impl ContainerLogger for MockLogger {
    async fn recover(
        &self,
        _executor_info: Option<&warden::ExecutorInfo>,
        _directory: &Path,
    ) -> Result<()> {
        self.log.record("logger.recover");
        Ok(())
    }

    async fn prepare(
        &self,
        _executor_info: Option<&warden::ExecutorInfo>,
        _directory: &Path,
    ) -> Result<SubprocessInfo> {
        self.log.record("logger.prepare");
        Ok(SubprocessInfo::default())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// An engine wired to scripted mocks over temp directories.
pub struct Harness {
    pub engine: Engine,
    pub log: EventLog,
    pub launcher: Arc<MockLauncher>,
    pub provisioner: Arc<MockProvisioner>,
    pub fetcher: Arc<MockFetcher>,
    pub reaper: Arc<MockReaper>,
    pub runtime: tempfile::TempDir,
    pub sandboxes: tempfile::TempDir,
}

impl Harness {
    pub fn new(log: EventLog, isolators: Vec<Arc<dyn Isolator>>) -> Self {
        let runtime = tempfile::tempdir().expect("runtime tempdir");
        let sandboxes = tempfile::tempdir().expect("sandbox tempdir");

        let reaper = Arc::new(MockReaper::default());
        let launcher = MockLauncher::new(&log, &reaper);
        let provisioner = MockProvisioner::new(&log);
        let fetcher = MockFetcher::new(&log);
        let logger = MockLogger::new(&log);

        let config = EngineConfig {
            runtime_dir: runtime.path().to_path_buf(),
            meta_dir: Some(runtime.path().join("meta")),
            helper_dir: PathBuf::from("/usr/libexec/warden"),
            sandbox_mount_point: PathBuf::from("/mnt/warden/sandbox"),
            agent_id: "agent-1".to_string(),
        };

        let engine = Engine::new(
            config,
            launcher.clone(),
            provisioner.clone(),
            fetcher.clone(),
            logger,
            reaper.clone(),
            isolators,
        );

        Self {
            engine,
            log,
            launcher,
            provisioner,
            fetcher,
            reaper,
            runtime,
            sandboxes,
        }
    }

    /// Builds a root container id and config with a real sandbox dir.
    pub fn container(&self, name: &str) -> (ContainerId, ContainerConfig) {
        let id = ContainerId::root(name);
        let sandbox = self.sandboxes.path().join(name);
        std::fs::create_dir_all(&sandbox).expect("sandbox dir");
        let config = ContainerConfig::new(CommandSpec::shell("sleep 1000"), sandbox);
        (id, config)
    }

    /// Container config requesting a docker image.
    pub fn container_with_image(&self, name: &str) -> (ContainerId, ContainerConfig) {
        let (id, mut config) = self.container(name);
        config.container_info = Some(warden::ContainerInfo::with_image(Image {
            kind: warden::ImageKind::Docker,
            reference: "alpine:3.20".to_string(),
        }));
        (id, config)
    }
}

/// Status contribution used by status-merge tests.
pub fn network_status(name: &str, address: &str) -> ContainerStatus {
    ContainerStatus {
        executor_pid: None,
        network_infos: vec![NetworkInfo {
            name: Some(name.to_string()),
            ip_addresses: vec![address.to_string()],
        }],
    }
}
