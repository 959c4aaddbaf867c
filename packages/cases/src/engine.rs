// ABOUTME: Case orchestration engine driving the clone/build/run state machine
// ABOUTME: Worker pool, per-case locking, teardown guarantees and management actions

use crate::case::{Case, CaseDescriptor, CaseStage, CaseStatus, ErrorCode};
use crate::fetch::{RepoFetcher, RepoSnapshot};
use crate::storage::{CaseStorage, StorageError};
use drydock_logs::CaseLogStore;
use drydock_ports::PortPool;
use drydock_preflight::{
    decide, exposed_port, BuildStrategy, PreflightConfig, PreflightDecision, PreflightDirectives,
    PreflightError,
};
use drydock_runtime::{BuildRequest, ContainerExit, ContainerRuntime, RunRequest, RunningContainer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("Operation '{action}' is not valid while case is {status:?}")]
    InvalidState {
        action: &'static str,
        status: CaseStatus,
    },

    #[error("Case is archived: {0}")]
    Archived(String),

    #[error("Case pipeline is busy: {0}")]
    PipelineBusy(String),

    #[error("Invalid descriptor: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Policy for promoting STARTING to RUNNING.
///
/// With `probe_tcp` the engine attempts TCP connects to the bound host port
/// inside the grace window and promotes on first success; a container still
/// up when the window closes is promoted unless `require_probe` demands a
/// successful connect, in which case the case fails with READINESS_TIMEOUT.
#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub grace: Duration,
    pub probe_tcp: bool,
    pub require_probe: bool,
    pub poll_interval: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            probe_tcp: true,
            require_probe: false,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// External configuration consumed by the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Scratch root for per-case generated recipes.
    pub workdir: PathBuf,
    pub dockerfile_search_depth: usize,
    /// Service port assumed when a Dockerfile declares no EXPOSE.
    pub default_container_port: u16,
    /// Build network mode applied when a case supplies none.
    pub build_network: Option<String>,
    pub readiness: ReadinessPolicy,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    /// Host name used to render access URLs.
    pub access_host: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            workdir: std::env::temp_dir().join("drydock"),
            dockerfile_search_depth: 4,
            default_container_port: 8080,
            build_network: None,
            readiness: ReadinessPolicy::default(),
            monitor_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(10),
            access_host: "localhost".to_string(),
        }
    }
}

struct EngineInner {
    storage: Arc<CaseStorage>,
    runtime: Arc<dyn ContainerRuntime>,
    fetcher: Arc<dyn RepoFetcher>,
    ports: Arc<PortPool>,
    logs: Arc<CaseLogStore>,
    config: EngineConfig,

    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,

    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    running: RwLock<HashMap<String, RunningContainer>>,
    compose_projects: RwLock<HashMap<String, (PathBuf, String)>>,
    snapshots: RwLock<HashMap<String, RepoSnapshot>>,
    /// Write-only environment values, keyed by case id. Never persisted.
    env_values: RwLock<HashMap<String, HashMap<String, String>>>,
}

/// The case orchestration engine.
///
/// Owns every status transition. A bounded worker pool pulls queued case ids;
/// each case's pipeline runs under a per-case lock, and management actions
/// (`stop`, `restart`, `retry`, `archive`) acquire the same lock with
/// fail-fast semantics so they serialize against an in-flight pipeline
/// instead of racing its teardown.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CaseEngine {
    inner: Arc<EngineInner>,
}

impl CaseEngine {
    pub fn new(
        storage: Arc<CaseStorage>,
        runtime: Arc<dyn ContainerRuntime>,
        fetcher: Arc<dyn RepoFetcher>,
        ports: Arc<PortPool>,
        logs: Arc<CaseLogStore>,
        config: EngineConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                storage,
                runtime,
                fetcher,
                ports,
                logs,
                config,
                queue_tx,
                queue_rx: std::sync::Mutex::new(Some(queue_rx)),
                locks: RwLock::new(HashMap::new()),
                running: RwLock::new(HashMap::new()),
                compose_projects: RwLock::new(HashMap::new()),
                snapshots: RwLock::new(HashMap::new()),
                env_values: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn logs(&self) -> Arc<CaseLogStore> {
        Arc::clone(&self.inner.logs)
    }

    pub fn ports(&self) -> Arc<PortPool> {
        Arc::clone(&self.inner.ports)
    }

    /// Spawn the worker pool and re-enqueue any PENDING cases left in storage.
    pub fn start(&self) {
        let receiver = {
            let mut slot = self
                .inner
                .queue_rx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        let Some(receiver) = receiver else {
            warn!("Engine workers already started");
            return;
        };

        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..self.inner.config.workers.max(1) {
            let engine = self.clone();
            let receiver = Arc::clone(&receiver);
            tokio::spawn(async move {
                debug!("Worker {} started", worker);
                loop {
                    let next = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    match next {
                        Some(case_id) => engine.process(&case_id).await,
                        None => break,
                    }
                }
            });
        }

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.inner.storage.list_by_status(CaseStatus::Pending).await {
                Ok(pending) => {
                    for case in pending {
                        let _ = engine.inner.queue_tx.send(case.id);
                    }
                }
                Err(e) => error!("Failed to requeue pending cases: {}", e),
            }
        });
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Validate a descriptor, create the case in PENDING and enqueue it.
    /// Never blocks on the pipeline.
    pub async fn submit(&self, descriptor: CaseDescriptor) -> Result<Case> {
        let repo_url = descriptor.repo_url.trim();
        if repo_url.is_empty() {
            return Err(EngineError::Validation("repo_url is required".to_string()));
        }
        if repo_url.contains(char::is_whitespace) {
            return Err(EngineError::Validation(
                "repo_url must not contain whitespace".to_string(),
            ));
        }
        if !(repo_url.contains("://") || repo_url.starts_with("git@")) {
            return Err(EngineError::Validation(format!(
                "repo_url does not look like a git remote: {}",
                repo_url
            )));
        }

        let case = Case::new(&descriptor);
        self.inner.storage.create_case(&case).await?;

        if !descriptor.env.is_empty() {
            let mut env_values = self.inner.env_values.write().await;
            env_values.insert(case.id.clone(), descriptor.env.clone());
        }

        self.inner
            .logs
            .system_info(&case.id, format!("Case created for {}", case.repo_url))
            .await;
        let _ = self.inner.queue_tx.send(case.id.clone());

        info!("Submitted case {} for {}", case.id, case.repo_url);
        Ok(case)
    }

    /// Latest persisted snapshot of a case.
    pub async fn get(&self, case_id: &str) -> Result<Case> {
        self.inner.storage.get_case(case_id).await.map_err(not_found)
    }

    /// Preflight diagnostics recorded for the most recent build attempt.
    pub async fn preflight_diagnostics(&self, case_id: &str) -> Result<Option<serde_json::Value>> {
        self.inner
            .storage
            .get_preflight(case_id)
            .await
            .map_err(not_found)
    }

    /// Stop a RUNNING case: teardown, port release, FINISHED. A no-op for any
    /// other non-archived state.
    pub async fn stop(&self, case_id: &str) -> Result<Case> {
        let lock = self.case_lock(case_id).await;
        let _guard = lock
            .try_lock()
            .map_err(|_| EngineError::PipelineBusy(case_id.to_string()))?;

        let case = self.inner.storage.get_case(case_id).await.map_err(not_found)?;
        if case.status == CaseStatus::Archived {
            return Err(EngineError::Archived(case_id.to_string()));
        }

        if case.status == CaseStatus::Running {
            self.inner.logs.system_info(case_id, "Stop requested").await;
            self.teardown_runtime(case_id).await;
            self.inner
                .storage
                .update_status(case_id, CaseStatus::Finished, CaseStage::System)
                .await?;
            self.inner.logs.system_info(case_id, "Case stopped").await;
        }

        self.inner.storage.get_case(case_id).await.map_err(not_found)
    }

    /// Tear down any current runtime and re-enter BUILDING using the already
    /// resolved commit; the repository is not fetched again.
    pub async fn restart(&self, case_id: &str) -> Result<Case> {
        let lock = self.case_lock(case_id).await;
        let guard = lock
            .try_lock()
            .map_err(|_| EngineError::PipelineBusy(case_id.to_string()))?;

        let case = self.inner.storage.get_case(case_id).await.map_err(not_found)?;
        if case.status == CaseStatus::Archived {
            return Err(EngineError::Archived(case_id.to_string()));
        }
        if !case.status.can_transition(CaseStatus::Building) {
            return Err(EngineError::InvalidState {
                action: "restart",
                status: case.status,
            });
        }

        let snapshot = {
            let snapshots = self.inner.snapshots.read().await;
            snapshots.get(case_id).cloned()
        };
        let Some(snapshot) = snapshot else {
            return Err(EngineError::Validation(
                "no resolved snapshot to rebuild from; use retry".to_string(),
            ));
        };

        self.teardown_runtime(case_id).await;
        self.inner.storage.clear_error(case_id).await?;
        self.inner
            .storage
            .update_status(case_id, CaseStatus::Building, CaseStage::Build)
            .await?;
        self.inner
            .logs
            .system_info(
                case_id,
                format!("Restart requested; rebuilding commit {}", snapshot.commit_sha),
            )
            .await;
        drop(guard);

        let engine = self.clone();
        let rebuild_id = case_id.to_string();
        tokio::spawn(async move {
            let lock = engine.case_lock(&rebuild_id).await;
            let _guard = lock.lock().await;
            engine.build_phase(&rebuild_id).await;
        });

        self.inner.storage.get_case(case_id).await.map_err(not_found)
    }

    /// Re-enter PENDING from FAILED, optionally merging new environment
    /// values. Error fields clear atomically with the transition and the case
    /// keeps its id.
    pub async fn retry(
        &self,
        case_id: &str,
        env_override: Option<HashMap<String, String>>,
    ) -> Result<Case> {
        let lock = self.case_lock(case_id).await;
        let _guard = lock
            .try_lock()
            .map_err(|_| EngineError::PipelineBusy(case_id.to_string()))?;

        let case = self.inner.storage.get_case(case_id).await.map_err(not_found)?;
        if case.status == CaseStatus::Archived {
            return Err(EngineError::Archived(case_id.to_string()));
        }
        if case.status != CaseStatus::Failed {
            return Err(EngineError::InvalidState {
                action: "retry",
                status: case.status,
            });
        }

        self.teardown_runtime(case_id).await;

        if let Some(env) = env_override {
            let mut env_values = self.inner.env_values.write().await;
            let entry = env_values.entry(case_id.to_string()).or_default();
            entry.extend(env);
            let mut keys: Vec<String> = entry.keys().cloned().collect();
            keys.sort();
            self.inner.storage.set_env_keys(case_id, &keys).await?;
        }

        // A fresh clone may resolve a new commit; drop the stale snapshot.
        self.inner.snapshots.write().await.remove(case_id);

        self.inner.logs.clear(case_id).await;
        self.inner
            .logs
            .system_info(case_id, "Retry requested; case re-queued")
            .await;
        self.inner.storage.reset_for_retry(case_id).await?;
        let _ = self.inner.queue_tx.send(case_id.to_string());

        self.inner.storage.get_case(case_id).await.map_err(not_found)
    }

    /// Archive from any state, tearing down a live runtime first. Idempotent;
    /// every other mutation is rejected once archived.
    pub async fn archive(&self, case_id: &str) -> Result<Case> {
        let lock = self.case_lock(case_id).await;
        let _guard = lock
            .try_lock()
            .map_err(|_| EngineError::PipelineBusy(case_id.to_string()))?;

        let case = self.inner.storage.get_case(case_id).await.map_err(not_found)?;
        if case.status == CaseStatus::Archived {
            return Ok(case);
        }

        self.inner.logs.system_info(case_id, "Archive requested").await;
        self.teardown_runtime(case_id).await;
        self.inner
            .storage
            .update_status(case_id, CaseStatus::Archived, CaseStage::System)
            .await?;

        self.inner.snapshots.write().await.remove(case_id);
        self.inner.env_values.write().await.remove(case_id);

        self.inner.storage.get_case(case_id).await.map_err(not_found)
    }

    /// Reported by the external Explain collaborator; never touches lifecycle.
    pub async fn set_analyze_status(
        &self,
        case_id: &str,
        status: Option<&str>,
        ready: bool,
    ) -> Result<()> {
        self.inner
            .storage
            .set_analyze_status(case_id, status, ready)
            .await
            .map_err(not_found)
    }

    /// Reported by the external Visualize collaborator; never touches lifecycle.
    pub async fn set_visual_status(
        &self,
        case_id: &str,
        status: Option<&str>,
        ready: bool,
    ) -> Result<()> {
        self.inner
            .storage
            .set_visual_status(case_id, status, ready)
            .await
            .map_err(not_found)
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn process(&self, case_id: &str) {
        let lock = self.case_lock(case_id).await;
        let _guard = lock.lock().await;

        let case = match self.inner.storage.get_case(case_id).await {
            Ok(case) => case,
            Err(e) => {
                error!("Dequeued unknown case {}: {}", case_id, e);
                return;
            }
        };
        if case.status != CaseStatus::Pending {
            debug!(
                "Skipping dequeued case {} in state {}",
                case_id,
                case.status.as_str()
            );
            return;
        }

        self.run_pipeline(case).await;
    }

    async fn run_pipeline(&self, case: Case) {
        let case_id = case.id.clone();

        if self
            .transition(&case_id, CaseStatus::Cloning, CaseStage::Clone)
            .await
            .is_err()
        {
            return;
        }
        self.inner
            .logs
            .system_info(&case_id, format!("Cloning {}", case.repo_url))
            .await;

        let snapshot = match self
            .inner
            .fetcher
            .fetch(&case.repo_url, case.git_ref.as_deref())
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.fail(&case_id, CaseStage::Clone, e.code(), e.to_string())
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .inner
            .storage
            .set_commit(&case_id, &snapshot.commit_sha)
            .await
        {
            error!("Failed to record commit for case {}: {}", case_id, e);
            return;
        }
        self.inner
            .logs
            .system_info(
                &case_id,
                format!("Resolved {} to {}", case.repo_url, snapshot.commit_sha),
            )
            .await;
        self.inner
            .snapshots
            .write()
            .await
            .insert(case_id.clone(), snapshot);

        if self
            .transition(&case_id, CaseStatus::Building, CaseStage::Build)
            .await
            .is_err()
        {
            return;
        }
        self.build_phase(&case_id).await;
    }

    /// Preflight and strategy dispatch. Expects BUILDING with a resolved
    /// snapshot; shared by the pipeline and `restart`.
    async fn build_phase(&self, case_id: &str) {
        let case = match self.inner.storage.get_case(case_id).await {
            Ok(case) => case,
            Err(e) => {
                error!("Case {} vanished before build: {}", case_id, e);
                return;
            }
        };

        let snapshot = {
            let snapshots = self.inner.snapshots.read().await;
            snapshots.get(case_id).cloned()
        };
        let Some(snapshot) = snapshot else {
            self.fail(
                case_id,
                CaseStage::Build,
                ErrorCode::BuildFailed,
                "repository snapshot is no longer available".to_string(),
            )
            .await;
            return;
        };

        let directives = PreflightDirectives {
            run_mode: case.run_mode,
            dockerfile_path: case.dockerfile_path.as_ref().map(PathBuf::from),
            compose_file: case.compose_file.as_ref().map(PathBuf::from),
            context_path: case.context_path.as_ref().map(PathBuf::from),
        };
        let preflight_config = PreflightConfig {
            max_depth: self.inner.config.dockerfile_search_depth,
            scratch_dir: self.inner.config.workdir.join(case_id),
        };

        let decision = match decide(&snapshot.root, &directives, &preflight_config) {
            Ok(decision) => {
                self.record_preflight(case_id, &decision).await;
                decision
            }
            Err(e) => {
                if let Some(decision) = e.decision() {
                    self.record_preflight(case_id, decision).await;
                }
                let code = match &e {
                    PreflightError::Ambiguous { .. } => ErrorCode::DockerfileAmbiguous,
                    PreflightError::Io(_) => ErrorCode::BuildFailed,
                    _ => ErrorCode::DockerfileNotFound,
                };
                self.fail(case_id, CaseStage::Build, code, e.to_string()).await;
                return;
            }
        };

        self.inner
            .logs
            .system_info(
                case_id,
                format!(
                    "Preflight selected {} strategy ({})",
                    decision
                        .selected
                        .as_ref()
                        .map(|s| s.kind())
                        .unwrap_or("none"),
                    decision.reason.as_str()
                ),
            )
            .await;

        match decision.selected {
            Some(BuildStrategy::Showcase) => self.run_showcase(case_id).await,
            Some(BuildStrategy::Dockerfile { dockerfile, context })
            | Some(BuildStrategy::Generated {
                dockerfile, context, ..
            }) => {
                self.run_build_and_start(&case, dockerfile, context).await;
            }
            Some(BuildStrategy::Compose { compose_file }) => {
                self.run_compose(&case, compose_file).await;
            }
            None => {
                self.fail(
                    case_id,
                    CaseStage::Build,
                    ErrorCode::DockerfileNotFound,
                    "preflight produced no strategy".to_string(),
                )
                .await;
            }
        }
    }

    /// Showcase renders a documentation preview without executing the
    /// repository; the attempt completes with no container and no port.
    async fn run_showcase(&self, case_id: &str) {
        self.inner
            .logs
            .system_info(
                case_id,
                "Rendering showcase preview; the repository is not executed",
            )
            .await;
        if self
            .transition(case_id, CaseStatus::Finished, CaseStage::System)
            .await
            .is_ok()
        {
            self.inner.logs.system_info(case_id, "Showcase ready").await;
        }
    }

    async fn run_build_and_start(&self, case: &Case, dockerfile: PathBuf, context: PathBuf) {
        let case_id = case.id.clone();
        let image_tag = format!("drydock-case:{}", short_id(&case_id));

        let build_request = BuildRequest {
            context_dir: context,
            dockerfile: dockerfile.clone(),
            image_tag,
            network: case
                .build
                .network
                .clone()
                .or_else(|| self.inner.config.build_network.clone()),
            no_cache: case.build.no_cache,
            build_args: case.build.build_args.clone(),
        };

        let image = match self
            .inner
            .runtime
            .build_image(&case_id, &build_request, &self.inner.logs)
            .await
        {
            Ok(image) => image,
            Err(e) => {
                self.fail(&case_id, CaseStage::Build, ErrorCode::BuildFailed, e.to_string())
                    .await;
                return;
            }
        };

        if self
            .transition(&case_id, CaseStatus::Starting, CaseStage::Run)
            .await
            .is_err()
        {
            return;
        }

        let lease = match self.inner.ports.allocate() {
            Ok(lease) => lease,
            Err(e) => {
                self.fail(
                    &case_id,
                    CaseStage::Run,
                    ErrorCode::PortPoolExhausted,
                    e.to_string(),
                )
                .await;
                return;
            }
        };

        let container_port =
            exposed_port(&dockerfile).unwrap_or(self.inner.config.default_container_port);
        let env = {
            let env_values = self.inner.env_values.read().await;
            env_values.get(&case_id).cloned().unwrap_or_default()
        };

        let run_request = RunRequest {
            image,
            name: format!("drydock-{}", short_id(&case_id)),
            env,
            container_port,
            lease,
        };

        // On failure the request (and its lease) is consumed by the runtime,
        // so the port still returns to the pool.
        let handle = match self
            .inner
            .runtime
            .run_container(&case_id, run_request, self.logs())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(
                    &case_id,
                    CaseStage::Run,
                    ErrorCode::ContainerStartFailed,
                    e.to_string(),
                )
                .await;
                return;
            }
        };

        if let Err((code, message)) = self.await_ready(&case_id, &handle).await {
            self.teardown_container(&case_id, handle).await;
            self.inner.logs.system_error(&case_id, &message).await;
            if let Err(e) = self
                .inner
                .storage
                .fail_case(&case_id, CaseStage::Run, code, &message)
                .await
            {
                error!("Failed to record start failure for {}: {}", case_id, e);
            }
            return;
        }

        let access_url = format!(
            "http://{}:{}",
            self.inner.config.access_host, handle.host_port
        );
        let container_id = handle.container_id.clone();
        if let Err(e) = self
            .inner
            .storage
            .set_runtime(
                &case_id,
                Some(&access_url),
                Some(handle.host_port),
                &container_id,
            )
            .await
        {
            error!("Failed to record runtime for {}: {}", case_id, e);
            self.teardown_container(&case_id, handle).await;
            return;
        }
        self.inner.running.write().await.insert(case_id.clone(), handle);

        if self
            .transition(&case_id, CaseStatus::Running, CaseStage::Run)
            .await
            .is_err()
        {
            self.teardown_runtime(&case_id).await;
            return;
        }

        self.inner
            .logs
            .system_info(&case_id, format!("Case is running at {}", access_url))
            .await;
        self.spawn_monitor(case_id, container_id);
    }

    async fn run_compose(&self, case: &Case, compose_file: PathBuf) {
        let case_id = case.id.clone();
        let project = format!("drydock-{}", short_id(&case_id));
        let env = {
            let env_values = self.inner.env_values.read().await;
            env_values.get(&case_id).cloned().unwrap_or_default()
        };

        if let Err(e) = self
            .inner
            .runtime
            .compose_up(&case_id, &compose_file, &project, &env, self.logs())
            .await
        {
            self.fail(&case_id, CaseStage::Build, ErrorCode::BuildFailed, e.to_string())
                .await;
            return;
        }

        if self
            .transition(&case_id, CaseStatus::Starting, CaseStage::Run)
            .await
            .is_err()
        {
            return;
        }

        self.inner
            .compose_projects
            .write()
            .await
            .insert(case_id.clone(), (compose_file, project.clone()));
        // Published ports come from the compose file itself, so the runtime
        // snapshot carries the project handle only.
        if let Err(e) = self
            .inner
            .storage
            .set_runtime(&case_id, None, None, &project)
            .await
        {
            error!("Failed to record compose runtime for {}: {}", case_id, e);
        }

        if self
            .transition(&case_id, CaseStatus::Running, CaseStage::Run)
            .await
            .is_ok()
        {
            self.inner
                .logs
                .system_info(&case_id, format!("Compose project {} is up", project))
                .await;
        }
    }

    /// Wait for the container to become ready per the configured policy.
    async fn await_ready(
        &self,
        case_id: &str,
        handle: &RunningContainer,
    ) -> std::result::Result<(), (ErrorCode, String)> {
        let policy = &self.inner.config.readiness;
        let deadline = tokio::time::Instant::now() + policy.grace;

        loop {
            match self.inner.runtime.inspect_exit(&handle.container_id).await {
                Ok(ContainerExit::Exited { code }) => {
                    return Err((
                        ErrorCode::ContainerStartFailed,
                        format!("container exited with code {} during startup", code),
                    ));
                }
                Ok(ContainerExit::Running) => {}
                Err(e) => {
                    warn!("Readiness inspect for {} failed: {}", case_id, e);
                }
            }

            if policy.probe_tcp
                && tokio::net::TcpStream::connect(("127.0.0.1", handle.host_port))
                    .await
                    .is_ok()
            {
                self.inner
                    .logs
                    .system_info(case_id, "Readiness probe succeeded")
                    .await;
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                if policy.probe_tcp && policy.require_probe {
                    return Err((
                        ErrorCode::ReadinessTimeout,
                        format!(
                            "no readiness signal on port {} within {:?}",
                            handle.host_port, policy.grace
                        ),
                    ));
                }
                // Grace elapsed with the container still up: promote.
                return Ok(());
            }

            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Watch a running container and settle the case when it exits:
    /// code 0 becomes FINISHED, anything else CONTAINER_EXIT_NONZERO.
    fn spawn_monitor(&self, case_id: String, container_id: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(engine.inner.config.monitor_interval).await;

                // Bail out if the runtime was torn down or replaced under us.
                {
                    let running = engine.inner.running.read().await;
                    match running.get(&case_id) {
                        Some(handle) if handle.container_id == container_id => {}
                        _ => break,
                    }
                }

                let exit = match engine.inner.runtime.inspect_exit(&container_id).await {
                    Ok(ContainerExit::Running) => continue,
                    Ok(ContainerExit::Exited { code }) => code,
                    Err(e) => {
                        warn!("Monitor inspect for {} failed: {}", case_id, e);
                        continue;
                    }
                };

                let lock = engine.case_lock(&case_id).await;
                let _guard = lock.lock().await;

                let handle = {
                    let mut running = engine.inner.running.write().await;
                    match running.get(&case_id) {
                        Some(current) if current.container_id == container_id => {
                            running.remove(&case_id)
                        }
                        _ => None,
                    }
                };
                let Some(handle) = handle else {
                    // stop/archive/restart won the race and already tore down.
                    break;
                };

                if let Err(e) = engine.inner.runtime.remove_container(&container_id).await {
                    warn!("Failed to remove exited container {}: {}", container_id, e);
                }
                handle.lease.release();
                if let Err(e) = engine.inner.storage.clear_runtime(&case_id).await {
                    warn!("Failed to clear runtime for {}: {}", case_id, e);
                }

                let status = engine
                    .inner
                    .storage
                    .get_case(&case_id)
                    .await
                    .map(|c| c.status)
                    .unwrap_or(CaseStatus::Archived);
                if status == CaseStatus::Running {
                    if exit == 0 {
                        engine
                            .inner
                            .logs
                            .system_info(&case_id, "Container exited cleanly")
                            .await;
                        let _ = engine
                            .inner
                            .storage
                            .update_status(&case_id, CaseStatus::Finished, CaseStage::System)
                            .await;
                    } else {
                        let message = format!("container exited with code {}", exit);
                        engine.inner.logs.system_error(&case_id, &message).await;
                        let _ = engine
                            .inner
                            .storage
                            .fail_case(
                                &case_id,
                                CaseStage::Run,
                                ErrorCode::ContainerExitNonzero,
                                &message,
                            )
                            .await;
                    }
                }
                break;
            }
        });
    }

    // ------------------------------------------------------------------
    // Failure and teardown
    // ------------------------------------------------------------------

    /// Commit a failure: teardown first, then stage attribution, error fields
    /// and the FAILED status in one storage write.
    async fn fail(&self, case_id: &str, stage: CaseStage, code: ErrorCode, message: String) {
        self.teardown_runtime(case_id).await;
        self.inner
            .logs
            .system_error(case_id, format!("{}: {}", code.as_str(), message))
            .await;
        if let Err(e) = self
            .inner
            .storage
            .fail_case(case_id, stage, code, &message)
            .await
        {
            error!("Failed to record failure for case {}: {}", case_id, e);
        }
    }

    /// Release every live resource a case holds: container, compose project,
    /// port lease, persisted runtime snapshot.
    async fn teardown_runtime(&self, case_id: &str) {
        let handle = {
            let mut running = self.inner.running.write().await;
            running.remove(case_id)
        };
        if let Some(handle) = handle {
            self.teardown_container(case_id, handle).await;
        }

        let compose = {
            let mut projects = self.inner.compose_projects.write().await;
            projects.remove(case_id)
        };
        if let Some((compose_file, project)) = compose {
            if let Err(e) = self.inner.runtime.compose_down(&compose_file, &project).await {
                warn!("Compose teardown for {} failed: {}", case_id, e);
            }
            if let Err(e) = self.inner.storage.clear_runtime(case_id).await {
                warn!("Failed to clear runtime for {}: {}", case_id, e);
            }
        }
    }

    async fn teardown_container(&self, case_id: &str, handle: RunningContainer) {
        if let Err(e) = self
            .inner
            .runtime
            .stop_container(&handle.container_id, self.inner.config.stop_grace)
            .await
        {
            warn!("Failed to stop container for {}: {}", case_id, e);
        }
        if let Err(e) = self.inner.runtime.remove_container(&handle.container_id).await {
            warn!("Failed to remove container for {}: {}", case_id, e);
        }
        handle.lease.release();
        if let Err(e) = self.inner.storage.clear_runtime(case_id).await {
            warn!("Failed to clear runtime for {}: {}", case_id, e);
        }
    }

    async fn transition(&self, case_id: &str, to: CaseStatus, stage: CaseStage) -> Result<()> {
        let case = self.inner.storage.get_case(case_id).await.map_err(not_found)?;
        if !case.status.can_transition(to) {
            warn!(
                "Refusing transition {} -> {} for case {}",
                case.status.as_str(),
                to.as_str(),
                case_id
            );
            return Err(EngineError::InvalidState {
                action: "transition",
                status: case.status,
            });
        }
        self.inner.storage.update_status(case_id, to, stage).await?;
        Ok(())
    }

    async fn record_preflight(&self, case_id: &str, decision: &PreflightDecision) {
        match serde_json::to_value(decision) {
            Ok(json) => {
                if let Err(e) = self.inner.storage.set_preflight(case_id, &json).await {
                    warn!("Failed to persist preflight record for {}: {}", case_id, e);
                }
            }
            Err(e) => warn!("Failed to serialize preflight record: {}", e),
        }
    }

    async fn case_lock(&self, case_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.locks.write().await;
        Arc::clone(
            locks
                .entry(case_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

fn short_id(case_id: &str) -> String {
    case_id.chars().take(8).collect()
}

fn not_found(e: StorageError) -> EngineError {
    match e {
        StorageError::NotFound(id) => EngineError::NotFound(id),
        other => EngineError::Storage(other),
    }
}
