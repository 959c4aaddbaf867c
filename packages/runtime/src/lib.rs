// ABOUTME: Container runtime adapter wrapping build/run/stop/inspect against the engine
// ABOUTME: Streams build and run output line-by-line into the case log store

pub mod compose;
pub mod context;
pub mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use drydock_logs::CaseLogStore;
use drydock_ports::PortLease;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to connect to container engine: {0}")]
    Connection(String),

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Compose error: {0}")]
    Compose(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Parameters for one image build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Build context directory (the snapshot root or a caller-scoped subdir).
    pub context_dir: PathBuf,
    /// Absolute Dockerfile path; may live outside the context for generated
    /// recipes, in which case it is injected into the context archive.
    pub dockerfile: PathBuf,
    pub image_tag: String,
    pub network: Option<String>,
    pub no_cache: bool,
    pub build_args: HashMap<String, String>,
}

/// Parameters for starting one case container.
#[derive(Debug)]
pub struct RunRequest {
    pub image: String,
    pub name: String,
    /// Write-only environment values, consumed here and never stored.
    pub env: HashMap<String, String>,
    pub container_port: u16,
    /// Owned port lease; travels into the [`RunningContainer`] handle.
    pub lease: PortLease,
}

/// Handle for a started container. Owns the port lease so the port is
/// returned to the pool exactly once, wherever teardown happens.
#[derive(Debug)]
pub struct RunningContainer {
    pub container_id: String,
    pub host_port: u16,
    pub lease: PortLease,
}

/// Exit state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    Running,
    Exited { code: i64 },
}

/// The pluggable container runtime seam.
///
/// Build and run output is forwarded to the log store line-by-line as it is
/// produced; nothing is buffered to completion. The adapter reports exit
/// codes verbatim and never interprets their application-level meaning.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(
        &self,
        case_id: &str,
        request: &BuildRequest,
        logs: &CaseLogStore,
    ) -> Result<String>;

    async fn run_container(
        &self,
        case_id: &str,
        request: RunRequest,
        logs: Arc<CaseLogStore>,
    ) -> Result<RunningContainer>;

    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn inspect_exit(&self, container_id: &str) -> Result<ContainerExit>;

    async fn compose_up(
        &self,
        case_id: &str,
        compose_file: &Path,
        project: &str,
        env: &HashMap<String, String>,
        logs: Arc<CaseLogStore>,
    ) -> Result<()>;

    async fn compose_down(&self, compose_file: &Path, project: &str) -> Result<()>;
}
