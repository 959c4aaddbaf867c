use chrono::{DateTime, Utc};
use drydock_preflight::RunMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Pending,
    Cloning,
    Building,
    Starting,
    Running,
    Failed,
    Finished,
    Archived,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Finished => "finished",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "cloning" => Some(Self::Cloning),
            "building" => Some(Self::Building),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "failed" => Some(Self::Failed),
            "finished" => Some(Self::Finished),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether the state machine admits moving from `self` to `to`.
    ///
    /// Covers the pipeline path (pending → cloning → building → starting →
    /// running), failure edges from every pipeline state, retry
    /// (failed → pending), restart (running/finished/failed → building),
    /// showcase completion (building → finished) and archive from any
    /// non-archived state. Archived admits nothing.
    pub fn can_transition(self, to: CaseStatus) -> bool {
        use CaseStatus::*;
        match (self, to) {
            (Archived, _) => false,
            (_, Archived) => true,
            (Pending, Cloning) => true,
            (Cloning, Building) | (Cloning, Failed) => true,
            (Building, Starting) | (Building, Failed) | (Building, Finished) => true,
            (Starting, Running) | (Starting, Failed) => true,
            (Running, Finished) | (Running, Failed) => true,
            (Failed, Pending) => true,
            (Running, Building) | (Finished, Building) | (Failed, Building) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Archived)
    }
}

/// Pipeline phase a case is currently attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStage {
    Clone,
    Build,
    Run,
    Analyze,
    System,
}

impl CaseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Build => "build",
            Self::Run => "run",
            Self::Analyze => "analyze",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clone" => Some(Self::Clone),
            "build" => Some(Self::Build),
            "run" => Some(Self::Run),
            "analyze" => Some(Self::Analyze),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Typed failure taxonomy recorded on a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    GitCloneFailed,
    GithubRateLimit,
    LfsFailed,
    SubmoduleFailed,
    DockerfileNotFound,
    DockerfileAmbiguous,
    BuildFailed,
    ContainerStartFailed,
    ContainerExitNonzero,
    ReadinessTimeout,
    PortPoolExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitCloneFailed => "GIT_CLONE_FAILED",
            Self::GithubRateLimit => "GITHUB_RATE_LIMIT",
            Self::LfsFailed => "LFS_FAILED",
            Self::SubmoduleFailed => "SUBMODULE_FAILED",
            Self::DockerfileNotFound => "DOCKERFILE_NOT_FOUND",
            Self::DockerfileAmbiguous => "DOCKERFILE_AMBIGUOUS",
            Self::BuildFailed => "BUILD_FAILED",
            Self::ContainerStartFailed => "CONTAINER_START_FAILED",
            Self::ContainerExitNonzero => "CONTAINER_EXIT_NONZERO",
            Self::ReadinessTimeout => "READINESS_TIMEOUT",
            Self::PortPoolExhausted => "PORT_POOL_EXHAUSTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GIT_CLONE_FAILED" => Some(Self::GitCloneFailed),
            "GITHUB_RATE_LIMIT" => Some(Self::GithubRateLimit),
            "LFS_FAILED" => Some(Self::LfsFailed),
            "SUBMODULE_FAILED" => Some(Self::SubmoduleFailed),
            "DOCKERFILE_NOT_FOUND" => Some(Self::DockerfileNotFound),
            "DOCKERFILE_AMBIGUOUS" => Some(Self::DockerfileAmbiguous),
            "BUILD_FAILED" => Some(Self::BuildFailed),
            "CONTAINER_START_FAILED" => Some(Self::ContainerStartFailed),
            "CONTAINER_EXIT_NONZERO" => Some(Self::ContainerExitNonzero),
            "READINESS_TIMEOUT" => Some(Self::ReadinessTimeout),
            "PORT_POOL_EXHAUSTED" => Some(Self::PortPoolExhausted),
            _ => None,
        }
    }

    /// Transient failures the caller may retry without changing directives.
    /// Structural failures need corrected directives first; the engine does
    /// not guess twice.
    pub fn retryable_without_changes(&self) -> bool {
        !matches!(self, Self::DockerfileNotFound | Self::DockerfileAmbiguous)
    }
}

/// Build parameters supplied alongside a case. Unknown fields are rejected
/// rather than silently ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BuildParams {
    pub network: Option<String>,
    pub no_cache: bool,
    pub build_args: HashMap<String, String>,
}

/// Caller-submitted descriptor for creating a case.
///
/// `env` values are write-only: they configure the container and are never
/// persisted or returned; only the key names survive for display.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseDescriptor {
    pub repo_url: String,
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    #[serde(default)]
    pub compose_file: Option<String>,
    #[serde(default)]
    pub context_path: Option<String>,
    #[serde(default)]
    pub build: BuildParams,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// The central tracked entity: one attempt to run a repository end-to-end.
#[derive(Debug, Clone, Serialize)]
pub struct Case {
    pub id: String,
    pub repo_url: String,
    pub git_ref: Option<String>,
    /// Resolved once the clone succeeds; stable for the attempt.
    pub commit_sha: Option<String>,

    pub run_mode: RunMode,
    pub dockerfile_path: Option<String>,
    pub compose_file: Option<String>,
    pub context_path: Option<String>,
    pub build: BuildParams,
    /// Names of supplied environment values; the values themselves are
    /// write-only and never stored.
    pub env_keys: Vec<String>,

    pub status: CaseStatus,
    pub stage: CaseStage,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,

    // Runtime snapshot, populated iff status == Running.
    pub access_url: Option<String>,
    pub host_port: Option<u16>,
    pub container_id: Option<String>,

    // Derived-job pointers, written by external collaborators.
    pub analyze_status: Option<String>,
    pub report_ready: bool,
    pub visual_status: Option<String>,
    pub visual_ready: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Case {
    pub fn new(descriptor: &CaseDescriptor) -> Self {
        let now = Utc::now();
        let mut env_keys: Vec<String> = descriptor.env.keys().cloned().collect();
        env_keys.sort();

        Self {
            id: Uuid::new_v4().to_string(),
            repo_url: descriptor.repo_url.clone(),
            git_ref: descriptor.git_ref.clone(),
            commit_sha: None,
            run_mode: descriptor.run_mode,
            dockerfile_path: descriptor.dockerfile_path.clone(),
            compose_file: descriptor.compose_file.clone(),
            context_path: descriptor.context_path.clone(),
            build: descriptor.build.clone(),
            env_keys,
            status: CaseStatus::Pending,
            stage: CaseStage::System,
            error_code: None,
            error_message: None,
            access_url: None,
            host_port: None,
            container_id: None,
            analyze_status: None,
            report_ready: false,
            visual_status: None,
            visual_ready: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_transitions() {
        use CaseStatus::*;
        assert!(Pending.can_transition(Cloning));
        assert!(Cloning.can_transition(Building));
        assert!(Building.can_transition(Starting));
        assert!(Starting.can_transition(Running));
        assert!(Running.can_transition(Finished));
    }

    #[test]
    fn test_failure_edges() {
        use CaseStatus::*;
        for from in [Cloning, Building, Starting, Running] {
            assert!(from.can_transition(Failed), "{:?} -> Failed", from);
        }
        assert!(!Pending.can_transition(Failed));
        assert!(!Finished.can_transition(Failed));
    }

    #[test]
    fn test_retry_and_restart_edges() {
        use CaseStatus::*;
        assert!(Failed.can_transition(Pending));
        assert!(!Finished.can_transition(Pending));
        for from in [Running, Finished, Failed] {
            assert!(from.can_transition(Building), "{:?} -> Building", from);
        }
    }

    #[test]
    fn test_archived_is_final() {
        use CaseStatus::*;
        for to in [Pending, Cloning, Building, Starting, Running, Failed, Finished, Archived] {
            assert!(!Archived.can_transition(to), "Archived -> {:?}", to);
        }
        for from in [Pending, Cloning, Building, Starting, Running, Failed, Finished] {
            assert!(from.can_transition(Archived), "{:?} -> Archived", from);
        }
    }

    #[test]
    fn test_no_skipping_pipeline_states() {
        use CaseStatus::*;
        assert!(!Pending.can_transition(Building));
        assert!(!Cloning.can_transition(Starting));
        assert!(!Building.can_transition(Running));
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in [
            ErrorCode::GitCloneFailed,
            ErrorCode::DockerfileAmbiguous,
            ErrorCode::ContainerExitNonzero,
            ErrorCode::PortPoolExhausted,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("NOPE"), None);
    }

    #[test]
    fn test_structural_errors_are_not_blind_retryable() {
        assert!(ErrorCode::GitCloneFailed.retryable_without_changes());
        assert!(ErrorCode::PortPoolExhausted.retryable_without_changes());
        assert!(!ErrorCode::DockerfileAmbiguous.retryable_without_changes());
        assert!(!ErrorCode::DockerfileNotFound.retryable_without_changes());
    }

    #[test]
    fn test_descriptor_rejects_unknown_fields() {
        let raw = serde_json::json!({
            "repo_url": "https://example.com/repo.git",
            "surprise": true
        });
        let parsed: Result<CaseDescriptor, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_new_case_retains_env_keys_only() {
        let descriptor: CaseDescriptor = serde_json::from_value(serde_json::json!({
            "repo_url": "https://example.com/repo.git",
            "env": { "API_KEY": "secret-value", "DEBUG": "1" }
        }))
        .unwrap();

        let case = Case::new(&descriptor);
        assert_eq!(case.env_keys, vec!["API_KEY", "DEBUG"]);

        let snapshot = serde_json::to_string(&case).unwrap();
        assert!(!snapshot.contains("secret-value"));
    }
}
