use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the caller wants the repository to be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Auto,
    Container,
    Showcase,
    Compose,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Auto => "auto",
            RunMode::Container => "container",
            RunMode::Showcase => "showcase",
            RunMode::Compose => "compose",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(RunMode::Auto),
            "container" => Some(RunMode::Container),
            "showcase" => Some(RunMode::Showcase),
            "compose" => Some(RunMode::Compose),
            _ => None,
        }
    }
}

/// Ecosystem recognized from repository manifest files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Node,
    Python,
    Rust,
    Go,
    Static,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Node => "node",
            Ecosystem::Python => "python",
            Ecosystem::Rust => "rust",
            Ecosystem::Go => "go",
            Ecosystem::Static => "static",
        }
    }
}

/// Classification of a discovered Dockerfile candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
    /// Canonical `Dockerfile` name in a scannable location.
    Primary,
    /// Suffixed or alternate name suggesting a non-canonical or disabled copy.
    Backup,
}

/// One Dockerfile-like file found during the preflight scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerfileCandidate {
    /// Path relative to the snapshot root.
    pub path: PathBuf,
    pub kind: CandidateKind,
    pub at_root: bool,
    pub depth: usize,
}

/// Why a particular strategy was selected (or selection failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    ExplicitPath,
    ExplicitMode,
    RootDockerfile,
    SingleCandidate,
    Ambiguous,
    ComposeFile,
    GeneratedForNode,
    GeneratedForPython,
    GeneratedForRust,
    GeneratedForGo,
    GeneratedForStatic,
    NotFound,
}

impl SelectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionReason::ExplicitPath => "explicit_path",
            SelectionReason::ExplicitMode => "explicit_mode",
            SelectionReason::RootDockerfile => "root_dockerfile",
            SelectionReason::SingleCandidate => "single_candidate",
            SelectionReason::Ambiguous => "ambiguous",
            SelectionReason::ComposeFile => "compose_file",
            SelectionReason::GeneratedForNode => "generated_for_node",
            SelectionReason::GeneratedForPython => "generated_for_python",
            SelectionReason::GeneratedForRust => "generated_for_rust",
            SelectionReason::GeneratedForGo => "generated_for_go",
            SelectionReason::GeneratedForStatic => "generated_for_static",
            SelectionReason::NotFound => "not_found",
        }
    }

    pub fn generated_for(ecosystem: Ecosystem) -> Self {
        match ecosystem {
            Ecosystem::Node => SelectionReason::GeneratedForNode,
            Ecosystem::Python => SelectionReason::GeneratedForPython,
            Ecosystem::Rust => SelectionReason::GeneratedForRust,
            Ecosystem::Go => SelectionReason::GeneratedForGo,
            Ecosystem::Static => SelectionReason::GeneratedForStatic,
        }
    }
}

/// The selected build approach, dispatched on by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BuildStrategy {
    Dockerfile { dockerfile: PathBuf, context: PathBuf },
    Compose { compose_file: PathBuf },
    Generated { dockerfile: PathBuf, context: PathBuf, ecosystem: Ecosystem },
    Showcase,
}

impl BuildStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildStrategy::Dockerfile { .. } => "dockerfile",
            BuildStrategy::Compose { .. } => "compose",
            BuildStrategy::Generated { .. } => "generated",
            BuildStrategy::Showcase => "showcase",
        }
    }
}

/// Structured, explainable record of one preflight decision.
///
/// Emitted verbatim to the audit trail and the diagnostics endpoint; when
/// selection fails the record is carried inside the error so callers still
/// see every candidate and warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightDecision {
    /// `None` when selection failed (ambiguous, nothing usable).
    pub selected: Option<BuildStrategy>,
    pub reason: SelectionReason,
    /// Every candidate found during the scan, primaries and backups alike.
    pub candidates: Vec<DockerfileCandidate>,
    /// Backup-classified paths that were filtered out, for diagnostics.
    pub backups: Vec<PathBuf>,
    pub non_unique_primary: bool,
    pub warnings: Vec<String>,
    /// Files synthesized by the generated strategy, outside the snapshot tree.
    pub generated_files: Vec<PathBuf>,
}

impl PreflightDecision {
    pub(crate) fn empty(reason: SelectionReason) -> Self {
        Self {
            selected: None,
            reason,
            candidates: Vec::new(),
            backups: Vec::new(),
            non_unique_primary: false,
            warnings: Vec::new(),
            generated_files: Vec::new(),
        }
    }
}

/// Caller-supplied directives that override or constrain the decision.
#[derive(Debug, Clone, Default)]
pub struct PreflightDirectives {
    pub run_mode: RunMode,
    /// Relative to the snapshot root.
    pub dockerfile_path: Option<PathBuf>,
    pub compose_file: Option<PathBuf>,
    pub context_path: Option<PathBuf>,
}

/// Tunables consumed from external configuration.
#[derive(Debug, Clone)]
pub struct PreflightConfig {
    /// Maximum directory depth for the Dockerfile scan.
    pub max_depth: usize,
    /// Scoped directory for synthesized build recipes, outside the snapshot.
    pub scratch_dir: PathBuf,
}

impl PreflightConfig {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self {
            max_depth: 4,
            scratch_dir,
        }
    }
}
