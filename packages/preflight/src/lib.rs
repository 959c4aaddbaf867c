// ABOUTME: Preflight strategy engine deciding how to build a repository snapshot
// ABOUTME: Scans for Dockerfiles, detects ecosystems and emits explainable decision records

pub mod decide;
pub mod ecosystem;
pub mod generate;
pub mod scanner;
pub mod types;

pub use decide::{decide, PreflightError, Result};
pub use ecosystem::{default_port, detect_ecosystem};
pub use generate::{generate_recipe, GeneratedRecipe};
pub use scanner::{exposed_port, find_compose_file, scan_candidates};
pub use types::{
    BuildStrategy, CandidateKind, DockerfileCandidate, Ecosystem, PreflightConfig,
    PreflightDecision, PreflightDirectives, RunMode, SelectionReason,
};
