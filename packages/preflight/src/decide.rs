use crate::ecosystem::detect_ecosystem;
use crate::generate::generate_recipe;
use crate::scanner::{classify_name, find_compose_file, has_backup_suffix, scan_candidates};
use crate::types::{
    BuildStrategy, CandidateKind, DockerfileCandidate, PreflightConfig, PreflightDecision,
    PreflightDirectives, RunMode, SelectionReason,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("Dockerfile not found at explicit path: {path}")]
    ExplicitPathMissing {
        path: PathBuf,
        decision: Box<PreflightDecision>,
    },

    #[error("Multiple primary Dockerfile candidates with no root-level preference")]
    Ambiguous { decision: Box<PreflightDecision> },

    #[error("No usable Dockerfile found for container run mode")]
    NoDockerfile { decision: Box<PreflightDecision> },

    #[error("Compose file not found: {path}")]
    ComposeFileMissing {
        path: PathBuf,
        decision: Box<PreflightDecision>,
    },

    #[error("IO error during preflight: {0}")]
    Io(#[from] std::io::Error),
}

impl PreflightError {
    /// The decision record captured before the failure, when one exists.
    pub fn decision(&self) -> Option<&PreflightDecision> {
        match self {
            PreflightError::ExplicitPathMissing { decision, .. } => Some(decision),
            PreflightError::Ambiguous { decision } => Some(decision),
            PreflightError::NoDockerfile { decision } => Some(decision),
            PreflightError::ComposeFileMissing { decision, .. } => Some(decision),
            PreflightError::Io(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PreflightError>;

/// Decide how to build a repository snapshot.
///
/// Pure over the filesystem view: given the same tree and directives the same
/// decision (including its reason) comes back every time. Synthesized recipes
/// land in the scoped scratch directory, never in the snapshot itself.
pub fn decide(
    root: &Path,
    directives: &PreflightDirectives,
    config: &PreflightConfig,
) -> Result<PreflightDecision> {
    let decision = match directives.run_mode {
        RunMode::Showcase => {
            let mut decision = PreflightDecision::empty(SelectionReason::ExplicitMode);
            decision.selected = Some(BuildStrategy::Showcase);
            decision
        }
        RunMode::Compose => decide_compose(root, directives)?,
        RunMode::Container => decide_dockerfile(root, directives, config, false)?,
        RunMode::Auto => decide_dockerfile(root, directives, config, true)?,
    };

    info!(
        reason = decision.reason.as_str(),
        strategy = decision.selected.as_ref().map(|s| s.kind()).unwrap_or("none"),
        "Preflight decision"
    );
    Ok(decision)
}

fn decide_compose(root: &Path, directives: &PreflightDirectives) -> Result<PreflightDecision> {
    let mut decision = PreflightDecision::empty(SelectionReason::ComposeFile);

    let relative = match &directives.compose_file {
        Some(explicit) => {
            if !root.join(explicit).is_file() {
                return Err(PreflightError::ComposeFileMissing {
                    path: explicit.clone(),
                    decision: Box::new(decision),
                });
            }
            explicit.clone()
        }
        None => match find_compose_file(root) {
            Some(found) => found,
            None => {
                return Err(PreflightError::ComposeFileMissing {
                    path: PathBuf::from("docker-compose.yml"),
                    decision: Box::new(decision),
                })
            }
        },
    };

    decision.selected = Some(BuildStrategy::Compose {
        compose_file: root.join(relative),
    });
    Ok(decision)
}

fn decide_dockerfile(
    root: &Path,
    directives: &PreflightDirectives,
    config: &PreflightConfig,
    allow_fallbacks: bool,
) -> Result<PreflightDecision> {
    let context = resolve_context(root, directives);

    // Step 1: an explicit path short-circuits the scan entirely.
    if let Some(explicit) = &directives.dockerfile_path {
        return decide_explicit(root, explicit, context);
    }

    let candidates = scan_candidates(root, config.max_depth)?;
    let primaries: Vec<&DockerfileCandidate> = candidates
        .iter()
        .filter(|c| c.kind == CandidateKind::Primary)
        .collect();
    let backups: Vec<PathBuf> = candidates
        .iter()
        .filter(|c| c.kind == CandidateKind::Backup)
        .map(|c| c.path.clone())
        .collect();

    let mut decision = PreflightDecision {
        selected: None,
        reason: SelectionReason::NotFound,
        candidates: candidates.clone(),
        backups: backups.clone(),
        non_unique_primary: false,
        warnings: Vec::new(),
        generated_files: Vec::new(),
    };

    if !backups.is_empty() {
        decision.warnings.push(format!(
            "Ignored {} backup Dockerfile candidate(s)",
            backups.len()
        ));
    }

    match primaries.len() {
        // Steps 2-3: a unique primary is selected outright.
        1 => {
            let candidate = primaries[0];
            decision.reason = if candidate.at_root {
                SelectionReason::RootDockerfile
            } else {
                SelectionReason::SingleCandidate
            };
            decision.selected = Some(BuildStrategy::Dockerfile {
                dockerfile: root.join(&candidate.path),
                context,
            });
            Ok(decision)
        }
        // Step 4: several primaries; a root-level one resolves the tie,
        // otherwise the engine refuses to guess.
        n if n > 1 => {
            decision.non_unique_primary = true;
            if let Some(at_root) = primaries.iter().find(|c| c.at_root) {
                let others: Vec<String> = primaries
                    .iter()
                    .filter(|c| !c.at_root)
                    .map(|c| c.path.display().to_string())
                    .collect();
                decision.warnings.push(format!(
                    "Preferred root Dockerfile over: {}",
                    others.join(", ")
                ));
                decision.reason = SelectionReason::RootDockerfile;
                decision.selected = Some(BuildStrategy::Dockerfile {
                    dockerfile: root.join(&at_root.path),
                    context,
                });
                Ok(decision)
            } else {
                warn!("Ambiguous Dockerfile candidates: {} primaries", n);
                decision.reason = SelectionReason::Ambiguous;
                Err(PreflightError::Ambiguous {
                    decision: Box::new(decision),
                })
            }
        }
        // Steps 5-8: no primary; backups stay filtered and the fallback
        // ladder (compose, generated, showcase) takes over.
        _ => {
            if !allow_fallbacks {
                return Err(PreflightError::NoDockerfile {
                    decision: Box::new(decision),
                });
            }

            if let Some(compose) = explicit_or_conventional_compose(root, directives) {
                if let Some(explicit) = &directives.compose_file {
                    if !root.join(explicit).is_file() {
                        return Err(PreflightError::ComposeFileMissing {
                            path: explicit.clone(),
                            decision: Box::new(decision),
                        });
                    }
                }
                decision.reason = SelectionReason::ComposeFile;
                decision.selected = Some(BuildStrategy::Compose {
                    compose_file: root.join(compose),
                });
                return Ok(decision);
            }

            if let Some(ecosystem) = detect_ecosystem(root) {
                let recipe = generate_recipe(root, &config.scratch_dir, ecosystem)?;
                decision.reason = SelectionReason::generated_for(ecosystem);
                decision.generated_files.push(recipe.dockerfile.clone());
                decision.selected = Some(BuildStrategy::Generated {
                    dockerfile: recipe.dockerfile,
                    context: recipe.context,
                    ecosystem,
                });
                return Ok(decision);
            }

            decision.reason = SelectionReason::NotFound;
            decision.selected = Some(BuildStrategy::Showcase);
            Ok(decision)
        }
    }
}

fn decide_explicit(root: &Path, explicit: &Path, context: PathBuf) -> Result<PreflightDecision> {
    let absolute = root.join(explicit);
    if !absolute.is_file() {
        return Err(PreflightError::ExplicitPathMissing {
            path: explicit.to_path_buf(),
            decision: Box::new(PreflightDecision::empty(SelectionReason::NotFound)),
        });
    }

    let name = explicit
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let kind = classify_name(&name).unwrap_or(CandidateKind::Backup);

    let mut decision = PreflightDecision::empty(SelectionReason::ExplicitPath);
    decision.candidates.push(DockerfileCandidate {
        path: explicit.to_path_buf(),
        kind,
        at_root: explicit.components().count() == 1,
        depth: explicit.components().count().saturating_sub(1),
    });
    if kind == CandidateKind::Backup || has_backup_suffix(explicit) {
        decision
            .warnings
            .push("DOCKERFILE_BACKUP_SELECTED".to_string());
    }
    decision.selected = Some(BuildStrategy::Dockerfile {
        dockerfile: absolute,
        context,
    });
    Ok(decision)
}

fn resolve_context(root: &Path, directives: &PreflightDirectives) -> PathBuf {
    match &directives.context_path {
        Some(relative) => root.join(relative),
        None => root.to_path_buf(),
    }
}

fn explicit_or_conventional_compose(
    root: &Path,
    directives: &PreflightDirectives,
) -> Option<PathBuf> {
    directives
        .compose_file
        .clone()
        .or_else(|| find_compose_file(root))
}
