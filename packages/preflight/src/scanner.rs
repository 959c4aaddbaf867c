use crate::types::{CandidateKind, DockerfileCandidate};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Directories that never contain a usable Dockerfile and can be large.
const PRUNED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "vendor"];

/// Suffixes marking a Dockerfile copy as non-canonical or disabled.
const BACKUP_SUFFIXES: &[&str] = &["bak", "old", "backup", "disabled", "orig", "save", "copy"];

/// Conventional compose file names checked at the snapshot root.
pub const COMPOSE_NAMES: &[&str] = &[
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

/// Scan the snapshot tree for Dockerfile naming conventions, bounded by depth.
///
/// Results are sorted by path so repeated scans of the same tree classify and
/// order candidates identically.
pub fn scan_candidates(root: &Path, max_depth: usize) -> std::io::Result<Vec<DockerfileCandidate>> {
    let mut candidates = Vec::new();

    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && PRUNED_DIRS.contains(&name.as_ref()))
        });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let Some(kind) = classify_name(&name) else {
            continue;
        };

        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        let depth = relative.components().count().saturating_sub(1);

        candidates.push(DockerfileCandidate {
            at_root: depth == 0 && kind == CandidateKind::Primary,
            path: relative,
            kind,
            depth,
        });
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    debug!("Dockerfile scan found {} candidate(s)", candidates.len());
    Ok(candidates)
}

/// Classify a file name against Dockerfile naming conventions.
///
/// Only the exact canonical name counts as primary; suffixed and alternate
/// spellings are backups, recorded for diagnostics but never auto-selected.
pub fn classify_name(name: &str) -> Option<CandidateKind> {
    if name == "Dockerfile" {
        return Some(CandidateKind::Primary);
    }

    if name.starts_with("Dockerfile.") {
        return Some(CandidateKind::Backup);
    }

    let lower = name.to_lowercase();
    if lower == "dockerfile" || lower.ends_with(".dockerfile") || name.ends_with("Dockerfile~") {
        return Some(CandidateKind::Backup);
    }

    None
}

/// Whether a path's file name carries a backup-style suffix.
pub fn has_backup_suffix(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    BACKUP_SUFFIXES
        .iter()
        .any(|suffix| name.ends_with(&format!(".{}", suffix)))
        || name.ends_with('~')
}

/// Find a conventionally named compose file at the snapshot root.
pub fn find_compose_file(root: &Path) -> Option<PathBuf> {
    COMPOSE_NAMES
        .iter()
        .map(PathBuf::from)
        .find(|name| root.join(name).is_file())
}

/// Parse the first `EXPOSE` directive from a Dockerfile, if any.
pub fn exposed_port(dockerfile: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(dockerfile).ok()?;
    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("EXPOSE") {
            if let Some(port) = rest
                .split_whitespace()
                .next()
                .and_then(|p| p.split('/').next())
                .and_then(|p| p.parse::<u16>().ok())
            {
                return Some(port);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_canonical_name() {
        assert_eq!(classify_name("Dockerfile"), Some(CandidateKind::Primary));
    }

    #[test]
    fn test_classify_suffixed_names_as_backup() {
        for name in ["Dockerfile.bak", "Dockerfile.old", "Dockerfile.prod", "Dockerfile.dev"] {
            assert_eq!(classify_name(name), Some(CandidateKind::Backup), "{}", name);
        }
    }

    #[test]
    fn test_classify_alternate_spellings_as_backup() {
        assert_eq!(classify_name("dockerfile"), Some(CandidateKind::Backup));
        assert_eq!(classify_name("app.dockerfile"), Some(CandidateKind::Backup));
    }

    #[test]
    fn test_classify_unrelated_names() {
        assert_eq!(classify_name("Makefile"), None);
        assert_eq!(classify_name("README.md"), None);
        assert_eq!(classify_name("docker-compose.yml"), None);
    }

    #[test]
    fn test_exposed_port() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("Dockerfile");
        std::fs::write(&path, "FROM node:20\nEXPOSE 3000/tcp\nCMD [\"npm\",\"start\"]\n").unwrap();
        assert_eq!(exposed_port(&path), Some(3000));

        std::fs::write(&path, "FROM alpine\nCMD [\"true\"]\n").unwrap();
        assert_eq!(exposed_port(&path), None);
    }

    #[test]
    fn test_scan_prunes_heavy_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/some-pkg")).unwrap();
        std::fs::write(
            dir.path().join("node_modules/some-pkg/Dockerfile"),
            "FROM scratch\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let found = scan_candidates(dir.path(), 4).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].at_root);
    }
}
