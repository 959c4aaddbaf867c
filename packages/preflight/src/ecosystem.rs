use crate::types::Ecosystem;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Detect a known ecosystem from repository manifest files.
///
/// Checks are layered from the most specific signal to the weakest; the first
/// match wins so repeated calls over the same tree agree.
pub fn detect_ecosystem(root: &Path) -> Option<Ecosystem> {
    if root.join("package.json").exists() {
        debug!("Found package.json, treating as Node ecosystem");
        return Some(Ecosystem::Node);
    }

    if root.join("requirements.txt").exists() || root.join("pyproject.toml").exists() {
        debug!("Found Python project indicators");
        return Some(Ecosystem::Python);
    }

    if root.join("Cargo.toml").exists() {
        debug!("Found Cargo.toml, treating as Rust ecosystem");
        return Some(Ecosystem::Rust);
    }

    if root.join("go.mod").exists() {
        debug!("Found go.mod, treating as Go ecosystem");
        return Some(Ecosystem::Go);
    }

    if root.join("index.html").exists() {
        debug!("Found index.html, treating as static site");
        return Some(Ecosystem::Static);
    }

    None
}

/// Default service port a generated recipe exposes for an ecosystem.
pub fn default_port(ecosystem: Ecosystem) -> u16 {
    match ecosystem {
        Ecosystem::Node => 3000,
        Ecosystem::Python => 8000,
        Ecosystem::Rust => 8080,
        Ecosystem::Go => 8080,
        Ecosystem::Static => 80,
    }
}

/// Start command for a Node project, preferring declared scripts.
pub fn node_start_command(root: &Path) -> Vec<String> {
    let package_json = root.join("package.json");
    if let Ok(content) = std::fs::read_to_string(&package_json) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&content) {
            let scripts = parsed.get("scripts").and_then(|s| s.as_object());
            if let Some(scripts) = scripts {
                for name in ["start", "dev", "serve"] {
                    if scripts.contains_key(name) {
                        return vec!["npm".into(), "run".into(), name.into()];
                    }
                }
            }
        }
    }
    vec!["npm".into(), "start".into()]
}
