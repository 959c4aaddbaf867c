use crate::ecosystem::{default_port, node_start_command};
use crate::types::Ecosystem;
use std::path::{Path, PathBuf};
use tracing::info;

/// A build recipe synthesized for a repository with no usable Dockerfile.
#[derive(Debug, Clone)]
pub struct GeneratedRecipe {
    /// Absolute path of the synthesized Dockerfile, outside the snapshot tree.
    pub dockerfile: PathBuf,
    /// Build context, which remains the untouched snapshot root.
    pub context: PathBuf,
    pub ecosystem: Ecosystem,
}

/// Synthesize a minimal Dockerfile for a recognized ecosystem into the scoped
/// scratch directory. The snapshot tree itself is never written to.
pub fn generate_recipe(
    root: &Path,
    scratch_dir: &Path,
    ecosystem: Ecosystem,
) -> std::io::Result<GeneratedRecipe> {
    std::fs::create_dir_all(scratch_dir)?;
    let dockerfile = scratch_dir.join("Dockerfile");
    let content = recipe_content(root, ecosystem);
    std::fs::write(&dockerfile, content)?;

    info!(
        "Generated {} build recipe at {}",
        ecosystem.as_str(),
        dockerfile.display()
    );

    Ok(GeneratedRecipe {
        dockerfile,
        context: root.to_path_buf(),
        ecosystem,
    })
}

fn recipe_content(root: &Path, ecosystem: Ecosystem) -> String {
    let port = default_port(ecosystem);
    match ecosystem {
        Ecosystem::Node => {
            let cmd = node_start_command(root)
                .into_iter()
                .map(|part| format!("\"{}\"", part))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "FROM node:20-alpine\n\
                 WORKDIR /app\n\
                 COPY . .\n\
                 RUN npm install\n\
                 EXPOSE {port}\n\
                 CMD [{cmd}]\n"
            )
        }
        Ecosystem::Python => format!(
            "FROM python:3.12-slim\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\n\
             EXPOSE {port}\n\
             CMD [\"python3\", \"-m\", \"http.server\", \"{port}\"]\n"
        ),
        Ecosystem::Rust => format!(
            "FROM rust:1.79\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN cargo build --release\n\
             EXPOSE {port}\n\
             CMD [\"cargo\", \"run\", \"--release\"]\n"
        ),
        Ecosystem::Go => format!(
            "FROM golang:1.22\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN go build -o /usr/local/bin/app ./...\n\
             EXPOSE {port}\n\
             CMD [\"/usr/local/bin/app\"]\n"
        ),
        Ecosystem::Static => format!(
            "FROM nginx:alpine\n\
             COPY . /usr/share/nginx/html\n\
             EXPOSE {port}\n"
        ),
    }
}
