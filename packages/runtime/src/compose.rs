// ABOUTME: Compose strategy support shelling out to the docker compose CLI
// ABOUTME: Forwards compose output line-by-line into the case log store

use crate::{Result, RuntimeError};
use drydock_logs::{CaseLogStore, LogLevel, LogStream};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

const COMPOSE_ERROR_TAIL_LINES: usize = 20;

/// Run `docker compose up -d --build`, forwarding build output to the build
/// stream, then follow service logs on the run stream in the background.
pub async fn up(
    case_id: &str,
    compose_file: &Path,
    project: &str,
    env: &HashMap<String, String>,
    logs: Arc<CaseLogStore>,
) -> Result<()> {
    info!(
        "Bringing up compose project {} from {}",
        project,
        compose_file.display()
    );

    let mut command = Command::new("docker");
    command
        .arg("compose")
        .arg("-f")
        .arg(compose_file)
        .arg("-p")
        .arg(project)
        .arg("up")
        .arg("-d")
        .arg("--build")
        .envs(env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    let tail = Arc::new(Mutex::new(VecDeque::new()));

    let stdout = child.stdout.take();
    let stdout_task = stdout.map(|out| {
        let logs = Arc::clone(&logs);
        let case = case_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.build_line(&case, line).await;
            }
        })
    });

    let stderr = child.stderr.take();
    let stderr_task = stderr.map(|err| {
        let logs = Arc::clone(&logs);
        let case = case_id.to_string();
        let tail = Arc::clone(&tail);
        tokio::spawn(async move {
            let mut lines = BufReader::new(err).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.append(&case, LogStream::Build, LogLevel::Info, &line).await;
                let mut tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                tail.push_back(line);
                while tail.len() > COMPOSE_ERROR_TAIL_LINES {
                    tail.pop_front();
                }
            }
        })
    });

    let status = child.wait().await?;
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }

    if !status.success() {
        let tail = tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        return Err(RuntimeError::Compose(format!(
            "docker compose up exited with {}\n{}",
            status,
            tail.iter().cloned().collect::<Vec<_>>().join("\n")
        )));
    }

    follow_service_logs(case_id, compose_file, project, logs);
    Ok(())
}

/// Tear down a compose project. Failures to spawn surface; a non-zero exit is
/// logged and tolerated since the project may already be gone.
pub async fn down(compose_file: &Path, project: &str) -> Result<()> {
    info!("Tearing down compose project {}", project);

    let output = Command::new("docker")
        .arg("compose")
        .arg("-f")
        .arg(compose_file)
        .arg("-p")
        .arg(project)
        .arg("down")
        .arg("--remove-orphans")
        .output()
        .await?;

    if !output.status.success() {
        warn!(
            "docker compose down for {} exited with {}: {}",
            project,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Follow service logs in the background on the run stream. Best-effort: the
/// task ends when the project stops or the follow process exits.
fn follow_service_logs(case_id: &str, compose_file: &Path, project: &str, logs: Arc<CaseLogStore>) {
    let case = case_id.to_string();
    let compose_file = compose_file.to_path_buf();
    let project = project.to_string();

    tokio::spawn(async move {
        let child = Command::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(&compose_file)
            .arg("-p")
            .arg(&project)
            .arg("logs")
            .arg("-f")
            .arg("--no-color")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to follow compose logs for {}: {}", project, e);
                return;
            }
        };

        if let Some(out) = child.stdout.take() {
            let mut lines = BufReader::new(out).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logs.run_line(&case, line).await;
            }
        }
        let _ = child.wait().await;
    });
}
