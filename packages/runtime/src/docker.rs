// ABOUTME: Docker implementation of the container runtime seam using bollard
// ABOUTME: Builds case images from tar'd contexts and manages container lifecycle

use crate::context::build_context_tar;
use crate::{
    compose, BuildRequest, ContainerExit, ContainerRuntime, Result, RunRequest, RunningContainer,
    RuntimeError,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::BuildImageOptions,
    Docker,
};
use drydock_logs::{CaseLogStore, LogLevel, LogStream};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How many trailing builder output lines a build failure message carries.
const BUILD_ERROR_TAIL_LINES: usize = 20;

pub struct DockerRuntime {
    client: Docker,
    label_prefix: String,
}

impl DockerRuntime {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Connection(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            label_prefix: "drydock.case".to_string(),
        }
    }

    pub async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    /// Convert a run request to a bollard container config with the leased
    /// host port bound to the service port.
    fn to_container_config(&self, case_id: &str, request: &RunRequest) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(format!("{}.managed", self.label_prefix), "true".to_string());
        labels.insert(format!("{}.id", self.label_prefix), case_id.to_string());

        let container_port = format!("{}/tcp", request.container_port);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(container_port.clone(), HashMap::new());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            container_port,
            Some(vec![bollard::models::PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(request.lease.port().to_string()),
            }]),
        );

        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        Config {
            image: Some(request.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(bollard::models::HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        case_id: &str,
        request: &BuildRequest,
        logs: &CaseLogStore,
    ) -> Result<String> {
        info!(
            "Building image {} from {}",
            request.image_tag,
            request.context_dir.display()
        );

        let (tar_data, dockerfile_name) =
            build_context_tar(&request.context_dir, &request.dockerfile)?;

        let mut options = BuildImageOptions::<String> {
            dockerfile: dockerfile_name,
            t: request.image_tag.clone(),
            nocache: request.no_cache,
            rm: true,
            buildargs: request.build_args.clone(),
            ..Default::default()
        };
        if let Some(network) = &request.network {
            options.networkmode = network.clone();
        }

        let mut stream = self.client.build_image(options, None, Some(tar_data.into()));
        let mut tail: VecDeque<String> = VecDeque::new();

        while let Some(result) = stream.next().await {
            match result {
                Ok(build_info) => {
                    if let Some(chunk) = &build_info.stream {
                        for line in chunk.lines() {
                            let line = line.trim_end();
                            if line.is_empty() {
                                continue;
                            }
                            logs.build_line(case_id, line).await;
                            tail.push_back(line.to_string());
                            while tail.len() > BUILD_ERROR_TAIL_LINES {
                                tail.pop_front();
                            }
                        }
                    }
                    if let Some(message) = build_info.error {
                        logs.append(case_id, LogStream::Build, LogLevel::Error, &message)
                            .await;
                        return Err(RuntimeError::Build(format!(
                            "{}\n{}",
                            message,
                            tail.iter().cloned().collect::<Vec<_>>().join("\n")
                        )));
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::Build(format!(
                        "{}\n{}",
                        e,
                        tail.iter().cloned().collect::<Vec<_>>().join("\n")
                    )))
                }
            }
        }

        info!("Built image {}", request.image_tag);
        Ok(request.image_tag.clone())
    }

    async fn run_container(
        &self,
        case_id: &str,
        request: RunRequest,
        logs: Arc<CaseLogStore>,
    ) -> Result<RunningContainer> {
        info!(
            "Starting container {} on host port {}",
            request.name,
            request.lease.port()
        );

        let config = self.to_container_config(case_id, &request);
        let options = CreateContainerOptions {
            name: request.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        debug!("Started container {}", container.id);

        // Forward container output to the run stream as it is produced.
        let log_stream = self.client.logs(
            &container.id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            }),
        );
        let forward_case = case_id.to_string();
        tokio::spawn(async move {
            let mut stream = Box::pin(log_stream);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(output) => {
                        let (level, message) = match output {
                            LogOutput::StdOut { message } | LogOutput::Console { message } => {
                                (LogLevel::Info, message)
                            }
                            LogOutput::StdErr { message } => (LogLevel::Error, message),
                            _ => continue,
                        };
                        let text = String::from_utf8_lossy(&message);
                        for line in text.lines() {
                            if line.is_empty() {
                                continue;
                            }
                            logs.append(&forward_case, LogStream::Run, level, line).await;
                        }
                    }
                    Err(e) => {
                        error!("Log stream for case {} ended: {}", forward_case, e);
                        break;
                    }
                }
            }
        });

        let host_port = request.lease.port();
        Ok(RunningContainer {
            container_id: container.id,
            host_port,
            lease: request.lease,
        })
    }

    async fn stop_container(&self, container_id: &str, grace: Duration) -> Result<()> {
        info!(
            "Stopping container {} (grace {}s)",
            container_id,
            grace.as_secs()
        );

        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped or already gone both count as stopped.
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 304 || status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(RuntimeError::Container(e.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Container(e.to_string())),
        }
    }

    async fn inspect_exit(&self, container_id: &str) -> Result<ContainerExit> {
        let inspect = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        let state = inspect.state.ok_or_else(|| {
            RuntimeError::Container("Container has no state information".to_string())
        })?;

        if state.running.unwrap_or(false) {
            Ok(ContainerExit::Running)
        } else {
            Ok(ContainerExit::Exited {
                code: state.exit_code.unwrap_or(0),
            })
        }
    }

    async fn compose_up(
        &self,
        case_id: &str,
        compose_file: &Path,
        project: &str,
        env: &HashMap<String, String>,
        logs: Arc<CaseLogStore>,
    ) -> Result<()> {
        compose::up(case_id, compose_file, project, env, logs).await
    }

    async fn compose_down(&self, compose_file: &Path, project: &str) -> Result<()> {
        compose::down(compose_file, project).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_ports::PortPool;

    #[test]
    fn test_container_config_binds_leased_port() {
        let client = Docker::connect_with_defaults();
        let runtime = match client {
            Ok(client) => DockerRuntime::with_client(client),
            // No daemon in the test environment; config conversion does not
            // need one, so skip rather than fail.
            Err(_) => return,
        };

        let pool = PortPool::new(9100, 9101).unwrap();
        let lease = pool.allocate().unwrap();
        let leased = lease.port();

        let request = RunRequest {
            image: "drydock-case:abc".to_string(),
            name: "drydock-case-abc".to_string(),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            container_port: 3000,
            lease,
        };

        let config = runtime.to_container_config("case-abc", &request);

        assert_eq!(config.image, Some("drydock-case:abc".to_string()));
        assert!(config.env.unwrap().contains(&"FOO=bar".to_string()));

        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings.get("3000/tcp").unwrap().as_ref().unwrap();
        assert_eq!(binding[0].host_port, Some(leased.to_string()));
    }
}
