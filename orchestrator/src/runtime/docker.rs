//! Docker Engine API client built on bollard

use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{EndpointSettings, HostConfig, PortBinding, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use super::{ContainerRuntime, OutputSink, RuntimeError, RuntimeResult};
use crate::models::{
    BuildSpec, ContainerSpec, ContainerState, ContainerSummary, NetworkSummary, RestartPolicy,
};

/// Container runtime backed by the local Docker daemon
pub struct DockerRuntime {
    docker: Docker,
    /// Seconds to wait before killing a container on stop
    stop_timeout: i64,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect(stop_timeout_seconds: u64) -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            stop_timeout: i64::try_from(stop_timeout_seconds).unwrap_or(i64::MAX),
        })
    }

    /// Daemon version. Fails when the daemon cannot be reached.
    pub async fn version(&self) -> RuntimeResult<String> {
        let version = self.docker.version().await?;
        let version = version.version.unwrap_or_else(|| "unknown".to_string());
        info!(docker_version = %version, "Docker daemon reachable");
        Ok(version)
    }
}

impl From<BollardError> for RuntimeError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

/// 304 from start/stop means the container is already in the requested state
fn is_not_modified(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code: 304, .. }
    )
}

/// Split `repo[:tag]` into repository and tag. A colon before the last slash
/// belongs to a registry port, not a tag.
fn split_image_reference(image: &str) -> (&str, &str) {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Reassembles streamed output into whole lines, holding a trailing fragment
/// until its newline arrives
#[derive(Debug, Default)]
struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    fn push(&mut self, chunk: &str, sink: &dyn OutputSink) {
        self.pending.push_str(chunk);
        while let Some(end) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=end).collect();
            sink.line(line.trim_end());
        }
    }

    fn finish(self, sink: &dyn OutputSink) {
        let rest = self.pending.trim_end();
        if !rest.is_empty() {
            sink.line(rest);
        }
    }
}

/// Tar up a build context directory
fn archive_context(context: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", context)?;
    builder.into_inner()
}

fn restart_policy(policy: RestartPolicy) -> bollard::models::RestartPolicy {
    let name = match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
    };
    bollard::models::RestartPolicy {
        name: Some(name),
        maximum_retry_count: None,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

    let volumes: HashMap<String, HashMap<(), ()>> = spec
        .binds
        .iter()
        .map(|bind| (bind.target.clone(), HashMap::new()))
        .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .port_bindings
        .keys()
        .map(|port| (format!("{}/tcp", port), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .port_bindings
        .iter()
        .map(|(container_port, host_port)| {
            (
                format!("{}/tcp", container_port),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host_port.to_string()),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        binds: Some(spec.binds.iter().map(|b| b.to_string()).collect()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        privileged: Some(spec.privileged),
        restart_policy: Some(restart_policy(spec.restart_policy)),
        links: (!spec.links.is_empty())
            .then(|| spec.links.iter().map(|l| l.to_string()).collect()),
        ..Default::default()
    };

    let mut endpoints_config = HashMap::new();
    endpoints_config.insert(
        spec.network.clone(),
        EndpointSettings {
            aliases: Some(spec.aliases.clone()),
            ..Default::default()
        },
    );

    Config {
        image: Some(spec.image.clone()),
        hostname: Some(spec.hostname.clone()),
        env: Some(env),
        volumes: (!volumes.is_empty()).then_some(volumes),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        networking_config: Some(NetworkingConfig { endpoints_config }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect_image(&self, image: &str) -> RuntimeResult<()> {
        self.docker.inspect_image(image).await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let (repository, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image: repository,
            tag,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(item) = stream.next().await {
            let info = item.map_err(|err| match RuntimeError::from(err) {
                RuntimeError::NotFound(reason) => RuntimeError::NotFound(reason),
                other => RuntimeError::PullFailed {
                    image: image.to_string(),
                    reason: other.to_string(),
                },
            })?;

            if let Some(reason) = info.error {
                return Err(RuntimeError::PullFailed {
                    image: image.to_string(),
                    reason,
                });
            }
            if let Some(status) = info.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    async fn build_image(&self, spec: &BuildSpec, sink: &dyn OutputSink) -> RuntimeResult<()> {
        let context = spec.context.clone();
        let archive = tokio::task::spawn_blocking(move || archive_context(&context))
            .await
            .map_err(|err| RuntimeError::Api(format!("build context task failed: {}", err)))??;

        debug!(
            tag = %spec.tag,
            dockerfile = %spec.dockerfile,
            context_bytes = archive.len(),
            "Sending build context"
        );

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: spec.tag.clone(),
            rm: true,
            forcerm: true,
            pull: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(archive.into()));
        while let Some(item) = stream.next().await {
            let info = item?;

            if let Some(line) = info.status.as_deref().or(info.stream.as_deref()) {
                let line = line.trim();
                if !line.is_empty() {
                    sink.line(line);
                }
            }

            let detail = info.error_detail.and_then(|d| d.message);
            if let Some(reason) = detail.or(info.error) {
                sink.line(reason.trim());
                return Err(RuntimeError::BuildFailed {
                    image: spec.tag.clone(),
                    reason,
                });
            }
        }

        Ok(())
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                state: ContainerState::parse(c.state.as_deref().unwrap_or_default()),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await?;

        for warning in &response.warnings {
            debug!(container = %spec.name, warning = %warning, "Create warning");
        }

        Ok(response.id)
    }

    async fn update_restart_policy(&self, id: &str, policy: RestartPolicy) -> RuntimeResult<()> {
        let options = UpdateContainerOptions::<String> {
            restart_policy: Some(restart_policy(policy)),
            ..Default::default()
        };
        self.docker.update_container(id, options).await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Err(err) if !is_not_modified(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Err(err) if !is_not_modified(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;

        Ok(networks
            .into_iter()
            .map(|n| NetworkSummary {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.docker.create_network(options).await?;
        Ok(response.id.unwrap_or_default())
    }

    async fn remove_network(&self, id: &str) -> RuntimeResult<()> {
        self.docker.remove_network(id).await?;
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, cmd: &[String]) -> RuntimeResult<String> {
        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, options).await?;
        Ok(exec.id)
    }

    async fn start_exec(&self, exec_id: &str, sink: &dyn OutputSink) -> RuntimeResult<()> {
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(exec_id, None).await?
        {
            let mut lines = LineBuffer::default();
            while let Some(chunk) = output.next().await {
                lines.push(&chunk?.to_string(), sink);
            }
            lines.finish(sink);
        }
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<Option<i64>> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code)
    }
}
