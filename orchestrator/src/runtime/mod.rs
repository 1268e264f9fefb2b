//! Container runtime client
//!
//! Every state query and mutation the reconciler performs goes through
//! [`ContainerRuntime`]. [`DockerRuntime`] talks to the Docker Engine API;
//! [`FakeRuntime`] keeps everything in memory for tests.

mod docker;
pub mod fake;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{BuildSpec, ContainerSpec, ContainerSummary, NetworkSummary, RestartPolicy};

pub use docker::DockerRuntime;
pub use fake::FakeRuntime;

/// Runtime client error types
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to pull {image}: {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to build {image}: {reason}")]
    BuildFailed { image: String, reason: String },

    #[error("Container runtime error: {0}")]
    Api(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Receives streamed build and exec output one line at a time
pub trait OutputSink: Send + Sync {
    fn line(&self, line: &str);
}

impl<F> OutputSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// Operations the reconciler needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Ok` when the image is present locally, `NotFound` otherwise
    async fn inspect_image(&self, image: &str) -> RuntimeResult<()>;

    async fn pull_image(&self, image: &str) -> RuntimeResult<()>;

    /// Build an image, streaming build output into `sink`
    async fn build_image(&self, spec: &BuildSpec, sink: &dyn OutputSink) -> RuntimeResult<()>;

    /// All containers, running or not
    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Returns the new container id
    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn update_restart_policy(&self, id: &str, policy: RestartPolicy) -> RuntimeResult<()>;

    async fn start_container(&self, id: &str) -> RuntimeResult<()>;

    async fn stop_container(&self, id: &str) -> RuntimeResult<()>;

    async fn remove_container(&self, id: &str) -> RuntimeResult<()>;

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>>;

    /// Returns the new network id
    async fn create_network(&self, name: &str) -> RuntimeResult<String>;

    async fn remove_network(&self, id: &str) -> RuntimeResult<()>;

    /// Returns the exec instance id
    async fn create_exec(&self, container_id: &str, cmd: &[String]) -> RuntimeResult<String>;

    /// Run an exec instance to completion, streaming its output into `sink`
    async fn start_exec(&self, exec_id: &str, sink: &dyn OutputSink) -> RuntimeResult<()>;

    /// Exit code of a finished exec instance
    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<Option<i64>>;
}
