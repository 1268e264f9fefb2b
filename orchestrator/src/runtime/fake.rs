//! In-memory container runtime for testing.
//!
//! Simulates images, containers, networks and exec instances without a Docker
//! daemon, and records every call in order so tests can assert on sequencing.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{ContainerRuntime, OutputSink, RuntimeError, RuntimeResult};
use crate::models::{
    BuildSpec, ContainerSpec, ContainerState, ContainerSummary, NetworkSummary, RestartPolicy,
};

/// One recorded runtime call. Containers are identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InspectImage(String),
    PullImage(String),
    BuildImage(String),
    ListContainers,
    CreateContainer(String),
    UpdateRestartPolicy(String),
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    ListNetworks,
    CreateNetwork(String),
    RemoveNetwork(String),
    CreateExec(String),
    StartExec(String),
    InspectExec(String),
}

/// A container held by the fake runtime
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: ContainerState,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug)]
struct FakeExec {
    container: String,
    exit_code: Option<i64>,
}

#[derive(Debug, Default)]
struct FakeState {
    images: HashSet<String>,
    unpullable: HashSet<String>,
    /// Remaining failing builds per image tag
    build_failures: HashMap<String, u32>,
    /// Container names whose creation fails with an API error
    failing_creates: HashSet<String>,
    containers: Vec<FakeContainer>,
    networks: Vec<NetworkSummary>,
    /// Exit codes handed out to successive exec runs; empty means success,
    /// `None` means the daemon reports no code
    exec_exit_codes: VecDeque<Option<i64>>,
    execs: HashMap<String, FakeExec>,
    calls: Vec<Call>,
}

impl FakeState {
    fn container_name(&self, id: &str) -> String {
        self.containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn container_mut(&mut self, id: &str) -> RuntimeResult<&mut FakeContainer> {
        self.containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id)))
    }
}

/// Fake runtime that keeps all state in memory
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Images already present locally
    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .get_mut()
            .images
            .extend(images.into_iter().map(Into::into));
        self
    }

    /// Pulls of this image fail
    pub fn with_unpullable(mut self, image: impl Into<String>) -> Self {
        self.state.get_mut().unpullable.insert(image.into());
        self
    }

    /// The next `count` builds of this tag fail
    pub fn with_build_failures(mut self, tag: impl Into<String>, count: u32) -> Self {
        self.state.get_mut().build_failures.insert(tag.into(), count);
        self
    }

    /// Creating a container with this name fails with an API error
    pub fn with_failing_create(mut self, name: impl Into<String>) -> Self {
        self.state.get_mut().failing_creates.insert(name.into());
        self
    }

    /// Exit codes returned by successive exec runs, then 0
    pub fn with_exec_exit_codes(self, codes: impl IntoIterator<Item = i64>) -> Self {
        self.with_exec_results(codes.into_iter().map(Some))
    }

    /// Exec inspection results, including missing exit codes, then 0
    pub fn with_exec_results(mut self, results: impl IntoIterator<Item = Option<i64>>) -> Self {
        self.state.get_mut().exec_exit_codes.extend(results);
        self
    }

    /// A pre-existing network
    pub fn with_network(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.state.get_mut().networks.push(NetworkSummary {
            id: format!("net-{}", Uuid::new_v4()),
            name,
        });
        self
    }

    /// A pre-existing container in the given state
    pub fn with_container(mut self, spec: ContainerSpec, state: ContainerState) -> Self {
        self.state.get_mut().containers.push(FakeContainer {
            id: format!("fake-{}", Uuid::new_v4()),
            restart_policy: spec.restart_policy,
            spec,
            state,
        });
        self
    }

    /// Every call made so far
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state
            .lock()
            .await
            .containers
            .iter()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub async fn container_count(&self) -> usize {
        self.state.lock().await.containers.len()
    }

    pub async fn network_count(&self) -> usize {
        self.state.lock().await.networks.len()
    }

    pub async fn has_image(&self, image: &str) -> bool {
        self.state.lock().await.images.contains(image)
    }

    /// Change a container's state behind the reconciler's back
    pub async fn set_container_state(&self, name: &str, state: ContainerState) {
        let mut guard = self.state.lock().await;
        if let Some(container) = guard.containers.iter_mut().find(|c| c.spec.name == name) {
            container.state = state;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn inspect_image(&self, image: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::InspectImage(image.to_string()));
        if state.images.contains(image) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("No such image: {}", image)))
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::PullImage(image.to_string()));
        if state.unpullable.contains(image) {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "pull access denied".to_string(),
            });
        }
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn build_image(&self, spec: &BuildSpec, sink: &dyn OutputSink) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::BuildImage(spec.tag.clone()));
        sink.line(&format!("Step 1/1 : FROM {}", spec.dockerfile));

        if let Some(remaining) = state.build_failures.get_mut(&spec.tag) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RuntimeError::BuildFailed {
                    image: spec.tag.clone(),
                    reason: "The command returned a non-zero code: 1".to_string(),
                });
            }
        }

        state.images.insert(spec.tag.clone());
        Ok(())
    }

    async fn list_containers(&self) -> RuntimeResult<Vec<ContainerSummary>> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::ListContainers);
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.spec.name)],
                state: c.state,
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::CreateContainer(spec.name.clone()));

        if state.failing_creates.contains(&spec.name) {
            return Err(RuntimeError::Api(format!("cannot create {}", spec.name)));
        }
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        if !state.images.contains(&spec.image) {
            return Err(RuntimeError::NotFound(format!("No such image: {}", spec.image)));
        }

        let id = format!("fake-{}", Uuid::new_v4());
        debug!(container = %spec.name, id = %id, "FakeRuntime: created container");
        state.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: ContainerState::Created,
            restart_policy: spec.restart_policy,
        });
        Ok(id)
    }

    async fn update_restart_policy(&self, id: &str, policy: RestartPolicy) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let name = state.container_name(id);
        state.calls.push(Call::UpdateRestartPolicy(name));
        state.container_mut(id)?.restart_policy = policy;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let name = state.container_name(id);
        state.calls.push(Call::StartContainer(name));
        state.container_mut(id)?.state = ContainerState::Running;
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let name = state.container_name(id);
        state.calls.push(Call::StopContainer(name));
        state.container_mut(id)?.state = ContainerState::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let name = state.container_name(id);
        state.calls.push(Call::RemoveContainer(name));
        state.container_mut(id)?;
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn list_networks(&self) -> RuntimeResult<Vec<NetworkSummary>> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::ListNetworks);
        Ok(state.networks.clone())
    }

    async fn create_network(&self, name: &str) -> RuntimeResult<String> {
        let mut state = self.state.lock().await;
        state.calls.push(Call::CreateNetwork(name.to_string()));
        let id = format!("net-{}", Uuid::new_v4());
        state.networks.push(NetworkSummary {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn remove_network(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let name = state
            .networks
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.name.clone())
            .ok_or_else(|| RuntimeError::NotFound(format!("No such network: {}", id)))?;
        state.calls.push(Call::RemoveNetwork(name));
        state.networks.retain(|n| n.id != id);
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, cmd: &[String]) -> RuntimeResult<String> {
        let mut state = self.state.lock().await;
        let name = state.container_name(container_id);
        state.calls.push(Call::CreateExec(name.clone()));

        let container = state.container_mut(container_id)?;
        if !container.state.is_running() {
            return Err(RuntimeError::Api(format!("Container {} is not running", name)));
        }

        let id = format!("exec-{}", Uuid::new_v4());
        debug!(container = %name, cmd = ?cmd, "FakeRuntime: created exec");
        state.execs.insert(
            id.clone(),
            FakeExec {
                container: name,
                exit_code: None,
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, sink: &dyn OutputSink) -> RuntimeResult<()> {
        let mut state = self.state.lock().await;
        let exit_code = state.exec_exit_codes.pop_front().unwrap_or(Some(0));
        let exec = state
            .execs
            .get_mut(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(format!("No such exec instance: {}", exec_id)))?;
        exec.exit_code = exit_code;
        let container = exec.container.clone();

        sink.line(&format!("PLAY [provision {}]", container));
        state.calls.push(Call::StartExec(container));
        Ok(())
    }

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<Option<i64>> {
        let mut state = self.state.lock().await;
        let (container, exit_code) = state
            .execs
            .get(exec_id)
            .map(|e| (e.container.clone(), e.exit_code))
            .ok_or_else(|| RuntimeError::NotFound(format!("No such exec instance: {}", exec_id)))?;
        state.calls.push(Call::InspectExec(container));
        Ok(exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let runtime = FakeRuntime::new().with_images(["mongo:latest"]);

        let id = runtime
            .create_container(&spec("db", "mongo:latest"))
            .await
            .unwrap();
        runtime.start_container(&id).await.unwrap();
        assert_eq!(runtime.container("db").await.unwrap().state, ContainerState::Running);

        runtime.stop_container(&id).await.unwrap();
        assert_eq!(runtime.container("db").await.unwrap().state, ContainerState::Exited);

        runtime.remove_container(&id).await.unwrap();
        assert_eq!(runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let runtime = FakeRuntime::new().with_images(["mongo:latest"]);
        runtime.create_container(&spec("db", "mongo:latest")).await.unwrap();
        let err = runtime
            .create_container(&spec("db", "mongo:latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Api(_)));
        assert_eq!(runtime.container_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_image_is_not_found() {
        let runtime = FakeRuntime::new().with_unpullable("private/app");
        assert!(matches!(
            runtime.inspect_image("private/app").await,
            Err(RuntimeError::NotFound(_))
        ));
        assert!(matches!(
            runtime.pull_image("private/app").await,
            Err(RuntimeError::PullFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_scripted_exec_exit_codes() {
        let runtime = FakeRuntime::new()
            .with_images(["app"])
            .with_exec_exit_codes([2]);
        let id = runtime.create_container(&spec("app", "app")).await.unwrap();
        runtime.start_container(&id).await.unwrap();

        let sink = |_: &str| {};
        let cmd = vec!["true".to_string()];

        let first = runtime.create_exec(&id, &cmd).await.unwrap();
        runtime.start_exec(&first, &sink).await.unwrap();
        assert_eq!(runtime.inspect_exec(&first).await.unwrap(), Some(2));

        let second = runtime.create_exec(&id, &cmd).await.unwrap();
        runtime.start_exec(&second, &sink).await.unwrap();
        assert_eq!(runtime.inspect_exec(&second).await.unwrap(), Some(0));
    }
}
