//! Stack reconciliation
//!
//! [`Reconciler`] brings the four services of the stack to the requested state.
//! Every decision is made from what the runtime reports at the moment of the
//! check; nothing is cached across runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::models::{
    Bind, BuildOutcome, ContainerSpec, ContainerSummary, DatabaseStorage, Link, RestartPolicy,
    ServiceDescriptor, ServiceKey, ServiceStatus, StackStatus, StartOptions, StartReport,
    StopOptions,
};
use crate::network::NetworkManager;
use crate::paths;
use crate::runtime::{ContainerRuntime, OutputSink};
use crate::services::ServiceTable;

use super::executor::ProvisionExecutor;
use super::image::ImageManager;

/// Port the application listens on inside its container
const APPLICATION_PORT: u16 = 8080;

const DOCKER_BINARY: &str = "/usr/bin/docker";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Reconciler parameters that do not change between runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Shared network the containers join
    pub network_name: String,
    /// Directory holding the build files
    pub build_context: PathBuf,
    /// Command executed in the application container to provision it
    pub provision_command: Vec<String>,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            network_name: "histomicstk".to_string(),
            build_context: PathBuf::from("."),
            provision_command: default_provision_command(),
        }
    }
}

pub fn default_provision_command() -> Vec<String> {
    vec![
        "bash".to_string(),
        "-c".to_string(),
        "cd /home/ubuntu/HistomicsTK/ansible && ansible-playbook -i inventory/local \
         docker_ansible.yml --extra-vars=docker=provision"
            .to_string(),
    ]
}

/// What `start` found for a service
enum Target {
    Existing(ContainerSummary),
    Create(ContainerSpec),
}

/// A service container after `start` has looked at it
struct Launched {
    id: String,
    created: bool,
}

/// Drives the stack towards the started or stopped state
pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    services: ServiceTable,
    settings: ReconcilerSettings,
    sink: Arc<dyn OutputSink>,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        services: ServiceTable,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            runtime,
            services,
            settings,
            sink: Arc::new(|line: &str| println!("{}", line)),
        }
    }

    /// Send streamed build and provisioning output somewhere other than stdout
    pub fn with_output(mut self, sink: impl OutputSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    fn images(&self) -> ImageManager<'_> {
        ImageManager::new(
            self.runtime.as_ref(),
            &self.settings.build_context,
            self.sink.as_ref(),
        )
    }

    fn networks(&self) -> NetworkManager<'_> {
        NetworkManager::new(self.runtime.as_ref())
    }

    /// Find the service's container by name
    async fn find_container(&self, descriptor: &ServiceDescriptor) -> Result<Option<ContainerSummary>> {
        let containers = self.runtime.list_containers().await?;
        Ok(containers
            .into_iter()
            .find(|c| c.has_name(&descriptor.container_name)))
    }

    /// Acquire the service's image and look up its container
    async fn prepare(&self, descriptor: &ServiceDescriptor, retry: bool) -> Result<Option<ContainerSummary>> {
        self.images().acquire(descriptor, retry).await?;
        self.find_container(descriptor).await
    }

    /// Common container settings for a service
    fn base_spec(&self, descriptor: &ServiceDescriptor) -> ContainerSpec {
        ContainerSpec {
            name: descriptor.container_name.clone(),
            image: descriptor.image.clone(),
            hostname: descriptor.key.as_str().to_string(),
            restart_policy: RestartPolicy::Always,
            network: self.settings.network_name.clone(),
            aliases: vec![descriptor.key.as_str().to_string()],
            ..Default::default()
        }
    }

    fn link_to(&self, key: ServiceKey) -> Link {
        Link {
            container: self.services.get(key).container_name.clone(),
            alias: key.as_str().to_string(),
        }
    }

    fn queue_spec(&self) -> ContainerSpec {
        self.base_spec(self.services.get(ServiceKey::Queue))
    }

    fn database_spec(&self, storage: Option<&Path>) -> ContainerSpec {
        let mut spec = self.base_spec(self.services.get(ServiceKey::Database));
        if let Some(path) = storage {
            spec.binds.push(Bind::read_write(path.to_string_lossy(), "/data/db"));
        }
        spec
    }

    fn worker_spec(
        &self,
        env: &BTreeMap<String, String>,
        logs: &Path,
        links: Vec<Link>,
    ) -> ContainerSpec {
        ContainerSpec {
            env: env.clone(),
            privileged: true,
            links,
            binds: vec![
                Bind::read_write(logs.to_string_lossy(), "/opt/logs"),
                Bind::new(DOCKER_BINARY, DOCKER_BINARY),
                Bind::new(DOCKER_SOCKET, DOCKER_SOCKET),
            ],
            ..self.base_spec(self.services.get(ServiceKey::Worker))
        }
    }

    fn application_spec(
        &self,
        env: &BTreeMap<String, String>,
        logs: &Path,
        assetstore: &Path,
        links: Vec<Link>,
        port: u16,
    ) -> ContainerSpec {
        ContainerSpec {
            env: env.clone(),
            privileged: true,
            links,
            port_bindings: BTreeMap::from([(APPLICATION_PORT, port)]),
            binds: vec![
                Bind::read_write(logs.to_string_lossy(), "/opt/logs"),
                Bind::read_write(logs.to_string_lossy(), "/opt/histomicstk/logs"),
                Bind::read_write(assetstore.to_string_lossy(), "/opt/histomicstk/assetstore"),
                Bind::new(DOCKER_BINARY, DOCKER_BINARY),
                Bind::new(DOCKER_SOCKET, DOCKER_SOCKET),
            ],
            ..self.base_spec(self.services.get(ServiceKey::Application))
        }
    }

    /// Create a container with restart policy "always"
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        info!(image = %spec.image, container = %spec.name, "Creating {} - {}", spec.image, spec.name);
        let id = self.runtime.create_container(spec).await?;
        self.runtime
            .update_restart_policy(&id, RestartPolicy::Always)
            .await?;
        Ok(id)
    }

    /// Create the container if needed, then start it unless already running
    async fn launch(&self, key: ServiceKey, target: Target, report: &mut StartReport) -> Result<Launched> {
        let descriptor = self.services.get(key);
        let launched = match target {
            Target::Existing(container) if container.state.is_running() => {
                debug!(service = %key, container = %descriptor.container_name, "Already running");
                return Ok(Launched {
                    id: container.id,
                    created: false,
                });
            }
            Target::Existing(container) => Launched {
                id: container.id,
                created: false,
            },
            Target::Create(spec) => {
                let id = self.create(&spec).await?;
                report.created.push(key);
                Launched { id, created: true }
            }
        };

        info!(image = %descriptor.image, container = %descriptor.container_name, "Starting {} - {}", descriptor.image, descriptor.container_name);
        self.runtime.start_container(&launched.id).await?;
        report.started.push(key);
        Ok(launched)
    }

    /// Bring every service up in dependency order, then provision if needed
    pub async fn start(&self, options: &StartOptions) -> Result<StartReport> {
        let mut report = StartReport::default();
        self.networks().ensure(&self.settings.network_name).await?;

        let mut env = BTreeMap::new();
        let mut worker_links = Vec::new();
        let mut application_links = Vec::new();

        match options.rmq.host_indicator() {
            None => {
                let descriptor = self.services.get(ServiceKey::Queue);
                let target = match self.prepare(descriptor, options.retry).await? {
                    Some(container) => Target::Existing(container),
                    None => Target::Create(self.queue_spec()),
                };
                self.launch(ServiceKey::Queue, target, &mut report).await?;
                worker_links.push(self.link_to(ServiceKey::Queue));
                application_links.push(self.link_to(ServiceKey::Queue));
            }
            Some(indicator) => {
                debug!(mode = %options.rmq, "Using message queue outside the stack");
                env.insert("HOST_RMQ".to_string(), indicator);
            }
        }

        match options.mongo.host_indicator() {
            None => {
                let descriptor = self.services.get(ServiceKey::Database);
                let target = match (self.prepare(descriptor, options.retry).await?, &options.db) {
                    (Some(container), _) => Target::Existing(container),
                    (None, DatabaseStorage::Managed) => Target::Create(self.database_spec(None)),
                    (None, DatabaseStorage::HostPath(path)) => {
                        let path = paths::resolve_dir(path).await?;
                        Target::Create(self.database_spec(Some(&path)))
                    }
                };
                self.launch(ServiceKey::Database, target, &mut report).await?;
                application_links.push(self.link_to(ServiceKey::Database));
            }
            Some(indicator) => {
                debug!(mode = %options.mongo, "Using database outside the stack");
                env.insert("HOST_MONGO".to_string(), indicator);
            }
        }

        let descriptor = self.services.get(ServiceKey::Worker);
        let target = match self.prepare(descriptor, options.retry).await? {
            Some(container) => Target::Existing(container),
            None => {
                let logs = paths::resolve_dir(&options.logs).await?;
                Target::Create(self.worker_spec(&env, &logs, worker_links))
            }
        };
        self.launch(ServiceKey::Worker, target, &mut report).await?;

        let descriptor = self.services.get(ServiceKey::Application);
        let target = match self.prepare(descriptor, options.retry).await? {
            Some(container) => Target::Existing(container),
            None => {
                let logs = paths::resolve_dir(&options.logs).await?;
                let assetstore = paths::resolve_dir(&options.assetstore).await?;
                Target::Create(self.application_spec(
                    &env,
                    &logs,
                    &assetstore,
                    application_links,
                    options.port,
                ))
            }
        };
        let application = self
            .launch(ServiceKey::Application, target, &mut report)
            .await?;

        if application.created || options.provision {
            let executor = ProvisionExecutor::new(
                self.runtime.as_ref(),
                &self.settings.provision_command,
                self.sink.as_ref(),
            );
            let attempts = executor.provision(&application.id, options.retry).await?;
            report.provision_attempts = Some(attempts);
        }

        Ok(report)
    }

    /// Stop services in reverse dependency order, optionally removing them
    /// and the shared network
    pub async fn stop(&self, options: &StopOptions) -> Result<()> {
        for descriptor in self.services.iter().rev() {
            let Some(container) = self.find_container(descriptor).await? else {
                debug!(service = %descriptor.key, "No container");
                continue;
            };

            if !container.state.is_stopped() {
                info!(service = %descriptor.key, container = %descriptor.container_name, "Stopping {}", descriptor.key);
                self.runtime.stop_container(&container.id).await?;
            }

            if options.remove {
                info!(service = %descriptor.key, container = %descriptor.container_name, "Removing {}", descriptor.key);
                self.runtime.remove_container(&container.id).await?;
            }
        }

        if options.remove {
            self.networks().remove(&self.settings.network_name).await?;
        }

        Ok(())
    }

    /// Build buildable images, restricted to `names` when given
    pub async fn build(&self, names: Option<&[ServiceKey]>, retry: bool) -> Result<Vec<BuildOutcome>> {
        let images = self.images();
        let mut outcomes = Vec::new();

        for descriptor in self.services.buildable() {
            if names.is_some_and(|names| !names.contains(&descriptor.key)) {
                continue;
            }
            outcomes.push(images.build(descriptor, retry).await?);
        }

        Ok(outcomes)
    }

    /// Read-only view of images, containers and the network
    pub async fn status(&self) -> Result<StackStatus> {
        let containers = self.runtime.list_containers().await?;
        let network_present = self
            .networks()
            .find(&self.settings.network_name)
            .await?
            .is_some();

        let images = self.images();
        let mut services = Vec::new();
        for descriptor in self.services.iter() {
            services.push(ServiceStatus {
                service: descriptor.key,
                image: descriptor.image.clone(),
                image_present: images.is_present(descriptor).await?,
                container_name: descriptor.container_name.clone(),
                container: containers
                    .iter()
                    .find(|c| c.has_name(&descriptor.container_name))
                    .cloned(),
            });
        }

        Ok(StackStatus {
            network: self.settings.network_name.clone(),
            network_present,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use crate::models::{ContainerState, DependencyMode};
    use crate::runtime::fake::{Call, FakeRuntime};
    use crate::runtime::RuntimeError;

    fn reconciler(runtime: &Arc<FakeRuntime>) -> Reconciler {
        Reconciler::new(
            runtime.clone(),
            ServiceTable::histomicstk(),
            ReconcilerSettings::default(),
        )
        .with_output(|_: &str| {})
    }

    fn options(dir: &tempfile::TempDir) -> StartOptions {
        StartOptions {
            db: DatabaseStorage::HostPath(dir.path().join("db")),
            logs: dir.path().join("logs"),
            assetstore: dir.path().join("assetstore"),
            ..StartOptions::default()
        }
    }

    fn existing(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|c| pred(c)).count()
    }

    #[tokio::test]
    async fn test_start_creates_all_embedded_services() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let report = reconciler(&runtime).start(&options(&dir)).await.unwrap();

        assert_eq!(report.created, ServiceKey::ALL.to_vec());
        assert_eq!(report.provision_attempts, Some(1));
        assert_eq!(runtime.container_count().await, 4);
        assert_eq!(runtime.network_count().await, 1);

        for name in [
            "histomicstk_rmq",
            "histomicstk_mongodb",
            "histomicstk_girder_worker",
            "histomicstk_histomicstk",
        ] {
            let container = runtime.container(name).await.unwrap();
            assert_eq!(container.state, ContainerState::Running);
            assert_eq!(container.restart_policy, RestartPolicy::Always);
            assert_eq!(container.spec.network, "histomicstk");
        }
    }

    #[tokio::test]
    async fn test_embedded_services_register_aliases_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        reconciler(&runtime).start(&options(&dir)).await.unwrap();

        let rmq = runtime.container("histomicstk_rmq").await.unwrap();
        assert_eq!(rmq.spec.aliases, vec!["rmq".to_string()]);
        assert_eq!(rmq.spec.hostname, "rmq");

        let app = runtime.container("histomicstk_histomicstk").await.unwrap();
        let links: Vec<String> = app.spec.links.iter().map(|l| l.to_string()).collect();
        assert_eq!(links, vec!["histomicstk_rmq:rmq", "histomicstk_mongodb:mongodb"]);
        assert!(app.spec.env.is_empty());

        let worker = runtime.container("histomicstk_girder_worker").await.unwrap();
        let links: Vec<String> = worker.spec.links.iter().map(|l| l.to_string()).collect();
        assert_eq!(links, vec!["histomicstk_rmq:rmq"]);
    }

    #[tokio::test]
    async fn test_database_storage_bind() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        reconciler(&runtime).start(&options(&dir)).await.unwrap();

        let db = runtime.container("histomicstk_mongodb").await.unwrap();
        assert_eq!(db.spec.binds.len(), 1);
        assert_eq!(db.spec.binds[0].target, "/data/db");
        assert!(dir.path().join("db").is_dir());
    }

    #[tokio::test]
    async fn test_managed_database_storage_has_no_bind() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let options = StartOptions {
            db: DatabaseStorage::Managed,
            ..options(&dir)
        };
        reconciler(&runtime).start(&options).await.unwrap();

        let db = runtime.container("histomicstk_mongodb").await.unwrap();
        assert!(db.spec.binds.is_empty());
        assert!(!dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_host_database_sets_indicator() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let options = StartOptions {
            mongo: DependencyMode::Host,
            ..options(&dir)
        };
        let report = reconciler(&runtime).start(&options).await.unwrap();

        assert!(!report.created.contains(&ServiceKey::Database));
        assert!(runtime.container("histomicstk_mongodb").await.is_none());

        let app = runtime.container("histomicstk_histomicstk").await.unwrap();
        assert_eq!(app.spec.env.get("HOST_MONGO").map(String::as_str), Some("true"));
        assert!(app.spec.links.iter().all(|l| l.alias != "mongodb"));
        assert!(!runtime
            .calls()
            .await
            .contains(&Call::InspectImage("mongo:latest".into())));
    }

    #[tokio::test]
    async fn test_external_queue_address_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let options = StartOptions {
            rmq: DependencyMode::External("10.1.2.3".to_string()),
            ..options(&dir)
        };
        reconciler(&runtime).start(&options).await.unwrap();

        let worker = runtime.container("histomicstk_girder_worker").await.unwrap();
        assert_eq!(worker.spec.env.get("HOST_RMQ").map(String::as_str), Some("10.1.2.3"));
        assert!(worker.spec.links.is_empty());
    }

    #[tokio::test]
    async fn test_existing_application_skips_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_container(
            existing("histomicstk_histomicstk", "dsarchive/histomicstk_main"),
            ContainerState::Exited,
        ));
        let report = reconciler(&runtime).start(&options(&dir)).await.unwrap();

        assert_eq!(report.provision_attempts, None);
        assert!(!report.created.contains(&ServiceKey::Application));
        assert!(report.started.contains(&ServiceKey::Application));
        let calls = runtime.calls().await;
        assert_eq!(count(&calls, |c| matches!(c, Call::CreateExec(_))), 0);
    }

    #[tokio::test]
    async fn test_existing_application_provisions_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_container(
            existing("histomicstk_histomicstk", "dsarchive/histomicstk_main"),
            ContainerState::Running,
        ));
        let options = StartOptions {
            provision: true,
            ..options(&dir)
        };
        let report = reconciler(&runtime).start(&options).await.unwrap();

        assert_eq!(report.provision_attempts, Some(1));
        // already running, so not started again
        assert!(!report.started.contains(&ServiceKey::Application));
    }

    #[tokio::test]
    async fn test_provisioning_retry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_exec_exit_codes([1, 1]));
        let options = StartOptions {
            retry: true,
            ..options(&dir)
        };
        let report = reconciler(&runtime).start(&options).await.unwrap();

        assert_eq!(report.provision_attempts, Some(3));
        let calls = runtime.calls().await;
        assert_eq!(count(&calls, |c| matches!(c, Call::StartExec(_))), 3);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_fatal_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_exec_exit_codes([1, 1]));
        let err = reconciler(&runtime).start(&options(&dir)).await.unwrap_err();

        assert!(matches!(err, DeployError::ProvisionFailed { attempts: 1 }));
        let calls = runtime.calls().await;
        assert_eq!(count(&calls, |c| matches!(c, Call::StartExec(_))), 1);
    }

    #[tokio::test]
    async fn test_runtime_error_halts_start() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new().with_failing_create("histomicstk_mongodb"));
        let err = reconciler(&runtime).start(&options(&dir)).await.unwrap_err();

        assert!(matches!(err, DeployError::Runtime(RuntimeError::Api(_))));
        // queue was created before the failure and is left in place
        assert!(runtime.container("histomicstk_rmq").await.is_some());
        assert!(runtime.container("histomicstk_girder_worker").await.is_none());
        let calls = runtime.calls().await;
        assert!(!calls.contains(&Call::InspectImage("dsarchive/girder_worker".into())));
    }

    #[tokio::test]
    async fn test_stop_leaves_stopped_containers_alone() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_container(existing("histomicstk_rmq", "rabbitmq:management"), ContainerState::Exited)
                .with_container(existing("histomicstk_mongodb", "mongo:latest"), ContainerState::Running),
        );
        reconciler(&runtime)
            .stop(&StopOptions { remove: false })
            .await
            .unwrap();

        let calls = runtime.calls().await;
        assert!(calls.contains(&Call::StopContainer("histomicstk_mongodb".into())));
        assert!(!calls.contains(&Call::StopContainer("histomicstk_rmq".into())));
        assert_eq!(runtime.container_count().await, 2);
        assert!(!calls.iter().any(|c| matches!(c, Call::PullImage(_) | Call::InspectImage(_))));
    }

    #[tokio::test]
    async fn test_remove_deletes_containers_and_network() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let reconciler = reconciler(&runtime);
        reconciler.start(&options(&dir)).await.unwrap();

        reconciler.stop(&StopOptions { remove: true }).await.unwrap();
        assert_eq!(runtime.container_count().await, 0);
        assert_eq!(runtime.network_count().await, 0);
    }

    #[tokio::test]
    async fn test_build_filters_by_name() {
        let runtime = Arc::new(FakeRuntime::new());
        let outcomes = reconciler(&runtime)
            .build(Some(&[ServiceKey::Worker, ServiceKey::Queue][..]), false)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].service, ServiceKey::Worker);
        assert_eq!(
            runtime.calls().await,
            vec![Call::BuildImage("dsarchive/girder_worker".into())]
        );
    }

    #[tokio::test]
    async fn test_build_all_stops_at_first_failure() {
        let runtime = Arc::new(FakeRuntime::new().with_build_failures("dsarchive/girder_worker", 1));
        let err = reconciler(&runtime).build(None, false).await.unwrap_err();

        assert!(matches!(err, DeployError::BuildFailed { service: ServiceKey::Worker, .. }));
        assert!(!runtime
            .calls()
            .await
            .contains(&Call::BuildImage("dsarchive/histomicstk_main".into())));
    }

    #[tokio::test]
    async fn test_status_reports_without_mutating() {
        let runtime = Arc::new(
            FakeRuntime::new()
                .with_images(["mongo:latest"])
                .with_network("histomicstk")
                .with_container(existing("histomicstk_mongodb", "mongo:latest"), ContainerState::Running),
        );
        let status = reconciler(&runtime).status().await.unwrap();

        assert!(status.network_present);
        assert_eq!(status.services.len(), 4);
        let db = &status.services[ServiceKey::Database.index()];
        assert!(db.image_present);
        assert_eq!(db.container.as_ref().map(|c| c.state), Some(ContainerState::Running));
        let queue = &status.services[ServiceKey::Queue.index()];
        assert!(!queue.image_present);
        assert!(queue.container.is_none());

        let calls = runtime.calls().await;
        assert!(calls.iter().all(|c| matches!(
            c,
            Call::ListContainers | Call::ListNetworks | Call::InspectImage(_)
        )));
    }
}
