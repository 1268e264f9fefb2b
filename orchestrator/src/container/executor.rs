//! Provisioning inside the application container

use tracing::{debug, error, info};

use crate::error::{DeployError, Result};
use crate::runtime::{ContainerRuntime, OutputSink};

/// Runs the provisioning command in a running container
pub struct ProvisionExecutor<'a> {
    runtime: &'a dyn ContainerRuntime,
    command: &'a [String],
    sink: &'a dyn OutputSink,
}

impl<'a> ProvisionExecutor<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        command: &'a [String],
        sink: &'a dyn OutputSink,
    ) -> Self {
        Self {
            runtime,
            command,
            sink,
        }
    }

    /// Run one attempt and return its exit code. An exec the daemon reports
    /// without an exit code counts as exit 0.
    async fn attempt(&self, container_id: &str) -> Result<i64> {
        let exec_id = self.runtime.create_exec(container_id, self.command).await?;
        debug!(exec_id = %exec_id, "Provisioning exec created");

        self.runtime.start_exec(&exec_id, self.sink).await?;

        match self.runtime.inspect_exec(&exec_id).await? {
            Some(exit_code) => Ok(exit_code),
            None => {
                debug!(exec_id = %exec_id, "No exit code reported");
                Ok(0)
            }
        }
    }

    /// Provision until the command exits 0. Returns the number of attempts.
    ///
    /// Without `retry` the first non-zero exit is fatal.
    pub async fn provision(&self, container_id: &str, retry: bool) -> Result<u32> {
        let mut tries = 1;
        loop {
            info!(container_id = %container_id, attempt = tries, "Provisioning");

            let exit_code = self.attempt(container_id).await?;
            if exit_code == 0 {
                info!(attempts = tries, "Provisioning complete");
                return Ok(tries);
            }

            error!(exit_code = exit_code, attempt = tries, "Error provisioning (try {})", tries);
            if !retry {
                return Err(DeployError::ProvisionFailed { attempts: tries });
            }
            tries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerSpec, ContainerState};
    use crate::runtime::fake::{Call, FakeRuntime};
    use std::sync::Mutex;

    async fn running_app(runtime: FakeRuntime) -> (FakeRuntime, String) {
        let runtime = runtime.with_container(
            ContainerSpec {
                name: "histomicstk_histomicstk".to_string(),
                image: "dsarchive/histomicstk_main".to_string(),
                ..Default::default()
            },
            ContainerState::Running,
        );
        let id = runtime.container("histomicstk_histomicstk").await.unwrap().id;
        (runtime, id)
    }

    fn command() -> Vec<String> {
        vec!["bash".to_string(), "-c".to_string(), "true".to_string()]
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let (runtime, id) = running_app(FakeRuntime::new()).await;
        let command = command();
        let lines = Mutex::new(Vec::new());
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
        let executor = ProvisionExecutor::new(&runtime, &command, &sink);

        assert_eq!(executor.provision(&id, false).await.unwrap(), 1);
        assert!(!lines.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_until_zero_exit() {
        let (runtime, id) = running_app(FakeRuntime::new().with_exec_exit_codes([2, 2])).await;
        let command = command();
        let sink = |_: &str| {};
        let executor = ProvisionExecutor::new(&runtime, &command, &sink);

        assert_eq!(executor.provision(&id, true).await.unwrap(), 3);
        let execs = runtime
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::CreateExec(_)))
            .count();
        assert_eq!(execs, 3);
    }

    #[tokio::test]
    async fn test_missing_exit_code_counts_as_success() {
        let (runtime, id) = running_app(FakeRuntime::new().with_exec_results([None])).await;
        let command = command();
        let sink = |_: &str| {};
        let executor = ProvisionExecutor::new(&runtime, &command, &sink);

        assert_eq!(executor.provision(&id, true).await.unwrap(), 1);
        assert_eq!(executor.provision(&id, false).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_exit_code_after_failure() {
        let (runtime, id) =
            running_app(FakeRuntime::new().with_exec_results([Some(1), None])).await;
        let command = command();
        let sink = |_: &str| {};
        let executor = ProvisionExecutor::new(&runtime, &command, &sink);

        assert_eq!(executor.provision(&id, true).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failure_without_retry() {
        let (runtime, id) = running_app(FakeRuntime::new().with_exec_exit_codes([1])).await;
        let command = command();
        let sink = |_: &str| {};
        let executor = ProvisionExecutor::new(&runtime, &command, &sink);

        let err = executor.provision(&id, false).await.unwrap_err();
        assert!(matches!(err, DeployError::ProvisionFailed { attempts: 1 }));
    }
}
