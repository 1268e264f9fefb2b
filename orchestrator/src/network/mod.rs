//! Shared stack network management

use tracing::{debug, info};

use crate::runtime::{ContainerRuntime, RuntimeResult};

/// Ensures the stack network exists, or tears it down
pub struct NetworkManager<'a> {
    runtime: &'a dyn ContainerRuntime,
}

impl<'a> NetworkManager<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime) -> Self {
        Self { runtime }
    }

    /// Id of the named network, if present
    pub async fn find(&self, name: &str) -> RuntimeResult<Option<String>> {
        let networks = self.runtime.list_networks().await?;
        Ok(networks.into_iter().find(|n| n.name == name).map(|n| n.id))
    }

    /// Create the network unless one with this name already exists
    pub async fn ensure(&self, name: &str) -> RuntimeResult<String> {
        if let Some(id) = self.find(name).await? {
            debug!(network_name = %name, "Network already exists");
            return Ok(id);
        }

        let id = self.runtime.create_network(name).await?;
        info!(network_name = %name, network_id = %id, "Network created");
        Ok(id)
    }

    /// Remove the network if present. Returns whether anything was removed.
    pub async fn remove(&self, name: &str) -> RuntimeResult<bool> {
        let Some(id) = self.find(name).await? else {
            debug!(network_name = %name, "Network not present");
            return Ok(false);
        };

        self.runtime.remove_network(&id).await?;
        info!(network_name = %name, "Network removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{Call, FakeRuntime};

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let runtime = FakeRuntime::new();
        let networks = NetworkManager::new(&runtime);

        let first = networks.ensure("histomicstk").await.unwrap();
        let second = networks.ensure("histomicstk").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(runtime.network_count().await, 1);
        let creates = runtime
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::CreateNetwork(_)))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_remove_missing_network() {
        let runtime = FakeRuntime::new().with_network("bridge");
        let networks = NetworkManager::new(&runtime);

        assert!(!networks.remove("histomicstk").await.unwrap());
        assert_eq!(runtime.network_count().await, 1);
    }

    #[tokio::test]
    async fn test_remove_existing_network() {
        let runtime = FakeRuntime::new().with_network("histomicstk");
        let networks = NetworkManager::new(&runtime);

        assert!(networks.remove("histomicstk").await.unwrap());
        assert_eq!(runtime.network_count().await, 0);
    }
}
