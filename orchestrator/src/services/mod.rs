//! Static service table
//!
//! The table is built once at startup (defaults, optionally overridden from the
//! configuration file) and handed to the reconciler. A `ServiceTable` always
//! holds exactly one descriptor per [`ServiceKey`], stored in dependency order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ServiceDescriptor, ServiceKey};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("service table is missing {0}")]
    Missing(ServiceKey),

    #[error("service table lists {0} more than once")]
    Duplicate(ServiceKey),

    #[error("service {key} has an empty {field}")]
    EmptyField { key: ServiceKey, field: &'static str },
}

/// Immutable descriptor table for the four services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ServiceDescriptor>", into = "Vec<ServiceDescriptor>")]
pub struct ServiceTable {
    services: Vec<ServiceDescriptor>,
}

impl ServiceTable {
    /// Validate and order a list of descriptors
    pub fn new(mut services: Vec<ServiceDescriptor>) -> Result<Self, TableError> {
        for key in ServiceKey::ALL {
            match services.iter().filter(|s| s.key == key).count() {
                0 => return Err(TableError::Missing(key)),
                1 => {}
                _ => return Err(TableError::Duplicate(key)),
            }
        }

        for service in &services {
            if service.image.trim().is_empty() {
                return Err(TableError::EmptyField { key: service.key, field: "image" });
            }
            if service.container_name.trim().is_empty() {
                return Err(TableError::EmptyField {
                    key: service.key,
                    field: "container_name",
                });
            }
        }

        services.sort_by_key(|s| s.key);
        Ok(Self { services })
    }

    /// The HistomicsTK deployment
    pub fn histomicstk() -> Self {
        Self {
            services: vec![
                ServiceDescriptor {
                    key: ServiceKey::Queue,
                    image: "rabbitmq:management".to_string(),
                    container_name: "histomicstk_rmq".to_string(),
                    dockerfile: None,
                    pull: true,
                },
                ServiceDescriptor {
                    key: ServiceKey::Database,
                    image: "mongo:latest".to_string(),
                    container_name: "histomicstk_mongodb".to_string(),
                    dockerfile: None,
                    pull: true,
                },
                ServiceDescriptor {
                    key: ServiceKey::Worker,
                    image: "dsarchive/girder_worker".to_string(),
                    container_name: "histomicstk_girder_worker".to_string(),
                    dockerfile: Some("Dockerfile-girder-worker".to_string()),
                    pull: false,
                },
                ServiceDescriptor {
                    key: ServiceKey::Application,
                    image: "dsarchive/histomicstk_main".to_string(),
                    container_name: "histomicstk_histomicstk".to_string(),
                    dockerfile: Some("Dockerfile-histomicstk".to_string()),
                    pull: false,
                },
            ],
        }
    }

    pub fn get(&self, key: ServiceKey) -> &ServiceDescriptor {
        // one entry per key, sorted by key
        &self.services[key.index()]
    }

    /// Descriptors in dependency order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ServiceDescriptor> {
        self.services.iter()
    }

    /// Descriptors that can be built locally, in dependency order
    pub fn buildable(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.iter().filter(|s| s.is_buildable())
    }
}

impl Default for ServiceTable {
    fn default() -> Self {
        Self::histomicstk()
    }
}

impl TryFrom<Vec<ServiceDescriptor>> for ServiceTable {
    type Error = TableError;

    fn try_from(services: Vec<ServiceDescriptor>) -> Result<Self, Self::Error> {
        Self::new(services)
    }
}

impl From<ServiceTable> for Vec<ServiceDescriptor> {
    fn from(table: ServiceTable) -> Self {
        table.services
    }
}
