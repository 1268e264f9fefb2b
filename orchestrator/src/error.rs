//! Deployment error types

use std::path::PathBuf;

use thiserror::Error;

use crate::models::ServiceKey;
use crate::runtime::RuntimeError;

pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors that end a reconciliation run
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("Image {image} is not available: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to build {service}: {reason}")]
    BuildFailed { service: ServiceKey, reason: String },

    #[error("Failed to provision (try {attempts})")]
    ProvisionFailed { attempts: u32 },

    #[error("Cannot prepare host path {path:?}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
