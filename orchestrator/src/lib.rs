//! HistomicsTK orchestrator library
//!
//! This library deploys the HistomicsTK stack (message queue, database, task
//! worker and web application) as Docker containers on a shared network, and
//! tears it down again.

pub mod config;
pub mod container;
pub mod error;
pub mod logging;
pub mod models;
pub mod network;
pub mod paths;
pub mod runtime;
pub mod services;

pub use container::{Reconciler, ReconcilerSettings};
pub use error::{DeployError, Result};
pub use runtime::{ContainerRuntime, DockerRuntime, OutputSink, RuntimeError};
pub use services::ServiceTable;
