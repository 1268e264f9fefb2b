//! Container management for the HistomicsTK stack
//!
//! Handles all interactions with the service containers:
//! - Acquiring images by pull or local build
//! - Creating, starting, stopping and removing containers in dependency order
//! - Provisioning the application container

mod executor;
mod image;
mod manager;

pub use executor::ProvisionExecutor;
pub use image::ImageManager;
pub use manager::{default_provision_command, Reconciler, ReconcilerSettings};
