//! Image acquisition and local builds

use std::path::Path;

use tracing::{error, info, warn};

use crate::error::{DeployError, Result};
use crate::models::{BuildOutcome, BuildSpec, ServiceDescriptor};
use crate::runtime::{ContainerRuntime, OutputSink, RuntimeError};

/// Makes sure service images are present, pulling or building them
pub struct ImageManager<'a> {
    runtime: &'a dyn ContainerRuntime,
    build_context: &'a Path,
    sink: &'a dyn OutputSink,
}

impl<'a> ImageManager<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        build_context: &'a Path,
        sink: &'a dyn OutputSink,
    ) -> Self {
        Self {
            runtime,
            build_context,
            sink,
        }
    }

    /// Whether the service's image is present locally
    pub async fn is_present(&self, descriptor: &ServiceDescriptor) -> Result<bool> {
        match self.runtime.inspect_image(&descriptor.image).await {
            Ok(()) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Ensure the service's image is present: inspect, then pull, then build.
    ///
    /// Only a missing image triggers a pull, and only a failed pull of an image
    /// that is built locally triggers a build.
    pub async fn acquire(&self, descriptor: &ServiceDescriptor, retry: bool) -> Result<()> {
        if self.is_present(descriptor).await? {
            return Ok(());
        }

        info!(service = %descriptor.key, image = %descriptor.image, "Pulling {}", descriptor.image);
        match self.runtime.pull_image(&descriptor.image).await {
            Ok(()) => Ok(()),
            Err(err @ (RuntimeError::NotFound(_) | RuntimeError::PullFailed { .. })) => {
                if !descriptor.builds_on_pull_failure() {
                    error!(image = %descriptor.image, error = %err, "Pull failed");
                    return Err(DeployError::ImageUnavailable {
                        image: descriptor.image.clone(),
                        reason: err.to_string(),
                    });
                }
                warn!(image = %descriptor.image, error = %err, "Pull failed, building locally");
                self.build(descriptor, retry).await.map(|_| ())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Build one service image. Without `retry` the first failure is fatal;
    /// with it, the build is attempted until it succeeds.
    pub async fn build(&self, descriptor: &ServiceDescriptor, retry: bool) -> Result<BuildOutcome> {
        let Some(dockerfile) = descriptor.dockerfile.as_ref() else {
            return Err(DeployError::ImageUnavailable {
                image: descriptor.image.clone(),
                reason: format!("{} has no build file", descriptor.key),
            });
        };

        let spec = BuildSpec {
            tag: descriptor.image.clone(),
            dockerfile: dockerfile.clone(),
            context: self.build_context.to_path_buf(),
        };

        let mut tries = 1;
        loop {
            if tries > 1 {
                info!(service = %descriptor.key, attempt = tries, "Building {} (try {})", descriptor.key, tries);
            } else {
                info!(service = %descriptor.key, dockerfile = %spec.dockerfile, "Building {}", descriptor.key);
            }

            match self.runtime.build_image(&spec, self.sink).await {
                Ok(()) => {
                    info!(service = %descriptor.key, attempts = tries, "Done building {}", descriptor.key);
                    return Ok(BuildOutcome {
                        service: descriptor.key,
                        attempts: tries,
                    });
                }
                Err(RuntimeError::BuildFailed { reason, .. }) => {
                    error!(service = %descriptor.key, attempt = tries, reason = %reason, "Error building {}", descriptor.key);
                    if !retry {
                        return Err(DeployError::BuildFailed {
                            service: descriptor.key,
                            reason,
                        });
                    }
                    tries += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
