//! Podman backend. Entities run on the default network.

use crate::container::ContainerCli;
use crate::{Driver, DriverError, RunOutput, RunSpec};
use async_trait::async_trait;
use std::path::Path;
use tracing::{info, warn};

pub struct PodmanDriver {
    cli: ContainerCli,
}

impl PodmanDriver {
    pub fn new() -> Self {
        Self {
            cli: ContainerCli::new("podman"),
        }
    }
}

impl Default for PodmanDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for PodmanDriver {
    async fn prepare(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn has_image(&self, name: &str) -> Result<bool, DriverError> {
        self.cli.has_image(name).await
    }

    async fn build(&self, name: &str, path: &Path) -> Result<(), DriverError> {
        self.cli.build(name, path).await
    }

    async fn pull(&self, name: &str) -> Result<(), DriverError> {
        self.cli.pull(name).await
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, DriverError> {
        self.cli.run(spec, None).await?;

        let address = if spec.skip_address_wait {
            String::new()
        } else {
            self.cli.address(&spec.name).await?
        };
        info!(entity = %spec.name, address = %address, "Started");

        Ok(RunOutput {
            address,
            ports: spec.ports.clone(),
        })
    }

    async fn stop(&self, name: &str) -> Result<(), DriverError> {
        self.cli.stop(name).await
    }

    async fn download(&self, name: &str, remote: &str, local: &Path) -> Result<(), DriverError> {
        self.cli.download(name, remote, local).await
    }

    async fn peek(&self, name: &str, remote: &str) -> Result<String, DriverError> {
        self.cli.peek(name, remote).await
    }

    async fn upload(&self, name: &str, local: &Path, remote: &str) -> Result<(), DriverError> {
        self.cli.upload(name, local, remote).await
    }

    async fn cleanup(&self, image_prefix: &str) -> Result<(), DriverError> {
        let names = self.cli.managed_containers(image_prefix).await?;
        let failures = self.stop_many(&names).await;
        if failures > 0 {
            warn!(failures, "Some containers could not be stopped");
        }
        info!(count = names.len() - failures, "Removed containers");
        Ok(())
    }
}
