//! Docker backend.

use crate::container::ContainerCli;
use crate::{Driver, DriverError, RunOutput, RunSpec};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// Drives the `docker` CLI. All entities share one bridge network named after
/// the namespace.
pub struct DockerDriver {
    cli: ContainerCli,
    network: String,
    prepared: OnceCell<()>,
}

impl DockerDriver {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            cli: ContainerCli::new("docker"),
            network: network.into(),
            prepared: OnceCell::new(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }
}

#[async_trait]
impl Driver for DockerDriver {
    async fn prepare(&self) -> Result<(), DriverError> {
        self.prepared
            .get_or_try_init(|| async {
                if self.cli.network_exists(&self.network).await? {
                    info!(network = %self.network, "Reusing network");
                } else {
                    self.cli.create_network(&self.network).await?;
                    info!(network = %self.network, "Created network");
                }
                Ok::<(), DriverError>(())
            })
            .await?;
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
        self.cli.run(spec, Some(&self.network)).await?;

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

        self.cli.remove_network(&self.network).await?;
        info!(network = %self.network, "Removed network");
        Ok(())
    }
}
