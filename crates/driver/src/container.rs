//! Command dialect shared by the Docker and Podman command line clients.

use crate::archive;
use crate::command::Invocation;
use crate::error::ok_if_missing;
use crate::{is_managed_image, DriverError, RunSpec};
use std::path::Path;
use tracing::info;

/// A Docker-compatible runtime CLI.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ContainerCli {
    program: &'static str,
}

impl ContainerCli {
    pub(crate) const fn new(program: &'static str) -> Self {
        Self { program }
    }

    fn invoke<I, S>(&self, args: I) -> Invocation<'static>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(self.program, args)
    }

    pub(crate) async fn has_image(&self, name: &str) -> Result<bool, DriverError> {
        match self
            .invoke(["image", "inspect", name])
            .subject(name)
            .run()
            .await
        {
            Ok(()) => Ok(true),
            Err(DriverError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn build(&self, name: &str, path: &Path) -> Result<(), DriverError> {
        let path = path.display().to_string();
        self.invoke(["build", "--rm", "--no-cache", "-t", name, path.as_str()])
            .subject(name)
            .run()
            .await
    }

    pub(crate) async fn pull(&self, name: &str) -> Result<(), DriverError> {
        self.invoke(["pull", name]).subject(name).run().await
    }

    pub(crate) async fn network_exists(&self, network: &str) -> Result<bool, DriverError> {
        match self
            .invoke(["network", "inspect", network])
            .subject(network)
            .run()
            .await
        {
            Ok(()) => Ok(true),
            Err(DriverError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn create_network(&self, network: &str) -> Result<(), DriverError> {
        match self
            .invoke(["network", "create", "--driver", "bridge", network])
            .subject(network)
            .run()
            .await
        {
            Err(DriverError::NameCollision(_)) => Ok(()),
            other => other,
        }
    }

    pub(crate) async fn remove_network(&self, network: &str) -> Result<(), DriverError> {
        ok_if_missing(
            self.invoke(["network", "rm", network])
                .subject(network)
                .run()
                .await,
        )
    }

    /// Launch a detached, self-removing container.
    pub(crate) async fn run(&self, spec: &RunSpec, network: Option<&str>) -> Result<(), DriverError> {
        self.invoke(run_args(spec, network))
            .subject(spec.name.as_str())
            .run()
            .await
    }

    /// Address of the container on its network(s).
    pub(crate) async fn address(&self, name: &str) -> Result<String, DriverError> {
        self.invoke([
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            name,
        ])
        .subject(name)
        .text()
        .await
    }

    pub(crate) async fn stop(&self, name: &str) -> Result<(), DriverError> {
        ok_if_missing(self.invoke(["stop", name]).subject(name).run().await)?;
        info!(entity = %name, "Stopped");
        Ok(())
    }

    async fn archive_of(&self, name: &str, remote: &str) -> Result<Vec<u8>, DriverError> {
        self.invoke(["cp".to_string(), format!("{name}:{remote}"), "-".to_string()])
            .subject(name)
            .output()
            .await
    }

    pub(crate) async fn download(
        &self,
        name: &str,
        remote: &str,
        local: &Path,
    ) -> Result<(), DriverError> {
        let bytes = self.archive_of(name, remote).await?;
        archive::unpack(&bytes, local)
    }

    pub(crate) async fn peek(&self, name: &str, remote: &str) -> Result<String, DriverError> {
        let bytes = self.archive_of(name, remote).await?;
        archive::first_file(&bytes, name)
    }

    pub(crate) async fn upload(
        &self,
        name: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), DriverError> {
        let (dir, file) = archive::split_remote(remote);
        let bytes = archive::pack_file(local, file)?;
        self.invoke(["cp".to_string(), "-".to_string(), format!("{name}:{dir}")])
            .subject(name)
            .stdin(bytes)
            .run()
            .await
    }

    /// Names of running containers created from managed images.
    pub(crate) async fn managed_containers(
        &self,
        image_prefix: &str,
    ) -> Result<Vec<String>, DriverError> {
        let listing = self
            .invoke(["ps", "--format", "{{.Names}}\t{{.Image}}"])
            .text()
            .await?;
        Ok(parse_managed(&listing, image_prefix))
    }
}

/// Arguments of `run` for one container.
pub(crate) fn run_args(spec: &RunSpec, network: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--hostname".to_string(),
        spec.name.clone(),
    ];
    if let Some(network) = network {
        args.push("--network".to_string());
        args.push(network.to_string());
    }
    for (container_port, host_port) in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{host_port}:{container_port}"));
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("--cpus".to_string());
    args.push(spec.resources.cpu.to_string());
    args.push("--memory".to_string());
    args.push(format!("{}m", spec.resources.memory_mib));
    args.push(spec.image.clone());
    args
}

/// Parse `ps` output of `name<TAB>image` lines.
fn parse_managed(listing: &str, image_prefix: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, image)| is_managed_image(image.trim(), image_prefix))
        .map(|(name, _)| name.trim().to_string())
        .collect()
}
