//! Runtime drivers.
//!
//! The orchestrator talks to whichever container or pod runtime is in use
//! through the [`Driver`] trait only. Three backends are provided:
//!
//! - [`DockerDriver`]: Docker engine, one bridge network per run
//! - [`PodmanDriver`]: Podman, default network
//! - [`KubernetesDriver`]: one Pod plus one NodePort Service per entity,
//!   inside a dedicated (or reused) namespace
//!
//! All backends drive the runtime's command line client and exchange files
//! as tar streams.
//!
//! # Contract
//!
//! - `run` twice with the same name fails with [`DriverError::NameCollision`].
//! - `stop` of an unknown or already stopped entity succeeds.
//! - `peek` / `download` of a path that does not exist yet fails with
//!   [`DriverError::NotFound`], which callers treat as retryable.
//! - Shared resources (network, namespace) are created by [`Driver::prepare`],
//!   at most once per driver instance.

mod archive;
mod command;
mod container;
mod docker;
mod error;
mod kubernetes;
mod podman;

pub use docker::DockerDriver;
pub use error::DriverError;
pub use kubernetes::KubernetesDriver;
pub use podman::PodmanDriver;

use async_trait::async_trait;
use mixsim_types::Resources;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Ledger node image name.
pub const NODE_IMAGE: &str = "btc-node";

/// Mixing coordinator image name.
pub const COORDINATOR_IMAGE: &str = "wasabi-backend";

/// Wallet client image name (tagged by client version).
pub const CLIENT_IMAGE: &str = "wasabi-client";

/// Images whose instances belong to the orchestrator.
pub const MANAGED_IMAGES: [&str; 3] = [NODE_IMAGE, COORDINATOR_IMAGE, CLIENT_IMAGE];

/// Container port -> reachable host port.
pub type PortMap = BTreeMap<u16, u16>;

/// Whether an instance of `image` is owned by the orchestrator.
pub fn is_managed_image(image: &str, image_prefix: &str) -> bool {
    MANAGED_IMAGES.iter().any(|base| {
        let full = format!("{image_prefix}{base}");
        image == full
            || image
                .strip_prefix(full.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    })
}

/// Everything needed to launch one named instance.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Container port -> requested host port.
    pub ports: PortMap,
    pub resources: Resources,
    /// Do not wait for a routable address (the caller routes through a
    /// proxy instead).
    pub skip_address_wait: bool,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: BTreeMap::new(),
            ports: PortMap::new(),
            resources: Resources::new(0.1, 768),
            skip_address_wait: false,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publish `container_port` on `host_port`.
    pub fn with_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.insert(container_port, host_port);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_skip_address_wait(mut self, skip: bool) -> Self {
        self.skip_address_wait = skip;
        self
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    /// Address inside the runtime network (empty when not awaited).
    pub address: String,
    /// Container port -> port reachable from the control host.
    pub ports: PortMap,
}

/// Capability interface over a container or pod runtime.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create (or reuse) the shared network/namespace. Safe to call more than
    /// once; the resource is created at most once.
    async fn prepare(&self) -> Result<(), DriverError>;

    async fn has_image(&self, name: &str) -> Result<bool, DriverError>;

    async fn build(&self, name: &str, path: &Path) -> Result<(), DriverError>;

    async fn pull(&self, name: &str) -> Result<(), DriverError>;

    /// Launch a named instance. Never creates the shared resource itself:
    /// [`Driver::prepare`] must have succeeded first.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput, DriverError>;

    /// Stop an instance. Unknown or already stopped instances succeed.
    async fn stop(&self, name: &str) -> Result<(), DriverError>;

    /// Stop several instances concurrently. Returns the number of failures,
    /// each of which is logged.
    async fn stop_many(&self, names: &[String]) -> usize {
        let results =
            futures::future::join_all(names.iter().map(|name| async move {
                (name, self.stop(name).await)
            }))
            .await;

        let mut failures = 0;
        for (name, result) in results {
            if let Err(e) = result {
                warn!(entity = %name, error = %e, "Failed to stop entity");
                failures += 1;
            }
        }
        failures
    }

    /// Copy a remote file or directory into `local`.
    async fn download(&self, name: &str, remote: &str, local: &Path) -> Result<(), DriverError>;

    /// Read a remote file without downloading it to disk.
    async fn peek(&self, name: &str, remote: &str) -> Result<String, DriverError>;

    /// Copy a local file to `remote` inside the instance.
    async fn upload(&self, name: &str, local: &Path, remote: &str) -> Result<(), DriverError>;

    /// Remove every orchestrator-owned instance and the shared
    /// network/namespace.
    async fn cleanup(&self, image_prefix: &str) -> Result<(), DriverError>;
}

/// Available runtime backends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DriverKind {
    #[default]
    Docker,
    Podman,
    Kubernetes,
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(DriverKind::Docker),
            "podman" => Ok(DriverKind::Podman),
            "kubernetes" | "k8s" => Ok(DriverKind::Kubernetes),
            other => Err(format!("Unknown driver: {other}")),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverKind::Docker => "docker",
            DriverKind::Podman => "podman",
            DriverKind::Kubernetes => "kubernetes",
        };
        f.write_str(name)
    }
}

/// Settings shared by the backends.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Network (Docker) or namespace (Kubernetes) name.
    pub namespace: String,
    /// Use an existing namespace and leave it in place on cleanup.
    pub reuse_namespace: bool,
    /// Upper bound on waiting for a pod address.
    pub address_timeout: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            namespace: "coinjoin".to_string(),
            reuse_namespace: false,
            address_timeout: Duration::from_secs(300),
        }
    }
}

/// Instantiate the backend of the given kind.
pub fn connect(kind: DriverKind, options: DriverOptions) -> Arc<dyn Driver> {
    match kind {
        DriverKind::Docker => Arc::new(DockerDriver::new(options.namespace)),
        DriverKind::Podman => Arc::new(PodmanDriver::new()),
        DriverKind::Kubernetes => Arc::new(KubernetesDriver::new(options)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_images() {
        assert!(is_managed_image("btc-node", ""));
        assert!(is_managed_image("wasabi-client:2.0.4", ""));
        assert!(is_managed_image("registry/wasabi-backend", "registry/"));
        assert!(!is_managed_image("wasabi-backend", "registry/"));
        assert!(!is_managed_image("wasabi-client-extra", ""));
        assert!(!is_managed_image("postgres:16", ""));
    }

    #[test]
    fn test_driver_kind_parse() {
        assert_eq!("docker".parse::<DriverKind>().unwrap(), DriverKind::Docker);
        assert_eq!("K8S".parse::<DriverKind>().unwrap(), DriverKind::Kubernetes);
        assert!("lxc".parse::<DriverKind>().is_err());
    }

    #[test]
    fn test_run_spec_builder() {
        let spec = RunSpec::new("btc-node", "btc-node")
            .with_port(18443, 18443)
            .with_env("A", "1")
            .with_resources(Resources::new(4.0, 8192))
            .with_skip_address_wait(true);
        assert_eq!(spec.ports.get(&18443), Some(&18443));
        assert_eq!(spec.env["A"], "1");
        assert_eq!(spec.resources.memory_mib, 8192);
        assert!(spec.skip_address_wait);
    }
}
