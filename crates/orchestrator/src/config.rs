//! Configuration for a simulation run.
//!
//! [`SimulationConfig`] is built from defaults, optionally overlaid with a
//! TOML file, then with command line flags. Durations in the file are given
//! as integer seconds (`*_secs`) or milliseconds (`*_ms`).

use mixsim_driver::{DriverKind, DriverOptions, RunOutput};
use mixsim_types::Endpoint;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Everything that tunes a run, apart from the scenario itself.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Runtime backend.
    #[serde(deserialize_with = "from_str")]
    pub driver: DriverKind,

    /// Docker network / Kubernetes namespace.
    pub namespace: String,

    /// Use an existing namespace and keep it after cleanup.
    pub reuse_namespace: bool,

    /// Registry prefix of every image; when set images are pulled, not built.
    pub image_prefix: String,

    /// Rebuild (or re-pull) images even when present.
    pub force_rebuild: bool,

    /// Host at which published ports are reachable.
    pub control_ip: String,

    /// HTTP proxy through which entities are reached by internal address.
    pub proxy: Option<String>,

    /// Override of the ledger node address handed to other entities.
    pub node_address: Option<String>,

    /// Override of the coordinator address handed to clients.
    pub coordinator_address: Option<String>,

    /// Collect and archive artifacts on shutdown.
    pub collect_logs: bool,

    /// Directory receiving experiment directories and archives.
    pub log_dir: PathBuf,

    /// Image build contexts.
    pub containers_dir: PathBuf,

    /// Base coordinator policy, merged with the scenario `backend` overrides.
    pub coordinator_config: PathBuf,

    #[serde(rename = "infra_ready_timeout_secs", deserialize_with = "secs")]
    pub infra_ready_timeout: Duration,

    #[serde(rename = "wallet_ready_timeout_secs", deserialize_with = "secs")]
    pub wallet_ready_timeout: Duration,

    #[serde(rename = "probe_interval_ms", deserialize_with = "millis")]
    pub probe_interval: Duration,

    /// Pause between coordinator launch and policy upload.
    #[serde(rename = "policy_settle_delay_ms", deserialize_with = "millis")]
    pub policy_settle_delay: Duration,

    /// Retry rounds for clients that failed to start.
    pub start_retries: u32,

    #[serde(rename = "retry_cooldown_secs", deserialize_with = "secs")]
    pub retry_cooldown: Duration,

    /// Upper bound of the random delay before each client launch.
    #[serde(rename = "start_jitter_ms", deserialize_with = "millis")]
    pub start_jitter: Duration,

    /// Outputs the distributor is seeded with.
    pub distributor_utxos: u64,

    /// Total seeded into the distributor, in BTC.
    pub distributor_funds_btc: u64,

    /// Balance polls without change after which seeding stops waiting.
    pub stall_polls: u32,

    #[serde(rename = "distributor_funding_timeout_secs", deserialize_with = "secs")]
    pub distributor_funding_timeout: Duration,

    /// Invoices per funding transaction.
    pub batch_size: usize,

    #[serde(rename = "funding_timeout_secs", deserialize_with = "secs")]
    pub funding_timeout: Duration,

    #[serde(rename = "balance_poll_interval_ms", deserialize_with = "millis")]
    pub balance_poll_interval: Duration,

    #[serde(rename = "balance_read_timeout_secs", deserialize_with = "secs")]
    pub balance_read_timeout: Duration,

    #[serde(rename = "tick_interval_ms", deserialize_with = "millis")]
    pub tick_interval: Duration,

    /// Concurrent client launches.
    pub provision_concurrency: usize,

    /// Concurrent per-client RPC operations (addresses, balances, mixing).
    pub rpc_concurrency: usize,

    /// Concurrent per-client artifact collections.
    pub harvest_concurrency: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Docker,
            namespace: "coinjoin".to_string(),
            reuse_namespace: false,
            image_prefix: String::new(),
            force_rebuild: false,
            control_ip: "localhost".to_string(),
            proxy: None,
            node_address: None,
            coordinator_address: None,
            collect_logs: true,
            log_dir: PathBuf::from("./logs"),
            containers_dir: PathBuf::from("./containers"),
            coordinator_config: PathBuf::from("./containers/wasabi-backend/WabiSabiConfig.json"),
            infra_ready_timeout: Duration::from_secs(300),
            wallet_ready_timeout: Duration::from_secs(60),
            probe_interval: Duration::from_millis(100),
            policy_settle_delay: Duration::from_secs(1),
            start_retries: 3,
            retry_cooldown: Duration::from_secs(60),
            start_jitter: Duration::from_secs(3),
            distributor_utxos: 20,
            distributor_funds_btc: 1000,
            stall_polls: 30,
            distributor_funding_timeout: Duration::from_secs(300),
            batch_size: 5,
            funding_timeout: Duration::from_secs(90),
            balance_poll_interval: Duration::from_secs(1),
            balance_read_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            provision_concurrency: 16,
            rpc_concurrency: 32,
            harvest_concurrency: 8,
        }
    }
}

impl SimulationConfig {
    /// Defaults overlaid with a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("provision_concurrency", self.provision_concurrency),
            ("rpc_concurrency", self.rpc_concurrency),
            ("harvest_concurrency", self.harvest_concurrency),
            ("distributor_utxos", self.distributor_utxos as usize),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>, reuse: bool) -> Self {
        self.namespace = namespace.into();
        self.reuse_namespace = reuse;
        self
    }

    pub fn with_image_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.image_prefix = prefix.into();
        self
    }

    pub fn with_force_rebuild(mut self, force: bool) -> Self {
        self.force_rebuild = force;
        self
    }

    pub fn with_control_ip(mut self, control_ip: impl Into<String>) -> Self {
        self.control_ip = control_ip.into();
        self
    }

    /// An empty proxy disables proxying.
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.is_empty());
        self
    }

    pub fn with_address_overrides(
        mut self,
        node: Option<String>,
        coordinator: Option<String>,
    ) -> Self {
        self.node_address = node.filter(|a| !a.is_empty());
        self.coordinator_address = coordinator.filter(|a| !a.is_empty());
        self
    }

    pub fn with_collect_logs(mut self, collect: bool) -> Self {
        self.collect_logs = collect;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_coordinator_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.coordinator_config = path.into();
        self
    }

    pub fn with_retries(mut self, retries: u32, cooldown: Duration) -> Self {
        self.start_retries = retries;
        self.retry_cooldown = cooldown;
        self
    }

    pub fn with_start_jitter(mut self, jitter: Duration) -> Self {
        self.start_jitter = jitter;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_funding_timeout(mut self, timeout: Duration) -> Self {
        self.funding_timeout = timeout;
        self
    }

    pub fn with_distributor_seed(mut self, utxos: u64, funds_btc: u64) -> Self {
        self.distributor_utxos = utxos;
        self.distributor_funds_btc = funds_btc;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Options for [`mixsim_driver::connect`].
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            namespace: self.namespace.clone(),
            reuse_namespace: self.reuse_namespace,
            address_timeout: self.infra_ready_timeout,
        }
    }

    /// Endpoint at which the orchestrator reaches `container_port` of a
    /// launched entity.
    pub fn endpoint(&self, output: &RunOutput, container_port: u16) -> Endpoint {
        if self.proxy.is_some() {
            Endpoint::new(output.address.clone(), container_port)
        } else {
            let port = output
                .ports
                .get(&container_port)
                .copied()
                .unwrap_or(container_port);
            Endpoint::new(self.control_ip.clone(), port)
        }
    }
}

fn from_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text = String::deserialize(deserializer)?;
    text.parse().map_err(serde::de::Error::custom)
}

fn secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixsim_driver::PortMap;

    #[test]
    fn test_defaults() {
        let config = SimulationConfig::default();
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.distributor_utxos, 20);
        assert_eq!(config.funding_timeout, Duration::from_secs(90));
        assert_eq!(config.start_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = SimulationConfig::from_toml(
            r#"
            driver = "kubernetes"
            namespace = "mix-1"
            proxy = "http://proxy:3128"
            retry_cooldown_secs = 5
            tick_interval_ms = 250
            batch_size = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.driver, DriverKind::Kubernetes);
        assert_eq!(config.namespace, "mix-1");
        assert_eq!(config.retry_cooldown, Duration::from_secs(5));
        assert_eq!(config.tick_interval, Duration::from_millis(250));
        assert_eq!(config.batch_size, 10);
        // Untouched fields keep their defaults.
        assert_eq!(config.wallet_ready_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            SimulationConfig::from_toml("driver = \"lxc\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            SimulationConfig::from_toml("batch_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(SimulationConfig::from_toml("no_such_field = 1").is_err());
    }

    #[test]
    fn test_endpoint_addressing() {
        let mut ports = PortMap::new();
        ports.insert(37128, 31001);
        let output = RunOutput {
            address: "10.1.2.3".to_string(),
            ports,
        };

        let direct = SimulationConfig::default().with_control_ip("192.168.1.5");
        assert_eq!(direct.endpoint(&output, 37128), Endpoint::new("192.168.1.5", 31001));

        let proxied = SimulationConfig::default().with_proxy(Some("http://proxy:3128".into()));
        assert_eq!(proxied.endpoint(&output, 37128), Endpoint::new("10.1.2.3", 37128));

        let empty = SimulationConfig::default().with_proxy(Some(String::new()));
        assert!(empty.proxy.is_none());
    }
}
