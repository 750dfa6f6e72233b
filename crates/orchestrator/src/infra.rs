//! Infrastructure bringup: ledger node, mixing coordinator, distributor.
//!
//! Each entity is launched, recorded in [`Infrastructure`] and then probed
//! for readiness, in that order, so that a failed bringup still leaves
//! behind everything shutdown needs to stop and harvest.

use crate::images::{client_image, infra_image};
use crate::probe::wait_ready;
use crate::{Context, SimulationConfig, SimulationError};
use mixsim_driver::{RunOutput, RunSpec, COORDINATOR_IMAGE, NODE_IMAGE};
use mixsim_rpc::{Coordinator, Ledger, Wallet};
use mixsim_types::{EntityHandle, Resources, Scenario};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub const NODE_NAME: &str = "btc-node";
pub const COORDINATOR_NAME: &str = "wasabi-backend";
pub const DISTRIBUTOR_NAME: &str = "wasabi-client-distributor";

pub const NODE_RPC_PORT: u16 = 18443;
pub const NODE_P2P_PORT: u16 = 18444;
pub const COORDINATOR_PORT: u16 = 37127;
pub const CLIENT_PORT: u16 = 37128;

const NODE_RESOURCES: Resources = Resources::new(4.0, 8192);
const COORDINATOR_RESOURCES: Resources = Resources::new(8.0, 8192);
const DISTRIBUTOR_RESOURCES: Resources = Resources::new(1.0, 2048);

/// The node is usable once it is past coinbase maturity.
const READY_HEIGHT: u64 = 100;

pub const COORDINATOR_DATA_DIR: &str = "/home/wasabi/.walletwasabi/backend/";
pub const COORDINATOR_POLICY_PATH: &str =
    "/home/wasabi/.walletwasabi/backend/WabiSabiConfig.json";
/// One line per completed mixing round.
pub const ROUND_LOG_PATH: &str = "/home/wasabi/.walletwasabi/backend/WabiSabi/CoinJoinIdStore.txt";

/// A launched entity together with its RPC client.
pub struct Managed<C: ?Sized> {
    pub entity: EntityHandle,
    pub client: Arc<C>,
}

/// Shared infrastructure, filled in as bringup progresses.
#[derive(Default)]
pub struct Infrastructure {
    pub node: Option<Managed<dyn Ledger>>,
    pub coordinator: Option<Managed<dyn Coordinator>>,
    pub distributor: Option<Managed<dyn Wallet>>,
}

/// Addresses under which fleet clients reach the shared services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wiring {
    pub node: String,
    pub coordinator: String,
}

impl Infrastructure {
    pub fn ledger(&self) -> Option<&Arc<dyn Ledger>> {
        self.node.as_ref().map(|node| &node.client)
    }

    pub fn distributor_wallet(&self) -> Option<&Arc<dyn Wallet>> {
        self.distributor.as_ref().map(|d| &d.client)
    }

    /// Names of every launched infrastructure entity.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(node) = &self.node {
            names.push(node.entity.name.clone());
        }
        if let Some(coordinator) = &self.coordinator {
            names.push(coordinator.entity.name.clone());
        }
        if let Some(distributor) = &self.distributor {
            names.push(distributor.entity.name.clone());
        }
        names
    }

    pub fn mark_stopped(&mut self) {
        if let Some(node) = &mut self.node {
            node.entity.mark_stopped();
        }
        if let Some(coordinator) = &mut self.coordinator {
            coordinator.entity.mark_stopped();
        }
        if let Some(distributor) = &mut self.distributor {
            distributor.entity.mark_stopped();
        }
    }

    /// Entity-to-entity addresses, honouring configured overrides.
    pub fn wiring(&self, config: &SimulationConfig) -> Wiring {
        let internal = |entity: Option<&EntityHandle>| {
            entity
                .map(|e| e.internal_address.clone())
                .unwrap_or_default()
        };
        Wiring {
            node: config
                .node_address
                .clone()
                .unwrap_or_else(|| internal(self.node.as_ref().map(|n| &n.entity))),
            coordinator: config
                .coordinator_address
                .clone()
                .unwrap_or_else(|| internal(self.coordinator.as_ref().map(|c| &c.entity))),
        }
    }
}

/// Merge scenario overrides into the base coordinator policy.
pub fn merge_policy(mut base: Map<String, Value>, overrides: &Map<String, Value>) -> Map<String, Value> {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
    base
}

async fn launch(
    ctx: &Context,
    spec: RunSpec,
    rpc_port: u16,
    stage: &'static str,
) -> Result<(EntityHandle, RunOutput), SimulationError> {
    let output = ctx
        .driver
        .run(&spec)
        .await
        .map_err(|e| SimulationError::bringup(stage, e))?;
    let endpoint = ctx.config.endpoint(&output, rpc_port);
    let entity = EntityHandle::starting(spec.name, endpoint, output.address.clone(), spec.resources);
    Ok((entity, output))
}

/// Write the merged policy to a temporary file and upload it.
async fn upload_policy(ctx: &Context, scenario: &Scenario) -> Result<(), SimulationError> {
    let stage = "coordinator policy";
    let base = read_policy(&ctx.config.coordinator_config).map_err(|e| SimulationError::bringup(stage, e))?;
    let policy = merge_policy(base, &scenario.backend);
    let rendered = serde_json::to_string_pretty(&policy).map_err(|e| SimulationError::bringup(stage, e))?;

    let mut file = tempfile::NamedTempFile::new().map_err(|e| SimulationError::bringup(stage, e))?;
    file.write_all(rendered.as_bytes())
        .map_err(|e| SimulationError::bringup(stage, e))?;

    ctx.driver
        .upload(COORDINATOR_NAME, file.path(), COORDINATOR_POLICY_PATH)
        .await
        .map_err(|e| SimulationError::bringup(stage, e))?;
    info!(overrides = scenario.backend.len(), "Uploaded coordinator policy");
    Ok(())
}

fn read_policy(path: &Path) -> Result<Map<String, Value>, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    serde_json::from_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

/// Start the ledger node, the coordinator and the distributor, each gated on
/// readiness. Any failure is fatal.
pub async fn bring_up(
    ctx: &Context,
    scenario: &Scenario,
    infra: &mut Infrastructure,
) -> Result<(), SimulationError> {
    let config = &ctx.config;
    info!("Starting infrastructure");

    // Ledger node
    let spec = RunSpec::new(NODE_NAME, infra_image(config, NODE_IMAGE))
        .with_port(NODE_RPC_PORT, NODE_RPC_PORT)
        .with_port(NODE_P2P_PORT, NODE_P2P_PORT)
        .with_resources(NODE_RESOURCES);
    let (entity, _) = launch(ctx, spec, NODE_RPC_PORT, "btc-node launch").await?;
    let ledger = ctx
        .connector
        .ledger(&entity.endpoint)
        .map_err(|e| SimulationError::bringup("btc-node client", e))?;
    let node = infra.node.insert(Managed {
        entity,
        client: ledger.clone(),
    });
    let ready = wait_ready(
        NODE_NAME,
        || async { ledger.block_count().await.map(|h| h > READY_HEIGHT) },
        config.infra_ready_timeout,
        config.probe_interval,
    )
    .await;
    if !ready {
        node.entity.mark_failed();
        return Err(SimulationError::bringup("btc-node readiness", "timed out"));
    }
    node.entity.mark_ready();
    info!(entity = %node.entity, "Started btc-node");

    // Coordinator
    let node_address = infra.wiring(config).node;
    let spec = RunSpec::new(COORDINATOR_NAME, infra_image(config, COORDINATOR_IMAGE))
        .with_port(COORDINATOR_PORT, COORDINATOR_PORT)
        .with_env("WASABI_BIND", format!("http://0.0.0.0:{COORDINATOR_PORT}"))
        .with_env("ADDR_BTC_NODE", node_address.clone())
        .with_resources(COORDINATOR_RESOURCES);
    let (entity, _) = launch(ctx, spec, COORDINATOR_PORT, "wasabi-backend launch").await?;
    let coordinator = ctx
        .connector
        .coordinator(&entity.endpoint)
        .map_err(|e| SimulationError::bringup("wasabi-backend client", e))?;
    infra.coordinator = Some(Managed {
        entity,
        client: coordinator.clone(),
    });

    tokio::time::sleep(config.policy_settle_delay).await;
    upload_policy(ctx, scenario).await?;

    let ready = wait_ready(
        COORDINATOR_NAME,
        || async { coordinator.status().await.map(|_| true) },
        config.infra_ready_timeout,
        config.probe_interval,
    )
    .await;
    let Some(managed) = infra.coordinator.as_mut() else {
        return Err(SimulationError::bringup("wasabi-backend", "handle lost"));
    };
    if !ready {
        managed.entity.mark_failed();
        return Err(SimulationError::bringup("wasabi-backend readiness", "timed out"));
    }
    managed.entity.mark_ready();
    info!(entity = %managed.entity, "Started wasabi-backend");

    // Distributor
    let wiring = infra.wiring(config);
    let version = scenario.distributor_version();
    let spec = RunSpec::new(DISTRIBUTOR_NAME, client_image(config, version))
        .with_port(CLIENT_PORT, CLIENT_PORT)
        .with_env("ADDR_BTC_NODE", wiring.node)
        .with_env("ADDR_WASABI_BACKEND", wiring.coordinator)
        .with_resources(DISTRIBUTOR_RESOURCES);
    let (entity, _) = launch(ctx, spec, CLIENT_PORT, "distributor launch").await?;
    let wallet = ctx
        .connector
        .wallet(DISTRIBUTOR_NAME, &entity.endpoint, version)
        .map_err(|e| SimulationError::bringup("distributor client", e))?;
    let distributor = infra.distributor.insert(Managed {
        entity,
        client: wallet.clone(),
    });
    let ready = wait_ready(
        DISTRIBUTOR_NAME,
        || async { wallet.open_wallet().await.map(|_| true) },
        config.wallet_ready_timeout,
        config.probe_interval,
    )
    .await;
    if !ready {
        distributor.entity.mark_failed();
        return Err(SimulationError::bringup("distributor readiness", "wallet timeout"));
    }
    distributor.entity.mark_ready();
    info!(entity = %distributor.entity, version = %version, "Started distributor");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixsim_test_helpers::{DriverCall, FakeConnector, FakeNetwork, MemoryDriver};
    use serde_json::json;

    fn policy_file(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("WabiSabiConfig.json");
        std::fs::write(
            &path,
            r#"{"MaxInputCountByRound": 100, "ConfirmationTarget": 108}"#,
        )
        .unwrap();
        path
    }

    fn context(
        driver: Arc<MemoryDriver>,
        network: Arc<FakeNetwork>,
        config: SimulationConfig,
    ) -> Context {
        Context::new(driver, Arc::new(FakeConnector::new(network)), config)
    }

    #[test]
    fn test_merge_policy() {
        let base = json!({ "MaxInputCountByRound": 100, "ConfirmationTarget": 108 });
        let overrides = json!({ "MaxInputCountByRound": 400, "RoundExpiryTimeout": "0d 0h 10m 0s" });
        let merged = merge_policy(
            base.as_object().unwrap().clone(),
            overrides.as_object().unwrap(),
        );
        assert_eq!(merged["MaxInputCountByRound"], 400);
        assert_eq!(merged["ConfirmationTarget"], 108);
        assert_eq!(merged["RoundExpiryTimeout"], "0d 0h 10m 0s");
    }

    #[test]
    fn test_wiring_overrides() {
        let config = SimulationConfig::default()
            .with_address_overrides(Some("192.168.0.10".into()), None);
        let wiring = Infrastructure::default().wiring(&config);
        assert_eq!(wiring.node, "192.168.0.10");
        assert_eq!(wiring.coordinator, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        let config = SimulationConfig::default().with_coordinator_config(policy_file(&dir));
        let ctx = context(driver.clone(), network.clone(), config);

        let mut scenario = Scenario::default();
        scenario
            .backend
            .insert("MaxInputCountByRound".into(), json!(400));

        let mut infra = Infrastructure::default();
        bring_up(&ctx, &scenario, &mut infra).await.unwrap();

        assert_eq!(
            infra.names(),
            vec![NODE_NAME, COORDINATOR_NAME, DISTRIBUTOR_NAME]
        );
        assert!(infra.node.as_ref().unwrap().entity.is_ready());
        assert!(network.is_opened(DISTRIBUTOR_NAME));

        let node = driver.spec(NODE_NAME).unwrap();
        assert_eq!(node.resources, NODE_RESOURCES);
        assert_eq!(node.ports.get(&NODE_P2P_PORT), Some(&NODE_P2P_PORT));

        let coordinator = driver.spec(COORDINATOR_NAME).unwrap();
        let node_address = &infra.node.as_ref().unwrap().entity.internal_address;
        assert_eq!(&coordinator.env["ADDR_BTC_NODE"], node_address);
        assert_eq!(coordinator.env["WASABI_BIND"], "http://0.0.0.0:37127");

        let distributor = driver.spec(DISTRIBUTOR_NAME).unwrap();
        assert_eq!(distributor.image, "wasabi-client:2.0.4");
        assert_eq!(distributor.env["ADDR_WASABI_BACKEND"], infra.wiring(&ctx.config).coordinator);

        let uploaded = driver.file(COORDINATOR_NAME, COORDINATOR_POLICY_PATH).unwrap();
        let policy: Value = serde_json::from_str(&uploaded).unwrap();
        assert_eq!(policy["MaxInputCountByRound"], 400);
        assert_eq!(policy["ConfirmationTarget"], 108);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_not_ready_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        network.set_height(50);
        let config = SimulationConfig::default().with_coordinator_config(policy_file(&dir));
        let ctx = context(driver.clone(), network, config);

        let mut infra = Infrastructure::default();
        let err = bring_up(&ctx, &Scenario::default(), &mut infra)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Bringup { stage: "btc-node readiness", .. }
        ));
        // The node is known so that shutdown can stop it.
        assert_eq!(infra.names(), vec![NODE_NAME]);
        assert_eq!(driver.count(&DriverCall::Run(COORDINATOR_NAME.into())), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_policy_file_is_fatal() {
        let driver = Arc::new(MemoryDriver::new());
        let config = SimulationConfig::default()
            .with_coordinator_config("/nonexistent/WabiSabiConfig.json");
        let ctx = context(driver, FakeNetwork::new(), config);

        let mut infra = Infrastructure::default();
        let err = bring_up(&ctx, &Scenario::default(), &mut infra)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Bringup { stage: "coordinator policy", .. }
        ));
        assert!(infra.coordinator.is_some());
    }
}
