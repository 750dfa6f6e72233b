//! Fleet provisioning.
//!
//! Every scenario wallet gets one client instance `wasabi-client-{slot:03}`.
//! Starts run in a bounded pool; slots that fail are retried a few rounds
//! after a cooldown and dropped once the budget is spent.

use crate::images::client_image;
use crate::infra::{Wiring, CLIENT_PORT};
use crate::probe::wait_ready;
use crate::{Context, SimulationConfig};
use futures::stream::{self, StreamExt};
use mixsim_driver::RunSpec;
use mixsim_rpc::Wallet;
use mixsim_types::{ClientVersion, EntityHandle, Resources, Scenario, WalletSpec};
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Host ports of fleet clients start above the distributor's.
const CLIENT_HOST_PORT_BASE: u16 = 37129;

/// Whether a client is currently taking part in mixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Participation {
    Active,
    Inactive,
}

/// A provisioned fleet member.
pub struct ClientRecord {
    pub entity: EntityHandle,
    /// Index of the wallet in the scenario.
    pub slot: usize,
    pub version: ClientVersion,
    /// Blocks into the mixing phase before the client may participate.
    pub delay: u64,
    pub skip_rounds: HashSet<u64>,
    pub participation: Participation,
    pub wallet: Arc<dyn Wallet>,
}

impl ClientRecord {
    pub fn name(&self) -> &str {
        &self.entity.name
    }

    pub fn is_active(&self) -> bool {
        self.participation == Participation::Active
    }

    /// Whether the policy wants the client mixing at `block` / `round`.
    pub fn should_be_active(&self, block: u64, round: u64) -> bool {
        self.delay <= block && !self.skip_rounds.contains(&round)
    }
}

/// The fleet that survived provisioning.
#[derive(Default)]
pub struct Fleet {
    /// Ordered by slot.
    pub clients: Vec<ClientRecord>,
    /// Slots that never came up.
    pub dropped: Vec<usize>,
}

impl Fleet {
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.entity.name.clone()).collect()
    }

    pub fn get(&self, slot: usize) -> Option<&ClientRecord> {
        self.clients.iter().find(|c| c.slot == slot)
    }

    pub fn mark_stopped(&mut self) {
        for client in &mut self.clients {
            client.entity.mark_stopped();
        }
    }
}

pub fn client_name(slot: usize) -> String {
    format!("wasabi-client-{slot:03}")
}

pub fn client_resources(version: &ClientVersion) -> Resources {
    if version < &ClientVersion::v2_0_4() {
        Resources::new(0.3, 1024)
    } else {
        Resources::new(0.1, 768)
    }
}

/// Published host port of the client in `slot`, if it fits the port range.
pub fn client_host_port(slot: usize) -> Option<u16> {
    u16::try_from(slot)
        .ok()
        .and_then(|slot| CLIENT_HOST_PORT_BASE.checked_add(slot))
}

/// Launch specification of the client for scenario wallet `slot`, `None`
/// when the slot has no host port left.
///
/// Wallet tuning is only passed to versions that understand it; for older
/// versions it is dropped with a warning.
pub fn client_run_spec(
    config: &SimulationConfig,
    scenario: &Scenario,
    slot: usize,
    wallet: &WalletSpec,
    wiring: &Wiring,
) -> Option<RunSpec> {
    let version = scenario.wallet_version(wallet);
    let host_port = client_host_port(slot)?;
    let mut spec = RunSpec::new(client_name(slot), client_image(config, version))
        .with_port(CLIENT_PORT, host_port)
        .with_env("ADDR_BTC_NODE", wiring.node.clone())
        .with_env("ADDR_WASABI_BACKEND", wiring.coordinator.clone())
        .with_resources(client_resources(version));

    let tuning = version.supports_wallet_tuning();
    if let Some(target) = scenario.anon_score_target(wallet) {
        if tuning {
            spec = spec.with_env("WASABI_ANON_SCORE_TARGET", target.to_string());
        } else {
            warn!(slot, %version, "Anon score target ignored, requires 2.0.3 or newer");
        }
    }
    if let Some(isolation) = scenario.redcoin_isolation(wallet) {
        if tuning {
            let value = if isolation { "True" } else { "False" };
            spec = spec.with_env("WASABI_REDCOIN_ISOLATION", value);
        } else {
            warn!(slot, %version, "Redcoin isolation ignored, requires 2.0.3 or newer");
        }
    }
    Some(spec)
}

fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Start one client and wait for its wallet. `None` on any failure.
pub async fn start_client(
    ctx: &Context,
    scenario: &Scenario,
    slot: usize,
    wiring: &Wiring,
) -> Option<ClientRecord> {
    let wallet_spec = scenario.wallets.get(slot)?;
    let config = &ctx.config;
    let Some(spec) = client_run_spec(config, scenario, slot, wallet_spec, wiring) else {
        warn!(slot, "Could not start client, no host port left");
        return None;
    };
    let version = scenario.wallet_version(wallet_spec).clone();

    tokio::time::sleep(jitter(config.start_jitter)).await;

    let output = match ctx.driver.run(&spec).await {
        Ok(output) => output,
        Err(e) => {
            warn!(name = %spec.name, error = %e, "Could not start client");
            return None;
        }
    };
    let endpoint = config.endpoint(&output, CLIENT_PORT);
    let mut entity = EntityHandle::starting(
        spec.name.clone(),
        endpoint,
        output.address,
        spec.resources,
    );
    let wallet = match ctx.connector.wallet(&spec.name, &entity.endpoint, &version) {
        Ok(wallet) => wallet,
        Err(e) => {
            warn!(name = %spec.name, error = %e, "Could not connect to client");
            return None;
        }
    };

    let start = Instant::now();
    let ready = wait_ready(
        &spec.name,
        || async { wallet.open_wallet().await.map(|_| true) },
        config.wallet_ready_timeout,
        config.probe_interval,
    )
    .await;
    if !ready {
        warn!(name = %spec.name, elapsed = ?start.elapsed(), "Could not start client, wallet timeout");
        return None;
    }
    entity.mark_ready();
    info!(name = %spec.name, %version, elapsed = ?start.elapsed(), "Started client");

    Some(ClientRecord {
        entity,
        slot,
        version,
        delay: wallet_spec.delay,
        skip_rounds: wallet_spec.skip_round_set(),
        participation: Participation::Inactive,
        wallet,
    })
}

async fn start_slots(
    ctx: &Context,
    scenario: &Scenario,
    slots: &[usize],
    wiring: &Wiring,
) -> Vec<(usize, Option<ClientRecord>)> {
    stream::iter(slots.iter().copied())
        .map(|slot| async move { (slot, start_client(ctx, scenario, slot, wiring).await) })
        .buffer_unordered(ctx.config.provision_concurrency)
        .collect()
        .await
}

/// Start the whole fleet, retrying failed slots, and return what came up.
pub async fn provision(ctx: &Context, scenario: &Scenario, wiring: &Wiring) -> Fleet {
    let config = &ctx.config;
    info!(clients = scenario.wallets.len(), "Starting clients");

    let mut started: Vec<Option<ClientRecord>> = Vec::new();
    started.resize_with(scenario.wallets.len(), || None);
    let all: Vec<usize> = (0..scenario.wallets.len()).collect();
    for (slot, record) in start_slots(ctx, scenario, &all, wiring).await {
        started[slot] = record;
    }

    for retry in 1..=config.start_retries {
        let failed: Vec<usize> = started
            .iter()
            .enumerate()
            .filter(|(_, record)| record.is_none())
            .map(|(slot, _)| slot)
            .collect();
        if failed.is_empty() {
            break;
        }
        warn!(failed = failed.len(), retry, "Clients failed to start, retrying");

        let names: Vec<String> = failed.iter().map(|&slot| client_name(slot)).collect();
        ctx.driver.stop_many(&names).await;
        tokio::time::sleep(config.retry_cooldown).await;

        for (slot, record) in start_slots(ctx, scenario, &failed, wiring).await {
            if record.is_some() {
                started[slot] = record;
            }
        }
    }

    let mut fleet = Fleet::default();
    for (slot, record) in started.into_iter().enumerate() {
        match record {
            Some(record) => fleet.clients.push(record),
            None => fleet.dropped.push(slot),
        }
    }
    if fleet.dropped.is_empty() {
        info!(clients = fleet.len(), "Fleet started");
    } else {
        warn!(
            clients = fleet.len(),
            dropped = fleet.dropped.len(),
            "Some clients failed to start, continuing"
        );
    }
    fleet
}

#[cfg(test)]
mod tests {
    use super::*;
    use mixsim_test_helpers::{DriverCall, FakeConnector, FakeNetwork, MemoryDriver};
    use tracing_test::traced_test;

    fn wiring() -> Wiring {
        Wiring {
            node: "10.0.0.1".to_string(),
            coordinator: "10.0.0.2".to_string(),
        }
    }

    fn context(driver: Arc<MemoryDriver>, network: Arc<FakeNetwork>) -> Context {
        let config = SimulationConfig::default().with_retries(3, Duration::from_secs(60));
        Context::new(driver, Arc::new(FakeConnector::new(network)), config)
    }

    #[test]
    fn test_should_be_active() {
        let wallet = WalletSpec::with_funds([1]).with_delay(2).with_skip_rounds([3]);
        let record = ClientRecord {
            entity: EntityHandle::starting(
                client_name(0),
                mixsim_types::Endpoint::new("localhost", 37129),
                "",
                Resources::new(0.1, 768),
            ),
            slot: 0,
            version: ClientVersion::v2_0_4(),
            delay: wallet.delay,
            skip_rounds: wallet.skip_round_set(),
            participation: Participation::Inactive,
            wallet: Arc::new(FakeConnector::new(FakeNetwork::new()).fake_wallet("w")),
        };
        assert!(!record.should_be_active(1, 0));
        assert!(record.should_be_active(2, 1));
        assert!(!record.should_be_active(5, 3));
        assert!(record.should_be_active(5, 4));
    }

    #[test]
    fn test_client_run_spec() {
        let mut scenario = Scenario::new(
            "spec",
            vec![
                WalletSpec::with_funds([1]),
                WalletSpec::with_funds([1]).with_version("2.0.2".parse().unwrap()),
            ],
        );
        scenario.default_anon_score_target = Some(5);
        scenario.wallets[0].redcoin_isolation = Some(true);
        scenario.wallets[1].redcoin_isolation = Some(true);
        let config = SimulationConfig::default();

        let spec = client_run_spec(&config, &scenario, 0, &scenario.wallets[0], &wiring()).unwrap();
        assert_eq!(spec.name, "wasabi-client-000");
        assert_eq!(spec.image, "wasabi-client:2.0.4");
        assert_eq!(spec.ports.get(&37128), Some(&37129));
        assert_eq!(spec.resources, Resources::new(0.1, 768));
        assert_eq!(spec.env["ADDR_BTC_NODE"], "10.0.0.1");
        assert_eq!(spec.env["ADDR_WASABI_BACKEND"], "10.0.0.2");
        assert_eq!(spec.env["WASABI_ANON_SCORE_TARGET"], "5");
        assert_eq!(spec.env["WASABI_REDCOIN_ISOLATION"], "True");

        let old = client_run_spec(&config, &scenario, 1, &scenario.wallets[1], &wiring()).unwrap();
        assert_eq!(old.name, "wasabi-client-001");
        assert_eq!(old.ports.get(&37128), Some(&37130));
        assert_eq!(old.resources, Resources::new(0.3, 1024));
        assert!(!old.env.contains_key("WASABI_ANON_SCORE_TARGET"));
        assert!(!old.env.contains_key("WASABI_REDCOIN_ISOLATION"));
    }

    #[test]
    fn test_client_host_port_range() {
        assert_eq!(client_host_port(1), Some(37130));
        assert_eq!(client_host_port(28_406), Some(u16::MAX));
        assert_eq!(client_host_port(28_407), None);
        assert_eq!(client_host_port(70_000), None);
        assert_eq!(client_host_port(u16::MAX as usize), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_without_port_fails_to_start() {
        let driver = Arc::new(MemoryDriver::new());
        let ctx = context(driver.clone(), FakeNetwork::new());
        let scenario = Scenario::new("wide", vec![WalletSpec::with_funds([1]); 28_408]);

        assert!(start_client(&ctx, &scenario, 28_407, &wiring()).await.is_none());
        assert!(driver.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_all() {
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        let ctx = context(driver.clone(), network.clone());
        let scenario = Scenario::new("all", vec![WalletSpec::with_funds([1]); 4]);

        let fleet = provision(&ctx, &scenario, &wiring()).await;
        assert_eq!(fleet.len(), 4);
        assert!(fleet.dropped.is_empty());
        let slots: Vec<usize> = fleet.clients.iter().map(|c| c.slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert!(fleet.clients.iter().all(|c| c.entity.is_ready() && !c.is_active()));
        assert!(network.is_opened("wasabi-client-003"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_permanent_failure_is_dropped() {
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        driver.fail_runs("wasabi-client-001", u32::MAX);
        let ctx = context(driver.clone(), network);
        let scenario = Scenario::new("drop", vec![WalletSpec::with_funds([1]); 3]);

        let fleet = provision(&ctx, &scenario, &wiring()).await;
        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet.dropped, vec![1]);
        assert!(fleet.get(1).is_none());
        // Initial attempt plus three retries.
        assert_eq!(driver.count(&DriverCall::Run("wasabi-client-001".into())), 4);
        assert!(logs_contain("Some clients failed to start"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_failure_is_retried() {
        let driver = Arc::new(MemoryDriver::new());
        let network = FakeNetwork::new();
        // Fails readiness for the whole first wallet timeout.
        network.fail_open("wasabi-client-000", 1_000);
        let ctx = context(driver.clone(), network.clone());
        let scenario = Scenario::new("slow", vec![WalletSpec::with_funds([1])]);

        let fleet = provision(&ctx, &scenario, &wiring()).await;
        assert_eq!(fleet.len(), 1);
        assert!(fleet.dropped.is_empty());
        assert!(driver.count(&DriverCall::Stop("wasabi-client-000".into())) >= 1);
    }
}
