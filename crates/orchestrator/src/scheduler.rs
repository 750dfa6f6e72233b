//! Mixing scheduler.
//!
//! Every tick the scheduler observes the coordinator's completed round count
//! and the number of blocks mined since mixing began, decides which clients
//! must start or stop participating, and applies those decisions. Starts of a
//! tick are all issued before any stop. Participation flags are flipped by
//! the scheduler itself once the operations of a tick have returned, and only
//! for the operations that succeeded.

use crate::fleet::{ClientRecord, Fleet, Participation};
use crate::infra::{COORDINATOR_NAME, ROUND_LOG_PATH};
use crate::Context;
use futures::stream::{self, StreamExt};
use mixsim_driver::Driver;
use mixsim_rpc::{Ledger, RpcError};
use mixsim_types::Scenario;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts per counter read before the previous value is kept.
const READ_ATTEMPTS: u32 = 3;

/// Counters observed at one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Observation {
    /// Completed mixing rounds.
    pub round: u64,
    /// Blocks mined since the scheduler started.
    pub block: u64,
}

/// Indices into [`Fleet::clients`] to start and to stop.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickPlan {
    pub start: Vec<usize>,
    pub stop: Vec<usize>,
}

impl TickPlan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty()
    }
}

/// Why the scheduler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerExit {
    LimitReached,
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerReport {
    pub ticks: u64,
    pub rounds: u64,
    pub blocks: u64,
    pub starts: u64,
    pub stops: u64,
    pub failed_operations: u64,
    pub exit: Option<SchedulerExit>,
}

/// Start every inactive client the policy wants mixing, stop every active
/// one it does not.
pub fn plan_tick(fleet: &Fleet, observation: Observation) -> TickPlan {
    let mut plan = TickPlan::default();
    for (index, client) in fleet.clients.iter().enumerate() {
        let should = client.should_be_active(observation.block, observation.round);
        match (client.participation, should) {
            (Participation::Inactive, true) => plan.start.push(index),
            (Participation::Active, false) => plan.stop.push(index),
            _ => {}
        }
    }
    plan
}

/// Whether the scenario's round or block limit (0 = none) is reached.
pub fn limit_reached(scenario: &Scenario, observation: Observation) -> bool {
    let rounds_left = scenario.rounds == 0 || observation.round < scenario.rounds;
    let blocks_left = scenario.blocks == 0 || observation.block < scenario.blocks;
    !(rounds_left && blocks_left)
}

/// Completed rounds recorded in the coordinator's round log.
pub fn count_rounds(log: &str) -> u64 {
    log.matches('\n').count() as u64
}

/// Read the round count, keeping `previous` if every attempt fails. The
/// count never goes backwards. Errors that cannot clear up on their own end
/// the attempts early.
pub async fn read_rounds(driver: &dyn Driver, previous: u64) -> u64 {
    for attempt in 1..=READ_ATTEMPTS {
        match driver.peek(COORDINATOR_NAME, ROUND_LOG_PATH).await {
            Ok(log) => return count_rounds(&log).max(previous),
            Err(e) if e.is_retryable() => debug!(attempt, error = %e, "Could not read rounds"),
            Err(e) => {
                warn!(attempt, error = %e, "Could not read rounds, keeping previous count");
                break;
            }
        }
    }
    previous
}

async fn read_height(ledger: &dyn Ledger) -> Result<u64, RpcError> {
    let mut last = None;
    for attempt in 1..=READ_ATTEMPTS {
        match ledger.block_count().await {
            Ok(height) => return Ok(height),
            Err(e) => {
                debug!(attempt, error = %e, "Could not read blocks");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or(RpcError::Timeout("getblockcount".to_string())))
}

/// Block counter relative to the height at which mixing began.
struct BlockCounter {
    initial: Option<u64>,
    last: u64,
}

impl BlockCounter {
    async fn start(ledger: &dyn Ledger) -> Self {
        let initial = match read_height(ledger).await {
            Ok(height) => Some(height),
            Err(e) => {
                warn!(error = %e, "Could not read initial height, using first successful read");
                None
            }
        };
        Self { initial, last: 0 }
    }

    async fn read(&mut self, ledger: &dyn Ledger) -> u64 {
        if let Ok(height) = read_height(ledger).await {
            let initial = *self.initial.get_or_insert(height);
            self.last = height.saturating_sub(initial).max(self.last);
        }
        self.last
    }
}

async fn apply(
    fleet: &Fleet,
    indices: &[usize],
    concurrency: usize,
    start: bool,
) -> Vec<(usize, Result<(), RpcError>)> {
    stream::iter(indices.iter().copied())
        .map(|index| async move {
            let client: &ClientRecord = &fleet.clients[index];
            let result = if start {
                client.wallet.start_mixing().await
            } else {
                client.wallet.stop_mixing().await
            };
            (index, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await
}

/// Run mixing until the scenario limit is reached or `cancel` fires.
///
/// `report` tracks progress so that it survives an abandoned run.
pub async fn run(
    ctx: &Context,
    ledger: &dyn Ledger,
    fleet: &mut Fleet,
    scenario: &Scenario,
    cancel: &CancellationToken,
    report: &mut SchedulerReport,
) -> SchedulerExit {
    info!(
        clients = fleet.len(),
        rounds = scenario.rounds,
        blocks = scenario.blocks,
        "Mixing"
    );
    let concurrency = ctx.config.rpc_concurrency;
    let mut blocks = BlockCounter::start(ledger).await;
    let mut observation = Observation::default();

    let exit = loop {
        if cancel.is_cancelled() {
            break SchedulerExit::Cancelled;
        }

        let round = read_rounds(ctx.driver.as_ref(), observation.round).await;
        let block = blocks.read(ledger).await;
        if round != observation.round || block != observation.block {
            info!(round, block, "Mixing progress");
        }
        observation = Observation { round, block };
        report.ticks += 1;
        report.rounds = round;
        report.blocks = block;

        if limit_reached(scenario, observation) {
            break SchedulerExit::LimitReached;
        }

        let plan = plan_tick(fleet, observation);
        if !plan.is_empty() {
            let started = apply(fleet, &plan.start, concurrency, true).await;
            let stopped = apply(fleet, &plan.stop, concurrency, false).await;

            for (index, result) in started {
                let client = &mut fleet.clients[index];
                match result {
                    Ok(()) => {
                        client.participation = Participation::Active;
                        report.starts += 1;
                        info!(name = %client.entity.name, block, round, "Started mixing");
                    }
                    Err(e) => {
                        report.failed_operations += 1;
                        warn!(name = %client.entity.name, error = %e, "Could not start mixing");
                    }
                }
            }
            for (index, result) in stopped {
                let client = &mut fleet.clients[index];
                match result {
                    Ok(()) => {
                        client.participation = Participation::Inactive;
                        report.stops += 1;
                        info!(name = %client.entity.name, block, round, "Stopped mixing");
                    }
                    Err(e) => {
                        report.failed_operations += 1;
                        warn!(name = %client.entity.name, error = %e, "Could not stop mixing");
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break SchedulerExit::Cancelled,
            _ = tokio::time::sleep(ctx.config.tick_interval) => {}
        }
    };

    match exit {
        SchedulerExit::LimitReached => info!(
            round = observation.round,
            block = observation.block,
            "Limit reached"
        ),
        SchedulerExit::Cancelled => warn!(
            round = observation.round,
            block = observation.block,
            "Mixing cancelled"
        ),
    }
    report.exit = Some(exit);
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::client_name;
    use crate::SimulationConfig;
    use mixsim_driver::RunSpec;
    use mixsim_test_helpers::{DriverCall, FakeConnector, FakeNetwork, MemoryDriver};
    use mixsim_types::{ClientVersion, Endpoint, EntityHandle, Resources, WalletSpec};
    use std::sync::Arc;
    use std::time::Duration;

    fn record(connector: &FakeConnector, slot: usize, wallet: &WalletSpec) -> ClientRecord {
        ClientRecord {
            entity: EntityHandle::starting(
                client_name(slot),
                Endpoint::new("localhost", 37129 + slot as u16),
                "",
                Resources::new(0.1, 768),
            ),
            slot,
            version: ClientVersion::v2_0_4(),
            delay: wallet.delay,
            skip_rounds: wallet.skip_round_set(),
            participation: Participation::Inactive,
            wallet: Arc::new(connector.fake_wallet(&client_name(slot))),
        }
    }

    fn fleet(connector: &FakeConnector, wallets: &[WalletSpec]) -> Fleet {
        Fleet {
            clients: wallets
                .iter()
                .enumerate()
                .map(|(slot, wallet)| record(connector, slot, wallet))
                .collect(),
            dropped: Vec::new(),
        }
    }

    async fn coordinator_driver(rounds: &str) -> Arc<MemoryDriver> {
        let driver = Arc::new(MemoryDriver::new());
        driver
            .run(&RunSpec::new(COORDINATOR_NAME, "wasabi-backend"))
            .await
            .unwrap();
        driver.set_file(COORDINATOR_NAME, ROUND_LOG_PATH, rounds);
        driver
    }

    #[test]
    fn test_plan_follows_delay_and_skip_rounds() {
        let connector = FakeConnector::new(FakeNetwork::new());
        let wallet = WalletSpec::with_funds([1]).with_delay(2).with_skip_rounds([3]);
        let mut fleet = fleet(&connector, &[wallet]);

        let at = |block, round| Observation { round, block };
        assert!(plan_tick(&fleet, at(1, 0)).is_empty());
        assert_eq!(plan_tick(&fleet, at(2, 1)).start, vec![0]);

        fleet.clients[0].participation = Participation::Active;
        assert!(plan_tick(&fleet, at(4, 2)).is_empty());
        assert_eq!(plan_tick(&fleet, at(5, 3)).stop, vec![0]);
    }

    #[test]
    fn test_limits() {
        let scenario = Scenario::new("limits", Vec::new()).with_limits(5, 0);
        let at = |round, block| Observation { round, block };
        assert!(!limit_reached(&scenario, at(4, 1_000)));
        assert!(limit_reached(&scenario, at(5, 0)));

        let scenario = scenario.with_limits(0, 120);
        assert!(!limit_reached(&scenario, at(1_000, 119)));
        assert!(limit_reached(&scenario, at(0, 120)));

        let unlimited = scenario.with_limits(0, 0);
        assert!(!limit_reached(&unlimited, at(u64::MAX, u64::MAX)));
    }

    #[test]
    fn test_count_rounds() {
        assert_eq!(count_rounds(""), 0);
        assert_eq!(count_rounds("a1\nb2\n"), 2);
        assert_eq!(count_rounds("a1\nb2\npartial"), 2);
    }

    #[tokio::test]
    async fn test_read_rounds_falls_back_and_clamps() {
        let driver = coordinator_driver("r1\nr2\n").await;
        assert_eq!(read_rounds(driver.as_ref(), 0).await, 2);
        assert_eq!(read_rounds(driver.as_ref(), 5).await, 5);

        let missing = MemoryDriver::new();
        assert_eq!(read_rounds(&missing, 3).await, 3);
    }

    #[tokio::test]
    async fn test_read_rounds_gives_up_on_permanent_errors() {
        let peeks = |driver: &MemoryDriver| {
            driver
                .calls()
                .iter()
                .filter(|call| matches!(call, DriverCall::Peek { .. }))
                .count()
        };

        // Not there yet: every attempt is made.
        let fresh = MemoryDriver::new();
        assert_eq!(read_rounds(&fresh, 2).await, 2);
        assert_eq!(peeks(&fresh), READ_ATTEMPTS as usize);

        // A rejected read is not repeated.
        let driver = coordinator_driver("").await;
        driver.break_file(COORDINATOR_NAME, ROUND_LOG_PATH);
        assert_eq!(read_rounds(driver.as_ref(), 4).await, 4);
        assert_eq!(peeks(driver.as_ref()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_until_block_limit() {
        let network = FakeNetwork::new();
        network.mine_on_read(1);
        let connector = FakeConnector::new(network.clone());
        let wallets = [
            WalletSpec::with_funds([1]),
            WalletSpec::with_funds([1]).with_delay(3),
            WalletSpec::with_funds([1]).with_delay(100),
        ];
        let mut fleet = fleet(&connector, &wallets);
        let scenario = Scenario::new("blocks", wallets.to_vec()).with_limits(0, 10);
        let driver = coordinator_driver("").await;
        let ctx = Context::new(
            driver,
            Arc::new(connector.clone()),
            SimulationConfig::default(),
        );

        let mut report = SchedulerReport::default();
        let exit = run(
            &ctx,
            &connector.fake_ledger(),
            &mut fleet,
            &scenario,
            &CancellationToken::new(),
            &mut report,
        )
        .await;

        assert_eq!(exit, SchedulerExit::LimitReached);
        assert_eq!(report.blocks, 10);
        assert!(fleet.clients[0].is_active());
        assert!(fleet.clients[1].is_active());
        assert!(!fleet.clients[2].is_active());
        assert_eq!(network.mixing_calls(&client_name(0)), (1, 0));
        assert_eq!(network.mixing_calls(&client_name(2)), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_is_retried_next_tick() {
        let network = FakeNetwork::new();
        network.mine_on_read(1);
        network.fail_start(&client_name(0), 2);
        let connector = FakeConnector::new(network.clone());
        let wallets = [WalletSpec::with_funds([1])];
        let mut fleet = fleet(&connector, &wallets);
        let scenario = Scenario::new("retry", wallets.to_vec()).with_limits(0, 5);
        let ctx = Context::new(
            coordinator_driver("").await,
            Arc::new(connector.clone()),
            SimulationConfig::default(),
        );

        let mut report = SchedulerReport::default();
        run(
            &ctx,
            &connector.fake_ledger(),
            &mut fleet,
            &scenario,
            &CancellationToken::new(),
            &mut report,
        )
        .await;

        assert!(fleet.clients[0].is_active());
        assert_eq!(report.failed_operations, 2);
        assert_eq!(report.starts, 1);
        assert!(network.is_mixing(&client_name(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_at_tick_boundary() {
        let connector = FakeConnector::new(FakeNetwork::new());
        let wallets = [WalletSpec::with_funds([1])];
        let mut fleet = fleet(&connector, &wallets);
        let scenario = Scenario::new("cancel", wallets.to_vec());
        let config = SimulationConfig::default().with_tick_interval(Duration::from_secs(1));
        let ctx = Context::new(
            coordinator_driver("").await,
            Arc::new(connector.clone()),
            config,
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3_500)).await;
            trigger.cancel();
        });

        let mut report = SchedulerReport::default();
        let exit = run(
            &ctx,
            &connector.fake_ledger(),
            &mut fleet,
            &scenario,
            &cancel,
            &mut report,
        )
        .await;
        assert_eq!(exit, SchedulerExit::Cancelled);
        assert_eq!(report.ticks, 4);
        assert_eq!(report.exit, Some(SchedulerExit::Cancelled));
    }
}
