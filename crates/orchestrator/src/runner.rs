//! Sequencing of a simulation run.

use crate::error::SimulationError;
use crate::fleet::{self, Fleet, Participation};
use crate::funding::{self, FundingReport};
use crate::harvest;
use crate::images;
use crate::infra::{self, Infrastructure};
use crate::scheduler::{self, SchedulerExit, SchedulerReport};
use crate::{Context, SimulationConfig};
use mixsim_driver::Driver;
use mixsim_rpc::Connector;
use mixsim_types::{EntityState, Scenario};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How the main phases of a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The scenario limit was reached.
    Completed,
    Interrupted,
    /// A fatal error aborted the run.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSummary {
    pub name: String,
    pub slot: usize,
    pub version: String,
    pub participation: Participation,
    pub state: EntityState,
}

/// Report of a run, stored as `summary.json` next to the collected logs.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub scenario: String,
    pub driver: String,
    pub started_at: String,
    pub termination: Termination,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub clients: Vec<ClientSummary>,
    pub dropped: Vec<String>,
    pub funding: FundingReport,
    pub mixing: SchedulerReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_error: Option<String>,
}

/// One simulation run: setup, mixing, then shutdown & harvest.
pub struct Simulation {
    ctx: Context,
    scenario: Scenario,
    infra: Infrastructure,
    fleet: Fleet,
    funding: FundingReport,
    mixing: SchedulerReport,
    started_at: SystemTime,
}

impl Simulation {
    pub fn new(
        driver: Arc<dyn Driver>,
        connector: Arc<dyn Connector>,
        config: SimulationConfig,
        scenario: Scenario,
    ) -> Self {
        Self {
            ctx: Context::new(driver, connector, config),
            scenario,
            infra: Infrastructure::default(),
            fleet: Fleet::default(),
            funding: FundingReport::default(),
            mixing: SchedulerReport::default(),
            started_at: SystemTime::now(),
        }
    }

    /// Run to completion. Shutdown & harvest always run, including after a
    /// fatal error or cancellation; the returned error is the outcome of the
    /// main phases.
    pub async fn run(mut self, cancel: CancellationToken) -> (RunSummary, Result<(), SimulationError>) {
        info!(scenario = %self.scenario.name, driver = %self.ctx.config.driver, "Starting simulation");

        let setup = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SimulationError::Interrupted),
            result = self.setup() => result,
        };
        let result = match setup {
            Ok(()) => self.mix(&cancel).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => info!("Simulation finished"),
            Err(SimulationError::Interrupted) => warn!("Simulation interrupted"),
            Err(e) => error!(error = %e, "Simulation failed"),
        }

        let summary = self.shutdown(&result).await;
        (summary, result)
    }

    /// Images, infrastructure, distributor seed, fleet and fleet funding.
    async fn setup(&mut self) -> Result<(), SimulationError> {
        let ctx = &self.ctx;
        ctx.driver
            .prepare()
            .await
            .map_err(|e| SimulationError::bringup("runtime", e))?;
        images::prepare_images(ctx.driver.as_ref(), &ctx.config, &self.scenario.client_versions())
            .await
            .map_err(|e| SimulationError::bringup("images", e))?;

        infra::bring_up(ctx, &self.scenario, &mut self.infra).await?;
        let (Some(ledger), Some(distributor)) =
            (self.infra.ledger(), self.infra.distributor_wallet())
        else {
            return Err(SimulationError::bringup("infrastructure", "incomplete"));
        };
        let (ledger, distributor) = (ledger.clone(), distributor.clone());

        let seed = funding::fund_distributor(ledger.as_ref(), distributor.as_ref(), &ctx.config).await;
        self.funding.distributor = Some(seed);

        let wiring = self.infra.wiring(&ctx.config);
        self.fleet = fleet::provision(ctx, &self.scenario, &wiring).await;

        funding::fund_fleet(
            ctx,
            ledger.as_ref(),
            distributor.as_ref(),
            &self.fleet,
            &self.scenario,
            &mut self.funding,
        )
        .await
    }

    async fn mix(&mut self, cancel: &CancellationToken) -> Result<(), SimulationError> {
        let Some(ledger) = self.infra.ledger().cloned() else {
            return Err(SimulationError::bringup("infrastructure", "no ledger node"));
        };
        let exit = scheduler::run(
            &self.ctx,
            ledger.as_ref(),
            &mut self.fleet,
            &self.scenario,
            cancel,
            &mut self.mixing,
        )
        .await;
        match exit {
            SchedulerExit::LimitReached => Ok(()),
            SchedulerExit::Cancelled => Err(SimulationError::Interrupted),
        }
    }

    fn summary(&self, result: &Result<(), SimulationError>) -> RunSummary {
        let termination = match result {
            Ok(()) => Termination::Completed,
            Err(SimulationError::Interrupted) => Termination::Interrupted,
            Err(_) => Termination::Failed,
        };
        RunSummary {
            scenario: self.scenario.name.clone(),
            driver: self.ctx.config.driver.to_string(),
            started_at: humantime::format_rfc3339_seconds(self.started_at).to_string(),
            termination,
            error: result.as_ref().err().map(ToString::to_string),
            clients: self
                .fleet
                .clients
                .iter()
                .map(|client| ClientSummary {
                    name: client.entity.name.clone(),
                    slot: client.slot,
                    version: client.version.to_string(),
                    participation: client.participation,
                    state: client.entity.state,
                })
                .collect(),
            dropped: self
                .fleet
                .dropped
                .iter()
                .map(|&slot| fleet::client_name(slot))
                .collect(),
            funding: self.funding.clone(),
            mixing: self.mixing.clone(),
            archive: None,
            harvest_error: None,
        }
    }

    /// Not cancellable: stop mixing, collect, tear down.
    async fn shutdown(&mut self, result: &Result<(), SimulationError>) -> RunSummary {
        harvest::stop_mixing(&self.ctx, &mut self.fleet).await;

        let mut summary = self.summary(result);
        if self.ctx.config.collect_logs {
            match harvest::collect(&self.ctx, &self.scenario, &self.infra, &self.fleet, &summary).await {
                Ok(archive) => summary.archive = Some(archive),
                Err(e) => {
                    error!(error = %e, "Could not collect logs");
                    summary.harvest_error = Some(e.to_string());
                }
            }
        }

        if let Err(e) = harvest::teardown(&self.ctx, &mut self.fleet, &mut self.infra).await {
            error!(error = %e, "Teardown failed");
            summary.harvest_error.get_or_insert_with(|| e.to_string());
        }
        summary
    }
}
