//! Simulation orchestrator for coin-mixing load tests.
//!
//! A run brings up a ledger node, a mixing coordinator and a distributor
//! wallet, provisions a fleet of wallet clients, funds them, then starts and
//! stops their mixing participation round by round until the scenario's
//! limits are reached. Whatever happens, the run ends by collecting
//! artifacts and tearing everything down.
//!
//! # Phases
//!
//! | Phase | Module |
//! |-------|--------|
//! | Image preparation | [`images`] |
//! | Infrastructure bringup | [`infra`] |
//! | Fleet provisioning | [`fleet`] |
//! | Funding | [`funding`] |
//! | Mixing | [`scheduler`] |
//! | Shutdown & harvest | [`harvest`] |
//!
//! [`Simulation`] sequences them.

pub mod config;
pub mod error;
pub mod fleet;
pub mod funding;
pub mod genscen;
pub mod harvest;
pub mod images;
pub mod infra;
pub mod probe;
pub mod runner;
pub mod scheduler;

pub use config::{ConfigError, SimulationConfig};
pub use error::{HarvestError, SimulationError};
pub use fleet::{ClientRecord, Fleet, Participation};
pub use funding::{FundingOutcome, FundingReport};
pub use infra::{Infrastructure, Managed, Wiring};
pub use runner::{RunSummary, Simulation, Termination};

use mixsim_driver::Driver;
use mixsim_rpc::Connector;
use std::sync::Arc;

/// What every phase works with: the runtime, the RPC client factory and the
/// configuration.
#[derive(Clone)]
pub struct Context {
    pub driver: Arc<dyn Driver>,
    pub connector: Arc<dyn Connector>,
    pub config: SimulationConfig,
}

impl Context {
    pub fn new(
        driver: Arc<dyn Driver>,
        connector: Arc<dyn Connector>,
        config: SimulationConfig,
    ) -> Self {
        Self {
            driver,
            connector,
            config,
        }
    }
}
