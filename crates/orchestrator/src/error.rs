//! Orchestrator error types.

use mixsim_driver::DriverError;
use mixsim_rpc::RpcError;
use mixsim_types::ScenarioError;
use std::path::PathBuf;
use thiserror::Error;

/// Outcomes that abort the main phases of a run. Shutdown & harvest still
/// run afterwards.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Infrastructure bringup failed at {stage}: {reason}")]
    Bringup { stage: &'static str, reason: String },

    #[error("Funding batch {batch} timed out")]
    FundingTimeout { batch: usize },

    #[error("Funding batch {batch} failed: {source}")]
    Funding {
        batch: usize,
        #[source]
        source: RpcError,
    },

    #[error("Interrupted by operator")]
    Interrupted,
}

impl SimulationError {
    pub(crate) fn bringup(stage: &'static str, reason: impl ToString) -> Self {
        SimulationError::Bringup {
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Failures while collecting or archiving artifacts.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot serialize artifact: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Teardown failed: {0}")]
    Driver(#[from] DriverError),
}

impl HarvestError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| HarvestError::Io { path, source }
    }
}

/// Failures generating a scenario file.
#[derive(Debug, Error)]
pub enum GenscenError {
    #[error("File {0} already exists")]
    Exists(PathBuf),

    #[error("Invalid options: {0}")]
    Invalid(String),

    #[error("Cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Scenario(#[from] ScenarioError),
}
