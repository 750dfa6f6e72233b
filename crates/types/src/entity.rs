//! Handles for running instances owned by the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host and port through which an entity's RPC interface is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base HTTP URL, without trailing slash.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// CPU and memory requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores (fractional).
    pub cpu: f64,
    /// Memory in MiB.
    pub memory_mib: u64,
}

impl Resources {
    pub const fn new(cpu: f64, memory_mib: u64) -> Self {
        Self { cpu, memory_mib }
    }
}

/// Liveness of an entity as tracked by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Instance launched, readiness not yet confirmed.
    Starting,
    /// Readiness probe succeeded.
    Ready,
    /// Launch or readiness probe failed.
    Failed,
    /// Instance stopped.
    Stopped,
}

/// One running instance: the ledger node, the coordinator, the distributor
/// or a fleet client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityHandle {
    /// Stable runtime name (container / pod name).
    pub name: String,

    /// Endpoint used by the orchestrator to reach the entity.
    pub endpoint: Endpoint,

    /// Address inside the runtime network, used for entity-to-entity wiring.
    pub internal_address: String,

    /// Resources requested at launch.
    pub resources: Resources,

    /// Current liveness state.
    pub state: EntityState,
}

impl EntityHandle {
    /// Handle for a freshly launched instance.
    pub fn starting(
        name: impl Into<String>,
        endpoint: Endpoint,
        internal_address: impl Into<String>,
        resources: Resources,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint,
            internal_address: internal_address.into(),
            resources,
            state: EntityState::Starting,
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = EntityState::Ready;
    }

    pub fn mark_failed(&mut self) {
        self.state = EntityState::Failed;
    }

    pub fn mark_stopped(&mut self) {
        self.state = EntityState::Stopped;
    }

    pub fn is_ready(&self) -> bool {
        self.state == EntityState::Ready
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.endpoint)
    }
}
