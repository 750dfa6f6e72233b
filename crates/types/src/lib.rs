//! Core types shared by the mixsim crates.
//!
//! - [`EntityHandle`]: one running instance owned by the orchestrator
//! - [`Amount`]: satoshi-denominated amounts
//! - [`ClientVersion`]: declared wallet-client versions and their feature gates
//! - [`Scenario`]: the immutable description of a load-test run
//! - [`Invoice`]: the unit of fleet funding

mod amount;
mod entity;
mod invoice;
mod scenario;
mod version;

pub use amount::Amount;
pub use entity::{Endpoint, EntityHandle, EntityState, Resources};
pub use invoice::{batched, Invoice};
pub use scenario::{Scenario, ScenarioError, WalletSpec};
pub use version::{ClientVersion, VersionError};
