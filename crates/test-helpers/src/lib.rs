//! Test doubles for mixsim.
//!
//! - [`MemoryDriver`]: an in-memory [`Driver`](mixsim_driver::Driver) with
//!   programmable launch failures, per-entity files and a call history.
//! - [`FakeNetwork`]: a shared fake ledger in which wallets hold balances and
//!   payments credit whichever wallet owns the destination address. It hands
//!   out [`FakeLedger`], [`FakeCoordinator`] and [`FakeWallet`] clients
//!   through [`FakeConnector`].

mod driver;
mod network;

pub use driver::{DriverCall, MemoryDriver};
pub use network::{FakeConnector, FakeCoordinator, FakeLedger, FakeNetwork, FakeWallet};
