//! Clients for the external services driven during a simulation.
//!
//! The orchestrator depends on the [`Ledger`], [`Coordinator`] and [`Wallet`]
//! traits only; [`RpcConnector`] builds the HTTP implementations and tests
//! substitute in-memory fakes through the [`Connector`] seam.

mod coordinator;
mod error;
mod jsonrpc;
mod node;
mod wallet;

pub use coordinator::CoordinatorClient;
pub use error::RpcError;
pub use jsonrpc::{CallOptions, JsonRpcClient};
pub use node::NodeClient;
pub use wallet::{select_coins, ClientVariant, WalletClient};

use async_trait::async_trait;
use mixsim_types::{Amount, ClientVersion, Endpoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// One unspent output as reported by a wallet client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub txid: String,
    pub index: u32,
    pub amount: Amount,
    #[serde(default)]
    pub confirmed: bool,
}

/// A single output of a payment transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub address: String,
    pub amount: Amount,
}

impl Payment {
    pub fn new(address: impl Into<String>, amount: Amount) -> Self {
        Self {
            address: address.into(),
            amount,
        }
    }
}

/// The ledger node (regtest).
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn block_count(&self) -> Result<u64, RpcError>;

    async fn block_hash(&self, height: u64) -> Result<String, RpcError>;

    /// Fully decoded block (verbosity 2).
    async fn block(&self, hash: &str) -> Result<Value, RpcError>;

    /// Mine `count` blocks to a fresh node-wallet address.
    async fn mine_blocks(&self, count: u64) -> Result<(), RpcError>;

    /// Pay `amount` from the node wallet to `address`. Returns the txid.
    async fn fund_address(&self, address: &str, amount: Amount) -> Result<String, RpcError>;
}

/// The mixing coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Blockchain status; any successful answer means the coordinator is up.
    async fn status(&self) -> Result<Value, RpcError>;
}

/// A wallet client, whatever its protocol version.
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Create (if needed) and open the simulation wallet, then confirm it
    /// answers a balance query.
    async fn open_wallet(&self) -> Result<(), RpcError>;

    async fn new_address(&self) -> Result<String, RpcError>;

    async fn balance(&self) -> Result<Amount, RpcError>;

    /// Build and broadcast one transaction paying every `payments` entry.
    async fn send(&self, payments: &[Payment]) -> Result<Value, RpcError>;

    async fn start_mixing(&self) -> Result<(), RpcError>;

    async fn stop_mixing(&self) -> Result<(), RpcError>;

    async fn list_coins(&self) -> Result<Value, RpcError>;

    async fn list_unspent_coins(&self) -> Result<Value, RpcError>;

    async fn list_keys(&self) -> Result<Value, RpcError>;
}

/// Builds clients for freshly started entities.
pub trait Connector: Send + Sync {
    fn ledger(&self, endpoint: &Endpoint) -> Result<Arc<dyn Ledger>, RpcError>;

    fn coordinator(&self, endpoint: &Endpoint) -> Result<Arc<dyn Coordinator>, RpcError>;

    fn wallet(
        &self,
        name: &str,
        endpoint: &Endpoint,
        version: &ClientVersion,
    ) -> Result<Arc<dyn Wallet>, RpcError>;
}

/// [`Connector`] over HTTP JSON-RPC.
#[derive(Debug, Clone, Default)]
pub struct RpcConnector {
    proxy: Option<String>,
}

impl RpcConnector {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            proxy: proxy.filter(|p| !p.is_empty()),
        }
    }
}

impl Connector for RpcConnector {
    fn ledger(&self, endpoint: &Endpoint) -> Result<Arc<dyn Ledger>, RpcError> {
        Ok(Arc::new(NodeClient::new(endpoint, self.proxy.as_deref())?))
    }

    fn coordinator(&self, endpoint: &Endpoint) -> Result<Arc<dyn Coordinator>, RpcError> {
        Ok(Arc::new(CoordinatorClient::new(
            endpoint,
            self.proxy.as_deref(),
        )?))
    }

    fn wallet(
        &self,
        name: &str,
        endpoint: &Endpoint,
        version: &ClientVersion,
    ) -> Result<Arc<dyn Wallet>, RpcError> {
        Ok(Arc::new(WalletClient::new(
            name,
            endpoint,
            version,
            self.proxy.as_deref(),
        )?))
    }
}
