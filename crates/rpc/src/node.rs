//! Ledger node client (bitcoind JSON-RPC).

use crate::{CallOptions, JsonRpcClient, Ledger, RpcError};
use async_trait::async_trait;
use mixsim_types::{Amount, Endpoint};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const RPC_USER: &str = "user";
const RPC_PASSWORD: &str = "password";

/// Route of the node wallet used for mining rewards and funding.
const WALLET_PATH: &str = "/wallet/wallet";

const CALL: CallOptions = CallOptions::new(Duration::from_secs(30));

pub struct NodeClient {
    rpc: JsonRpcClient,
}

impl NodeClient {
    pub fn new(endpoint: &Endpoint, proxy: Option<&str>) -> Result<Self, RpcError> {
        let rpc = JsonRpcClient::new(endpoint.url(), proxy)?.with_basic_auth(RPC_USER, RPC_PASSWORD);
        Ok(Self { rpc })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.rpc.call("/", method, params, CALL).await
    }

    async fn wallet_call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.rpc.call(WALLET_PATH, method, params, CALL).await
    }
}

fn as_u64(method: &str, value: Value) -> Result<u64, RpcError> {
    value
        .as_u64()
        .ok_or_else(|| RpcError::invalid(method, format!("expected integer, got {value}")))
}

fn as_string(method: &str, value: Value) -> Result<String, RpcError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(RpcError::invalid(method, format!("expected string, got {other}"))),
    }
}

#[async_trait]
impl Ledger for NodeClient {
    async fn block_count(&self) -> Result<u64, RpcError> {
        as_u64("getblockcount", self.call("getblockcount", json!([])).await?)
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        as_string("getblockhash", self.call("getblockhash", json!([height])).await?)
    }

    async fn block(&self, hash: &str) -> Result<Value, RpcError> {
        self.call("getblock", json!([hash, 2])).await
    }

    async fn mine_blocks(&self, count: u64) -> Result<(), RpcError> {
        let before = self.block_count().await?;
        let address = as_string(
            "getnewaddress",
            self.wallet_call("getnewaddress", json!([])).await?,
        )?;
        self.call("generatetoaddress", json!([count, address])).await?;

        let after = self.block_count().await?;
        if after < before + count {
            return Err(RpcError::invalid(
                "generatetoaddress",
                format!("height went from {before} to {after}, expected +{count}"),
            ));
        }
        debug!(count, height = after, "Mined blocks");
        Ok(())
    }

    async fn fund_address(&self, address: &str, amount: Amount) -> Result<String, RpcError> {
        let txid = self
            .wallet_call("sendtoaddress", json!([address, amount.to_btc_string()]))
            .await?;
        as_string("sendtoaddress", txid)
    }
}
