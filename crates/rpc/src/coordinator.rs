//! Mixing coordinator client.

use crate::{Coordinator, JsonRpcClient, RpcError};
use async_trait::async_trait;
use mixsim_types::Endpoint;
use serde_json::Value;
use std::time::Duration;

const STATUS_PATH: &str = "/api/v4/btc/Blockchain/status";

const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CoordinatorClient {
    rpc: JsonRpcClient,
}

impl CoordinatorClient {
    pub fn new(endpoint: &Endpoint, proxy: Option<&str>) -> Result<Self, RpcError> {
        Ok(Self {
            rpc: JsonRpcClient::new(endpoint.url(), proxy)?,
        })
    }
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn status(&self) -> Result<Value, RpcError> {
        self.rpc.get(STATUS_PATH, STATUS_TIMEOUT).await
    }
}
