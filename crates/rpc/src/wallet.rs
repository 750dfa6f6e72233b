//! Wallet client JSON-RPC, across protocol versions.

use crate::{CallOptions, Coin, JsonRpcClient, Payment, RpcError, Wallet};
use async_trait::async_trait;
use mixsim_types::{Amount, ClientVersion, Endpoint};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the wallet every client creates and mixes with.
const WALLET_NAME: &str = "wallet";

/// Blocks targeted by the fee estimate of funding transactions.
const FEE_TARGET: u32 = 2;

const DEFAULT_CALL: CallOptions = CallOptions::new(Duration::from_secs(5));

const SELECT_CALL: CallOptions = CallOptions::new(Duration::from_secs(5)).with_attempts(10);

const QUEUE_CALL: CallOptions = CallOptions::new(Duration::from_secs(5)).with_attempts(3);

/// Transaction building and mixing start can take a while on a loaded host.
const SUBMIT_CALL: CallOptions = CallOptions::new(Duration::from_secs(60));

const LIST_CALL: CallOptions = CallOptions::new(Duration::from_secs(10)).with_attempts(3);

/// Wire-level behaviour of a wallet client version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientVariant {
    /// Before 2.0.0: mixing by enqueueing confirmed coins, no `listcoins`.
    Legacy,
    /// 2.0.0 up to 2.0.4: global route, wallet must be selected.
    Wasabi2,
    /// 2.0.4 and later: wallet-scoped route.
    Wasabi204,
}

impl ClientVariant {
    pub fn of(version: &ClientVersion) -> Self {
        if *version < ClientVersion::v2_0_0() {
            ClientVariant::Legacy
        } else if *version < ClientVersion::v2_0_4() {
            ClientVariant::Wasabi2
        } else {
            ClientVariant::Wasabi204
        }
    }

    /// Route of wallet-scoped calls.
    fn wallet_path(self) -> &'static str {
        match self {
            ClientVariant::Wasabi204 => "/wallet",
            ClientVariant::Legacy | ClientVariant::Wasabi2 => "/",
        }
    }

    fn needs_select(self) -> bool {
        !matches!(self, ClientVariant::Wasabi204)
    }
}

/// Select coins from `unspent`, in order, until their sum strictly exceeds
/// `cost`.
pub fn select_coins(unspent: &[Coin], cost: Amount) -> Result<Vec<&Coin>, RpcError> {
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for coin in unspent {
        selected.push(coin);
        total += coin.amount;
        if total > cost {
            return Ok(selected);
        }
    }
    Err(RpcError::InsufficientFunds {
        needed: cost,
        available: total,
    })
}

fn coin_refs<'a>(coins: impl IntoIterator<Item = &'a Coin>) -> Vec<Value> {
    coins
        .into_iter()
        .map(|coin| json!({ "transactionid": coin.txid, "index": coin.index }))
        .collect()
}

/// HTTP client for one wallet instance.
pub struct WalletClient {
    name: String,
    rpc: JsonRpcClient,
    variant: ClientVariant,
}

impl WalletClient {
    pub fn new(
        name: impl Into<String>,
        endpoint: &Endpoint,
        version: &ClientVersion,
        proxy: Option<&str>,
    ) -> Result<Self, RpcError> {
        Ok(Self {
            name: name.into(),
            rpc: JsonRpcClient::new(endpoint.url(), proxy)?,
            variant: ClientVariant::of(version),
        })
    }

    pub fn variant(&self) -> ClientVariant {
        self.variant
    }

    async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value, RpcError> {
        self.rpc
            .call(self.variant.wallet_path(), method, params, options)
            .await
    }

    async fn select(&self) -> Result<(), RpcError> {
        self.rpc
            .call("/", "selectwallet", json!([WALLET_NAME]), SELECT_CALL)
            .await?;
        Ok(())
    }

    async fn unspent(&self, options: CallOptions) -> Result<Vec<Coin>, RpcError> {
        let value = self.call("listunspentcoins", Value::Null, options).await?;
        serde_json::from_value(value).map_err(|e| RpcError::invalid("listunspentcoins", e.to_string()))
    }

    /// Enqueue (or dequeue) every confirmed coin for mixing.
    async fn queue_confirmed(&self, method: &str) -> Result<(), RpcError> {
        let coins = self.unspent(LIST_CALL).await?;
        let confirmed = coin_refs(coins.iter().filter(|coin| coin.confirmed));
        debug!(wallet = %self.name, method, count = confirmed.len(), "Queueing coins");
        self.call(
            method,
            json!({ "coins": confirmed, "password": "" }),
            QUEUE_CALL,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Wallet for WalletClient {
    async fn open_wallet(&self) -> Result<(), RpcError> {
        // Fails when the wallet already exists, which is fine.
        if let Err(e) = self
            .call("createwallet", json!([WALLET_NAME, ""]), DEFAULT_CALL)
            .await
        {
            debug!(wallet = %self.name, error = %e, "createwallet");
        }
        if self.variant.needs_select() {
            self.select().await?;
        }
        self.balance().await?;
        Ok(())
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        let result = self
            .call("getnewaddress", json!(["label"]), DEFAULT_CALL)
            .await?;
        result
            .get("address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::invalid("getnewaddress", format!("no address in {result}")))
    }

    async fn balance(&self) -> Result<Amount, RpcError> {
        let result = self.call("getwalletinfo", Value::Null, DEFAULT_CALL).await?;
        result
            .get("balance")
            .and_then(Value::as_u64)
            .map(Amount::from_sat)
            .ok_or_else(|| RpcError::invalid("getwalletinfo", format!("no balance in {result}")))
    }

    async fn send(&self, payments: &[Payment]) -> Result<Value, RpcError> {
        let mut unspent = self.unspent(DEFAULT_CALL).await?;
        unspent.shuffle(&mut rand::thread_rng());

        let cost: Amount = payments.iter().map(|p| p.amount).sum();
        let coins = coin_refs(select_coins(&unspent, cost)?);
        let payments: Vec<Value> = payments
            .iter()
            .map(|p| json!({ "sendto": p.address, "amount": p.amount }))
            .collect();

        self.call(
            "send",
            json!({
                "payments": payments,
                "coins": coins,
                "feeTarget": FEE_TARGET,
                "password": "",
            }),
            SUBMIT_CALL,
        )
        .await
    }

    async fn start_mixing(&self) -> Result<(), RpcError> {
        match self.variant {
            ClientVariant::Legacy => self.queue_confirmed("enqueue").await?,
            ClientVariant::Wasabi2 | ClientVariant::Wasabi204 => {
                self.call("startcoinjoin", json!(["", "True", "True"]), SUBMIT_CALL)
                    .await?;
            }
        }
        info!(wallet = %self.name, "Mixing started");
        Ok(())
    }

    async fn stop_mixing(&self) -> Result<(), RpcError> {
        match self.variant {
            ClientVariant::Legacy => self.queue_confirmed("dequeue").await?,
            ClientVariant::Wasabi2 | ClientVariant::Wasabi204 => {
                self.call("stopcoinjoin", Value::Null, DEFAULT_CALL).await?;
            }
        }
        info!(wallet = %self.name, "Mixing stopped");
        Ok(())
    }

    async fn list_coins(&self) -> Result<Value, RpcError> {
        if self.variant == ClientVariant::Legacy {
            return Err(RpcError::Unsupported("listcoins"));
        }
        self.call("listcoins", Value::Null, LIST_CALL).await
    }

    async fn list_unspent_coins(&self) -> Result<Value, RpcError> {
        self.call("listunspentcoins", Value::Null, LIST_CALL).await
    }

    async fn list_keys(&self) -> Result<Value, RpcError> {
        self.call("listkeys", Value::Null, LIST_CALL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn coin(txid: &str, sats: u64) -> Coin {
        Coin {
            txid: txid.to_string(),
            index: 0,
            amount: Amount::from_sat(sats),
            confirmed: true,
        }
    }

    #[test]
    fn test_variant_selection() {
        let v = |s: &str| s.parse::<ClientVersion>().unwrap();
        assert_eq!(ClientVariant::of(&v("1.1.12.9")), ClientVariant::Legacy);
        assert_eq!(ClientVariant::of(&v("2.0.0")), ClientVariant::Wasabi2);
        assert_eq!(ClientVariant::of(&v("2.0.3")), ClientVariant::Wasabi2);
        assert_eq!(ClientVariant::of(&v("2.0.4")), ClientVariant::Wasabi204);
        assert_eq!(ClientVariant::of(&v("2.1")), ClientVariant::Wasabi204);

        assert_eq!(ClientVariant::Wasabi204.wallet_path(), "/wallet");
        assert_eq!(ClientVariant::Wasabi2.wallet_path(), "/");
        assert!(ClientVariant::Legacy.needs_select());
        assert!(!ClientVariant::Wasabi204.needs_select());
    }

    #[test]
    fn test_select_coins_strictly_exceeds_cost() {
        let unspent = vec![coin("a", 300), coin("b", 200), coin("c", 500)];

        // 300 + 200 = 500 does not exceed 500, so the third coin is needed.
        let selected = select_coins(&unspent, Amount::from_sat(500)).unwrap();
        assert_eq!(selected.len(), 3);

        let selected = select_coins(&unspent, Amount::from_sat(299)).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].txid, "a");
    }

    #[test]
    fn test_select_coins_not_enough() {
        let unspent = vec![coin("a", 300), coin("b", 200)];
        let err = select_coins(&unspent, Amount::from_sat(500)).unwrap_err();
        assert!(matches!(
            err,
            RpcError::InsufficientFunds { available, .. } if available == Amount::from_sat(500)
        ));
        assert!(select_coins(&[], Amount::ZERO).is_err());
    }

    #[test]
    fn test_shuffled_selection_covers_cost() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut unspent: Vec<Coin> = (0..20).map(|i| coin(&format!("tx{i}"), 10_000)).collect();
        for _ in 0..10 {
            unspent.shuffle(&mut rng);
            let selected = select_coins(&unspent, Amount::from_sat(45_000)).unwrap();
            assert_eq!(selected.len(), 5);
        }
    }

    #[test]
    fn test_coin_deserialization() {
        let value = json!([
            { "txid": "ab", "index": 1, "amount": 5000, "confirmed": true, "anonymityScore": 1 },
            { "txid": "cd", "index": 0, "amount": 7000 }
        ]);
        let coins: Vec<Coin> = serde_json::from_value(value).unwrap();
        assert_eq!(coins[0].amount, Amount::from_sat(5000));
        assert!(!coins[1].confirmed);
        assert_eq!(coin_refs(&coins)[1], json!({ "transactionid": "cd", "index": 0 }));
    }
}
