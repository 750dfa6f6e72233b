//! Fake ledger, coordinator and wallets sharing one in-memory state.

use async_trait::async_trait;
use mixsim_rpc::{Connector, Coordinator, Ledger, Payment, RpcError, Wallet};
use mixsim_types::{Amount, ClientVersion, Endpoint};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct WalletState {
    balance: Amount,
    /// Credits land but are never reported by `balance`.
    frozen: bool,
    mixing: bool,
    starts: u32,
    stops: u32,
    open_failures: u32,
    start_failures: u32,
    send_times_out: bool,
    opened: bool,
}

#[derive(Default)]
struct State {
    height: u64,
    /// Added to the height after every `block_count` read.
    blocks_per_read: u64,
    coordinator_down: bool,
    wallets: HashMap<String, WalletState>,
    owners: HashMap<String, String>,
    next_address: u64,
    batches: Vec<Vec<Payment>>,
    fundings: Vec<(String, Amount)>,
}

/// The shared state behind every fake client.
#[derive(Default)]
pub struct FakeNetwork {
    state: Mutex<State>,
}

impl FakeNetwork {
    /// A network whose ledger is already past the readiness height.
    pub fn new() -> Arc<Self> {
        let network = Self::default();
        network.state.lock().height = 101;
        Arc::new(network)
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Advance the chain by `blocks` after every height read.
    pub fn mine_on_read(&self, blocks: u64) {
        self.state.lock().blocks_per_read = blocks;
    }

    pub fn set_coordinator_down(&self, down: bool) {
        self.state.lock().coordinator_down = down;
    }

    pub fn set_balance(&self, wallet: &str, balance: Amount) {
        self.state
            .lock()
            .wallets
            .entry(wallet.to_string())
            .or_default()
            .balance = balance;
    }

    pub fn balance(&self, wallet: &str) -> Amount {
        self.state
            .lock()
            .wallets
            .get(wallet)
            .map(|w| w.balance)
            .unwrap_or_default()
    }

    /// Keep reporting the current balance of `wallet` whatever it receives.
    pub fn freeze_balance(&self, wallet: &str) {
        self.state
            .lock()
            .wallets
            .entry(wallet.to_string())
            .or_default()
            .frozen = true;
    }

    /// Make the next `times` wallet opens of `wallet` fail.
    pub fn fail_open(&self, wallet: &str, times: u32) {
        self.state
            .lock()
            .wallets
            .entry(wallet.to_string())
            .or_default()
            .open_failures = times;
    }

    /// Make the next `times` mixing starts of `wallet` fail.
    pub fn fail_start(&self, wallet: &str, times: u32) {
        self.state
            .lock()
            .wallets
            .entry(wallet.to_string())
            .or_default()
            .start_failures = times;
    }

    /// Make every `send` of `wallet` time out.
    pub fn send_times_out(&self, wallet: &str) {
        self.state
            .lock()
            .wallets
            .entry(wallet.to_string())
            .or_default()
            .send_times_out = true;
    }

    pub fn is_mixing(&self, wallet: &str) -> bool {
        self.state
            .lock()
            .wallets
            .get(wallet)
            .is_some_and(|w| w.mixing)
    }

    /// (starts, stops) issued to `wallet`.
    pub fn mixing_calls(&self, wallet: &str) -> (u32, u32) {
        self.state
            .lock()
            .wallets
            .get(wallet)
            .map(|w| (w.starts, w.stops))
            .unwrap_or_default()
    }

    pub fn is_opened(&self, wallet: &str) -> bool {
        self.state
            .lock()
            .wallets
            .get(wallet)
            .is_some_and(|w| w.opened)
    }

    /// Payments of every successful `send`, in submission order.
    pub fn batches(&self) -> Vec<Vec<Payment>> {
        self.state.lock().batches.clone()
    }

    /// Owner wallet of an address handed out by `new_address`.
    pub fn owner(&self, address: &str) -> Option<String> {
        self.state.lock().owners.get(address).cloned()
    }

    /// Ledger-to-address payments, in order.
    pub fn fundings(&self) -> Vec<(String, Amount)> {
        self.state.lock().fundings.clone()
    }
}

impl State {
    fn credit(&mut self, address: &str, amount: Amount) {
        if let Some(owner) = self.owners.get(address).cloned() {
            self.wallets.entry(owner).or_default().balance += amount;
        }
    }
}

pub struct FakeLedger {
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn block_count(&self) -> Result<u64, RpcError> {
        let mut state = self.network.state.lock();
        let height = state.height;
        let step = state.blocks_per_read;
        state.height += step;
        Ok(height)
    }

    async fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        Ok(format!("hash-{height}"))
    }

    async fn block(&self, hash: &str) -> Result<Value, RpcError> {
        Ok(json!({ "hash": hash, "tx": [] }))
    }

    async fn mine_blocks(&self, count: u64) -> Result<(), RpcError> {
        self.network.state.lock().height += count;
        Ok(())
    }

    async fn fund_address(&self, address: &str, amount: Amount) -> Result<String, RpcError> {
        let mut state = self.network.state.lock();
        state.fundings.push((address.to_string(), amount));
        state.credit(address, amount);
        Ok(format!("txid-{}", state.fundings.len()))
    }
}

pub struct FakeCoordinator {
    network: Arc<FakeNetwork>,
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn status(&self) -> Result<Value, RpcError> {
        if self.network.state.lock().coordinator_down {
            return Err(RpcError::Timeout("status".to_string()));
        }
        Ok(json!({ "filters": 0 }))
    }
}

pub struct FakeWallet {
    name: String,
    network: Arc<FakeNetwork>,
}

impl FakeWallet {
    fn with_state<T>(&self, f: impl FnOnce(&mut WalletState) -> T) -> T {
        let mut state = self.network.state.lock();
        f(state.wallets.entry(self.name.clone()).or_default())
    }
}

#[async_trait]
impl Wallet for FakeWallet {
    async fn open_wallet(&self) -> Result<(), RpcError> {
        self.with_state(|w| {
            if w.open_failures > 0 {
                w.open_failures -= 1;
                return Err(RpcError::Remote {
                    method: "getwalletinfo".to_string(),
                    message: "Wallet is not fully loaded yet".to_string(),
                });
            }
            w.opened = true;
            Ok(())
        })
    }

    async fn new_address(&self) -> Result<String, RpcError> {
        let mut state = self.network.state.lock();
        state.next_address += 1;
        let address = format!("bcrt1q{}{:04}", self.name.replace('-', ""), state.next_address);
        state.owners.insert(address.clone(), self.name.clone());
        Ok(address)
    }

    async fn balance(&self) -> Result<Amount, RpcError> {
        let state = self.network.state.lock();
        Ok(state
            .wallets
            .get(&self.name)
            .filter(|w| !w.frozen)
            .map(|w| w.balance)
            .unwrap_or_default())
    }

    async fn send(&self, payments: &[Payment]) -> Result<Value, RpcError> {
        let mut state = self.network.state.lock();
        let cost: Amount = payments.iter().map(|p| p.amount).sum();
        let wallet = state.wallets.entry(self.name.clone()).or_default();
        if wallet.send_times_out {
            return Err(RpcError::Timeout("send".to_string()));
        }
        if wallet.balance <= cost {
            return Err(RpcError::InsufficientFunds {
                needed: cost,
                available: wallet.balance,
            });
        }
        wallet.balance = wallet.balance.saturating_sub(cost);

        for payment in payments {
            state.credit(&payment.address, payment.amount);
        }
        state.batches.push(payments.to_vec());
        Ok(json!({ "txid": format!("batch-{}", state.batches.len()) }))
    }

    async fn start_mixing(&self) -> Result<(), RpcError> {
        self.with_state(|w| {
            if w.start_failures > 0 {
                w.start_failures -= 1;
                return Err(RpcError::Timeout("startcoinjoin".to_string()));
            }
            w.starts += 1;
            w.mixing = true;
            Ok(())
        })
    }

    async fn stop_mixing(&self) -> Result<(), RpcError> {
        self.with_state(|w| {
            w.stops += 1;
            w.mixing = false;
        });
        Ok(())
    }

    async fn list_coins(&self) -> Result<Value, RpcError> {
        let balance = self.with_state(|w| w.balance);
        Ok(json!([{ "txid": "00", "index": 0, "amount": balance, "confirmed": true }]))
    }

    async fn list_unspent_coins(&self) -> Result<Value, RpcError> {
        self.list_coins().await
    }

    async fn list_keys(&self) -> Result<Value, RpcError> {
        Ok(json!([{ "fullKeyPath": "84'/0'/0'/0/0" }]))
    }
}

/// [`Connector`] handing out clients of one [`FakeNetwork`].
#[derive(Clone)]
pub struct FakeConnector {
    network: Arc<FakeNetwork>,
}

impl FakeConnector {
    pub fn new(network: Arc<FakeNetwork>) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &Arc<FakeNetwork> {
        &self.network
    }

    pub fn fake_ledger(&self) -> FakeLedger {
        FakeLedger {
            network: self.network.clone(),
        }
    }

    pub fn fake_wallet(&self, name: &str) -> FakeWallet {
        FakeWallet {
            name: name.to_string(),
            network: self.network.clone(),
        }
    }
}

impl Connector for FakeConnector {
    fn ledger(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Ledger>, RpcError> {
        Ok(Arc::new(self.fake_ledger()))
    }

    fn coordinator(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Coordinator>, RpcError> {
        Ok(Arc::new(FakeCoordinator {
            network: self.network.clone(),
        }))
    }

    fn wallet(
        &self,
        name: &str,
        _endpoint: &Endpoint,
        _version: &ClientVersion,
    ) -> Result<Arc<dyn Wallet>, RpcError> {
        Ok(Arc::new(self.fake_wallet(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payments_credit_address_owner() {
        let network = FakeNetwork::new();
        let connector = FakeConnector::new(network.clone());
        let distributor = connector.fake_wallet("wasabi-client-distributor");
        let client = connector.fake_wallet("wasabi-client-000");

        let seed = distributor.new_address().await.unwrap();
        connector
            .fake_ledger()
            .fund_address(&seed, Amount::from_btc(10))
            .await
            .unwrap();
        assert_eq!(distributor.balance().await.unwrap(), Amount::from_btc(10));

        let address = client.new_address().await.unwrap();
        assert_eq!(network.owner(&address).as_deref(), Some("wasabi-client-000"));
        distributor
            .send(&[Payment::new(address, Amount::from_sat(700_000))])
            .await
            .unwrap();
        assert_eq!(client.balance().await.unwrap(), Amount::from_sat(700_000));
        assert_eq!(network.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_programmed_failures() {
        let network = FakeNetwork::new();
        let connector = FakeConnector::new(network.clone());
        let wallet = connector.fake_wallet("wasabi-client-002");

        network.fail_open("wasabi-client-002", 1);
        assert!(wallet.open_wallet().await.is_err());
        wallet.open_wallet().await.unwrap();
        assert!(network.is_opened("wasabi-client-002"));

        network.send_times_out("wasabi-client-002");
        let err = wallet
            .send(&[Payment::new("x", Amount::from_sat(1))])
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        network.fail_start("wasabi-client-002", 1);
        assert!(wallet.start_mixing().await.is_err());
        wallet.start_mixing().await.unwrap();
        assert!(network.is_mixing("wasabi-client-002"));
        assert_eq!(network.mixing_calls("wasabi-client-002"), (1, 0));
    }

    #[tokio::test]
    async fn test_mine_on_read() {
        let network = FakeNetwork::new();
        network.mine_on_read(2);
        let ledger = FakeConnector::new(network.clone()).fake_ledger();
        assert_eq!(ledger.block_count().await.unwrap(), 101);
        assert_eq!(ledger.block_count().await.unwrap(), 103);
    }
}
