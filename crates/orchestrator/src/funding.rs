//! Funding: seed the distributor from the ledger node, then pay every fleet
//! client from the distributor and wait for the balances to converge.

use crate::error::SimulationError;
use crate::fleet::{ClientRecord, Fleet};
use crate::{Context, SimulationConfig};
use futures::stream::{self, StreamExt};
use mixsim_rpc::{Ledger, Payment, Wallet};
use mixsim_types::{batched, Amount, Invoice, Scenario};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// How waiting for a client balance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FundingOutcome {
    Funded { balance: Amount },
    TimedOut { balance: Amount },
}

impl FundingOutcome {
    pub fn is_funded(&self) -> bool {
        matches!(self, FundingOutcome::Funded { .. })
    }
}

/// How seeding the distributor ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeedOutcome {
    Funded { balance: Amount },
    /// The balance stopped moving below the target.
    Stalled { balance: Amount },
    TimedOut { balance: Amount },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FundingReport {
    pub distributor: Option<SeedOutcome>,
    pub invoices: usize,
    pub batches_sent: usize,
    pub clients: BTreeMap<String, FundingOutcome>,
}

async fn read_balance(wallet: &dyn Wallet, config: &SimulationConfig) -> Option<Amount> {
    match tokio::time::timeout(config.balance_read_timeout, wallet.balance()).await {
        Ok(Ok(balance)) => Some(balance),
        Ok(Err(e)) => {
            debug!(error = %e, "Balance read failed");
            None
        }
        Err(_) => {
            debug!("Balance read timed out");
            None
        }
    }
}

/// Mine one block so that the transactions just sent confirm. A failure is
/// logged; the balance waits that follow are bounded anyway.
async fn confirm(ledger: &dyn Ledger, what: &str) {
    match ledger.mine_blocks(1).await {
        Ok(()) => debug!(what, "Mined confirmation block"),
        Err(e) => warn!(what, error = %e, "Could not mine confirmation block"),
    }
}

/// Seed the distributor with `distributor_utxos` outputs, confirm them and
/// wait until its balance shows them. Never fatal: the outcome is reported.
pub async fn fund_distributor(
    ledger: &dyn Ledger,
    distributor: &dyn Wallet,
    config: &SimulationConfig,
) -> SeedOutcome {
    let total = Amount::from_btc(config.distributor_funds_btc);
    let per_output = total.split_ceil(config.distributor_utxos);
    info!(total = %total, outputs = config.distributor_utxos, "Funding distributor");

    let mut target = Amount::ZERO;
    for output in 0..config.distributor_utxos {
        let funded = match distributor.new_address().await {
            Ok(address) => ledger.fund_address(&address, per_output).await,
            Err(e) => Err(e),
        };
        match funded {
            Ok(txid) => {
                debug!(output, %txid, "Funded distributor output");
                target += per_output;
            }
            Err(e) => warn!(output, error = %e, "Could not fund distributor output"),
        }
    }
    if !target.is_zero() {
        confirm(ledger, "distributor funding").await;
    }

    let mut balance = Amount::ZERO;
    let mut unchanged = 0u32;
    let poll = async {
        loop {
            if let Some(read) = read_balance(distributor, config).await {
                if read >= target {
                    balance = read;
                    return SeedOutcome::Funded { balance };
                }
                if read == balance {
                    unchanged += 1;
                } else {
                    unchanged = 0;
                    balance = read;
                }
                if unchanged >= config.stall_polls {
                    return SeedOutcome::Stalled { balance };
                }
            }
            tokio::time::sleep(config.balance_poll_interval).await;
        }
    };
    let outcome = tokio::time::timeout(config.distributor_funding_timeout, poll).await;
    let outcome = outcome.unwrap_or(SeedOutcome::TimedOut { balance });

    match outcome {
        SeedOutcome::Funded { balance } => {
            info!(balance = %balance, "Distributor funded");
        }
        SeedOutcome::Stalled { balance } => {
            warn!(balance = %balance, target = %target, "Distributor balance stalled");
        }
        SeedOutcome::TimedOut { balance } => {
            warn!(balance = %balance, target = %target, "Distributor funding timeout");
        }
    }
    outcome
}

async fn client_invoices(client: &ClientRecord, scenario: &Scenario) -> Vec<Invoice> {
    let Some(wallet_spec) = scenario.wallets.get(client.slot) else {
        return Vec::new();
    };
    let mut invoices = Vec::new();
    for amount in wallet_spec.nonzero_funds() {
        match client.wallet.new_address().await {
            Ok(address) => invoices.push(Invoice {
                slot: client.slot,
                recipient: client.entity.name.clone(),
                address,
                amount,
            }),
            Err(e) => {
                warn!(name = %client.entity.name, error = %e, "Could not create invoice, skipping client");
                return Vec::new();
            }
        }
    }
    invoices
}

/// One fresh address per nonzero declared amount of every fleet member,
/// shuffled.
pub async fn create_invoices(ctx: &Context, fleet: &Fleet, scenario: &Scenario) -> Vec<Invoice> {
    info!("Creating client invoices");
    let mut invoices: Vec<Invoice> = stream::iter(&fleet.clients)
        .map(|client| client_invoices(client, scenario))
        .buffer_unordered(ctx.config.rpc_concurrency)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect();
    invoices.shuffle(&mut rand::thread_rng());
    invoices
}

/// Pay the invoices from the distributor in batches. Any batch failure is
/// fatal. Returns the number of batches sent.
pub async fn pay_invoices(
    distributor: &dyn Wallet,
    invoices: &[Invoice],
    batch_size: usize,
) -> Result<usize, SimulationError> {
    info!(invoices = invoices.len(), batch_size, "Paying invoices");
    let mut sent = 0;
    for (batch, invoices) in batched(invoices, batch_size).enumerate() {
        let payments: Vec<Payment> = invoices
            .iter()
            .map(|invoice| Payment::new(invoice.address.clone(), invoice.amount))
            .collect();
        match distributor.send(&payments).await {
            Ok(result) => {
                debug!(batch, ?result, "Batch sent");
                sent += 1;
            }
            Err(e) if e.is_timeout() => return Err(SimulationError::FundingTimeout { batch }),
            Err(source) => return Err(SimulationError::Funding { batch, source }),
        }
    }
    Ok(sent)
}

/// Poll `wallet` until it holds at least `target` or the funding timeout
/// elapses.
pub async fn wait_funded(
    name: &str,
    wallet: &dyn Wallet,
    target: Amount,
    config: &SimulationConfig,
) -> FundingOutcome {
    let mut balance = Amount::ZERO;
    let poll = async {
        loop {
            if let Some(read) = read_balance(wallet, config).await {
                balance = read;
                if read >= target {
                    return;
                }
            }
            tokio::time::sleep(config.balance_poll_interval).await;
        }
    };
    let converged = tokio::time::timeout(config.funding_timeout, poll).await.is_ok();

    if converged {
        info!(name, balance = %balance, "Client funded");
        FundingOutcome::Funded { balance }
    } else {
        warn!(name, balance = %balance, target = %target, "Client funding timeout");
        FundingOutcome::TimedOut { balance }
    }
}

/// Fund the whole fleet: invoices, batched payments, one confirmation block,
/// convergence.
///
/// `report` is filled in as far as the phase got.
pub async fn fund_fleet(
    ctx: &Context,
    ledger: &dyn Ledger,
    distributor: &dyn Wallet,
    fleet: &Fleet,
    scenario: &Scenario,
    report: &mut FundingReport,
) -> Result<(), SimulationError> {
    info!(clients = fleet.len(), "Funding clients");
    let invoices = create_invoices(ctx, fleet, scenario).await;
    report.invoices = invoices.len();

    let sent = pay_invoices(distributor, &invoices, ctx.config.batch_size).await;
    report.batches_sent = match &sent {
        Ok(sent) => *sent,
        Err(SimulationError::FundingTimeout { batch } | SimulationError::Funding { batch, .. }) => {
            *batch
        }
        Err(_) => 0,
    };
    if sent? > 0 {
        confirm(ledger, "client funding").await;
    }

    let targets: Vec<(&ClientRecord, Amount)> = fleet
        .clients
        .iter()
        .filter_map(|client| {
            let total = scenario.wallets.get(client.slot)?.total_funds();
            (!total.is_zero()).then_some((client, total))
        })
        .collect();
    let outcomes: Vec<(String, FundingOutcome)> = stream::iter(targets)
        .map(|(client, target)| async move {
            let name = client.entity.name.clone();
            let outcome = wait_funded(&name, client.wallet.as_ref(), target, &ctx.config).await;
            (name, outcome)
        })
        .buffer_unordered(ctx.config.rpc_concurrency)
        .collect()
        .await;

    let timed_out = outcomes.iter().filter(|(_, o)| !o.is_funded()).count();
    report.clients.extend(outcomes);
    if timed_out > 0 {
        warn!(timed_out, "Some clients did not reach their funds");
    } else {
        info!("All clients funded");
    }
    Ok(())
}
