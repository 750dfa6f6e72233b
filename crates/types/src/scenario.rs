//! Scenario description: what the fleet looks like and when the run stops.

use crate::{Amount, ClientVersion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// A load-test scenario.
///
/// Scenario files are JSON; any top-level field a file omits keeps the
/// value of [`Scenario::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Scenario name, used to label the collected logs.
    pub name: String,

    /// Completed mixing rounds after which the run stops (0 = no limit).
    pub rounds: u64,

    /// Mined blocks after which the run stops (0 = no limit).
    pub blocks: u64,

    /// Client version for wallets that do not declare one.
    pub default_version: ClientVersion,

    /// Version of the distributor client (defaults to `default_version`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributor_version: Option<ClientVersion>,

    /// Anon-score target for wallets that do not declare one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_anon_score_target: Option<u32>,

    /// Red-coin isolation for wallets that do not declare it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_redcoin_isolation: Option<bool>,

    /// Coordinator policy overrides merged into its configuration file.
    pub backend: Map<String, Value>,

    /// Fleet wallets, one client instance each.
    pub wallets: Vec<WalletSpec>,
}

/// One fleet wallet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletSpec {
    /// Amounts to fund, one fresh address per nonzero amount.
    pub funds: Vec<Amount>,

    /// Blocks to wait after the mixing phase starts before participating.
    pub delay: u64,

    /// Rounds during which the client must not participate.
    pub skip_rounds: Vec<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<ClientVersion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub anon_score_target: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redcoin_isolation: Option<bool>,
}

impl WalletSpec {
    /// Wallet with the given funds and no delay.
    pub fn with_funds(funds: impl IntoIterator<Item = u64>) -> Self {
        Self {
            funds: funds.into_iter().map(Amount::from_sat).collect(),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_skip_rounds(mut self, rounds: impl IntoIterator<Item = u64>) -> Self {
        self.skip_rounds = rounds.into_iter().collect();
        self
    }

    pub fn with_version(mut self, version: ClientVersion) -> Self {
        self.version = Some(version);
        self
    }

    /// Sum of the declared funds.
    pub fn total_funds(&self) -> Amount {
        self.funds.iter().sum()
    }

    /// Declared amounts that actually need an invoice.
    pub fn nonzero_funds(&self) -> impl Iterator<Item = Amount> + '_ {
        self.funds.iter().copied().filter(|amount| !amount.is_zero())
    }

    pub fn skip_round_set(&self) -> HashSet<u64> {
        self.skip_rounds.iter().copied().collect()
    }
}

impl Default for Scenario {
    fn default() -> Self {
        let wallet = |funds: &[u64]| WalletSpec::with_funds(funds.iter().copied());
        let mut first = wallet(&[200_000, 50_000]);
        first.anon_score_target = Some(7);
        let mut second = wallet(&[3_000_000]);
        second.redcoin_isolation = Some(true);

        Self {
            name: "default".to_string(),
            rounds: 10,
            blocks: 0,
            default_version: ClientVersion::v2_0_4(),
            distributor_version: None,
            default_anon_score_target: None,
            default_redcoin_isolation: None,
            backend: Map::new(),
            wallets: vec![
                first,
                second,
                wallet(&[1_000_000, 500_000]),
                wallet(&[1_000_000, 500_000]),
                wallet(&[1_000_000, 500_000]),
                wallet(&[3_000_000, 15_000]),
                wallet(&[1_000_000, 500_000]),
                wallet(&[1_000_000, 500_000]),
                wallet(&[3_000_000, 600_000]),
                wallet(&[1_000_000, 500_000]),
            ],
        }
    }
}

impl Scenario {
    /// Empty scenario with the given name and wallets, no round/block limit.
    pub fn new(name: impl Into<String>, wallets: Vec<WalletSpec>) -> Self {
        Self {
            name: name.into(),
            rounds: 0,
            blocks: 0,
            wallets,
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, rounds: u64, blocks: u64) -> Self {
        self.rounds = rounds;
        self.blocks = blocks;
        self
    }

    /// Parse a scenario from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load a scenario file.
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Pretty JSON rendering, as stored alongside collected logs.
    pub fn to_json_pretty(&self) -> Result<String, ScenarioError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Effective version of a wallet.
    pub fn wallet_version<'a>(&'a self, wallet: &'a WalletSpec) -> &'a ClientVersion {
        wallet.version.as_ref().unwrap_or(&self.default_version)
    }

    /// Effective version of the distributor.
    pub fn distributor_version(&self) -> &ClientVersion {
        self.distributor_version
            .as_ref()
            .unwrap_or(&self.default_version)
    }

    /// Effective anon-score target of a wallet, before version gating.
    pub fn anon_score_target(&self, wallet: &WalletSpec) -> Option<u32> {
        wallet.anon_score_target.or(self.default_anon_score_target)
    }

    /// Effective red-coin isolation of a wallet, before version gating.
    pub fn redcoin_isolation(&self, wallet: &WalletSpec) -> Option<bool> {
        wallet.redcoin_isolation.or(self.default_redcoin_isolation)
    }

    /// Every client version the scenario needs an image for.
    pub fn client_versions(&self) -> BTreeSet<ClientVersion> {
        let mut versions = BTreeSet::new();
        versions.insert(self.default_version.clone());
        versions.insert(self.distributor_version().clone());
        for wallet in &self.wallets {
            versions.insert(self.wallet_version(wallet).clone());
        }
        versions
    }

    /// Total funds declared across all wallets.
    pub fn total_funds(&self) -> Amount {
        self.wallets.iter().map(WalletSpec::total_funds).sum()
    }
}

/// Errors loading or rendering a scenario.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid scenario: {0}")]
    Parse(#[from] serde_json::Error),
}
