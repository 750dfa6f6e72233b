//! Scenario generation.
//!
//! Produces a static scenario: every wallet holds one coin in total, split
//! into a number of outputs drawn from a uniform or a heavy-tailed
//! distribution, all clients join at once and the coordinator policy bounds
//! the input count of a round.

use crate::error::GenscenError;
use mixsim_types::{Amount, Scenario, WalletSpec};
use rand::Rng;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Shape of the Pareto (Lomax) distribution used by `paretosum`.
pub const PARETO_SHAPE: f64 = 1.16;

/// How one wallet's coin is split into outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Distribution {
    /// Uniform samples, normalized.
    #[default]
    UniformSum,
    /// Pareto samples, normalized.
    ParetoSum,
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniformsum" => Ok(Distribution::UniformSum),
            "paretosum" => Ok(Distribution::ParetoSum),
            other => Err(format!(
                "unknown distribution '{other}' (expected uniformsum or paretosum)"
            )),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::UniformSum => write!(f, "uniformsum"),
            Distribution::ParetoSum => write!(f, "paretosum"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenscenOptions {
    pub client_count: usize,
    pub distribution: Distribution,
    pub utxo_count: usize,
    /// Maximum inputs of a coinjoin.
    pub max_coinjoin: u64,
    /// Minimum inputs of a coinjoin.
    pub min_coinjoin: u64,
    pub stop_round: u64,
    pub stop_block: u64,
}

impl Default for GenscenOptions {
    fn default() -> Self {
        Self {
            client_count: 10,
            distribution: Distribution::UniformSum,
            utxo_count: 30,
            max_coinjoin: 400,
            min_coinjoin: 4,
            stop_round: 0,
            stop_block: 120,
        }
    }
}

impl GenscenOptions {
    /// `{distribution}-static-{clients}-{utxos}utxo`
    pub fn scenario_name(&self) -> String {
        format!(
            "{}-static-{}-{}utxo",
            self.distribution, self.client_count, self.utxo_count
        )
    }

    fn validate(&self) -> Result<(), GenscenError> {
        if self.utxo_count == 0 {
            return Err(GenscenError::Invalid("utxo count must be positive".into()));
        }
        if self.max_coinjoin == 0 {
            return Err(GenscenError::Invalid("max coinjoin must be positive".into()));
        }
        Ok(())
    }
}

/// Coordinator policy with the given input-count bounds.
pub fn backend_policy(max_coinjoin: u64, min_coinjoin: u64) -> Map<String, Value> {
    let policy = json!({
        "MaxInputCountByRound": max_coinjoin,
        "MinInputCountByRoundMultiplier": min_coinjoin as f64 / max_coinjoin as f64,
        "StandardInputRegistrationTimeout": "0d 0h 20m 0s",
        "ConnectionConfirmationTimeout": "0d 0h 6m 0s",
        "OutputRegistrationTimeout": "0d 0h 6m 0s",
        "TransactionSigningTimeout": "0d 0h 6m 0s",
        "FailFastTransactionSigningTimeout": "0d 0h 6m 0s",
        "RoundExpiryTimeout": "0d 0h 10m 0s",
    });
    match policy {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn sample<R: Rng>(distribution: Distribution, rng: &mut R) -> f64 {
    let u: f64 = rng.gen();
    match distribution {
        Distribution::UniformSum => u,
        Distribution::ParetoSum => (1.0 - u).powf(-1.0 / PARETO_SHAPE) - 1.0,
    }
}

/// Split one coin into `outputs` amounts drawn from `distribution`.
pub fn split_coin<R: Rng>(distribution: Distribution, outputs: usize, rng: &mut R) -> Vec<u64> {
    let samples: Vec<f64> = (0..outputs).map(|_| sample(distribution, rng)).collect();
    let total: f64 = samples.iter().sum();
    let coin = Amount::SATS_PER_BTC as f64;
    samples
        .iter()
        .map(|s| {
            let share = if total > 0.0 {
                s / total
            } else {
                1.0 / outputs as f64
            };
            (share * coin).round() as u64
        })
        .collect()
}

pub fn generate<R: Rng>(options: &GenscenOptions, rng: &mut R) -> Result<Scenario, GenscenError> {
    options.validate()?;
    let wallets = (0..options.client_count)
        .map(|_| WalletSpec::with_funds(split_coin(options.distribution, options.utxo_count, rng)))
        .collect();
    let mut scenario = Scenario::new(options.scenario_name(), wallets)
        .with_limits(options.stop_round, options.stop_block);
    scenario.backend = backend_policy(options.max_coinjoin, options.min_coinjoin);
    Ok(scenario)
}

/// Write `{out_dir}/{name}.json`, refusing to overwrite unless `force`.
pub fn write(scenario: &Scenario, out_dir: &Path, force: bool) -> Result<PathBuf, GenscenError> {
    std::fs::create_dir_all(out_dir).map_err(|source| GenscenError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let path = out_dir.join(format!("{}.json", scenario.name));
    if path.exists() && !force {
        return Err(GenscenError::Exists(path));
    }
    std::fs::write(&path, scenario.to_json_pretty()?).map_err(|source| GenscenError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_distribution_parse() {
        assert_eq!("paretosum".parse::<Distribution>(), Ok(Distribution::ParetoSum));
        assert_eq!(Distribution::UniformSum.to_string(), "uniformsum");
        assert!("normal".parse::<Distribution>().is_err());
    }

    #[test]
    fn test_generate() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for distribution in [Distribution::UniformSum, Distribution::ParetoSum] {
            let options = GenscenOptions {
                client_count: 4,
                distribution,
                utxo_count: 30,
                ..Default::default()
            };
            let scenario = generate(&options, &mut rng).unwrap();
            assert_eq!(scenario.name, format!("{distribution}-static-4-30utxo"));
            assert_eq!(scenario.rounds, 0);
            assert_eq!(scenario.blocks, 120);
            assert_eq!(scenario.wallets.len(), 4);
            assert_eq!(scenario.backend["MaxInputCountByRound"], 400);
            assert_eq!(scenario.backend["MinInputCountByRoundMultiplier"], 0.01);

            for wallet in &scenario.wallets {
                assert_eq!(wallet.funds.len(), 30);
                assert_eq!(wallet.delay, 0);
                // Rounding moves each output by at most half a satoshi.
                let total = wallet.total_funds().to_sat() as i64;
                assert!((total - 100_000_000).abs() <= 15);
            }
        }
    }

    #[test]
    fn test_invalid_options() {
        let options = GenscenOptions {
            utxo_count: 0,
            ..Default::default()
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(matches!(
            generate(&options, &mut rng),
            Err(GenscenError::Invalid(_))
        ));
    }

    #[test]
    fn test_write_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("scenarios");
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let scenario = generate(&GenscenOptions::default(), &mut rng).unwrap();

        let path = write(&scenario, &out, false).unwrap();
        assert_eq!(path, out.join("uniformsum-static-10-30utxo.json"));
        assert!(matches!(
            write(&scenario, &out, false),
            Err(GenscenError::Exists(_))
        ));
        write(&scenario, &out, true).unwrap();

        let loaded = Scenario::load(&path).unwrap();
        assert_eq!(loaded.wallets.len(), 10);
        assert_eq!(loaded.total_funds(), scenario.total_funds());
    }
}
