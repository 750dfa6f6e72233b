//! Satoshi-denominated amounts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// An amount of coin in satoshis.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    /// Satoshis in one whole coin.
    pub const SATS_PER_BTC: u64 = 100_000_000;

    /// Zero amount.
    pub const ZERO: Self = Amount(0);

    /// Amount from satoshis.
    pub const fn from_sat(sats: u64) -> Self {
        Amount(sats)
    }

    /// Amount from whole coins.
    pub const fn from_btc(btc: u64) -> Self {
        Amount(btc * Self::SATS_PER_BTC)
    }

    /// Value in satoshis.
    pub const fn to_sat(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Split into `parts` equal shares, rounding each share up so the shares
    /// together never fall short of the total.
    pub fn split_ceil(self, parts: u64) -> Amount {
        if parts == 0 {
            return self;
        }
        Amount(self.0.div_ceil(parts))
    }

    /// Decimal coin representation with eight fractional digits, as accepted
    /// by the ledger node's JSON-RPC interface.
    pub fn to_btc_string(self) -> String {
        format!(
            "{}.{:08}",
            self.0 / Self::SATS_PER_BTC,
            self.0 % Self::SATS_PER_BTC
        )
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} BTC", self.to_btc_string())
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Amount {
        iter.copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_string_keeps_eight_decimals() {
        assert_eq!(Amount::from_btc(50).to_btc_string(), "50.00000000");
        assert_eq!(Amount::from_sat(1).to_btc_string(), "0.00000001");
        assert_eq!(Amount::from_sat(123_456_789).to_btc_string(), "1.23456789");
    }

    #[test]
    fn test_split_ceil_covers_total() {
        let total = Amount::from_sat(1_000);
        let share = total.split_ceil(3);
        assert_eq!(share, Amount::from_sat(334));
        assert!(Amount(share.0 * 3) >= total);
        assert_eq!(total.split_ceil(0), total);
    }

    #[test]
    fn test_sum() {
        let funds = [Amount(500_000), Amount(200_000)];
        assert_eq!(funds.iter().sum::<Amount>(), Amount(700_000));
    }
}
