//! Funding invoices.

use crate::Amount;
use serde::{Deserialize, Serialize};

/// One payment owed to a fleet client: a fresh address of the recipient and
/// the amount to send there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Scenario slot of the recipient.
    pub slot: usize,

    /// Runtime name of the recipient.
    pub recipient: String,

    /// Address generated by the recipient's wallet.
    pub address: String,

    pub amount: Amount,
}

/// Split invoices into consecutive batches of at most `batch_size`.
///
/// A zero batch size is treated as one.
pub fn batched(invoices: &[Invoice], batch_size: usize) -> impl Iterator<Item = &[Invoice]> {
    invoices.chunks(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invoice(slot: usize) -> Invoice {
        Invoice {
            slot,
            recipient: format!("client-{slot}"),
            address: format!("addr-{slot}"),
            amount: Amount(1_000),
        }
    }

    #[test]
    fn test_batched_keeps_remainder() {
        let invoices: Vec<_> = (0..12).map(invoice).collect();
        let sizes: Vec<_> = batched(&invoices, 5).map(<[Invoice]>::len).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
    }

    #[test]
    fn test_zero_batch_size() {
        let invoices: Vec<_> = (0..3).map(invoice).collect();
        assert_eq!(batched(&invoices, 0).count(), 3);
    }
}
