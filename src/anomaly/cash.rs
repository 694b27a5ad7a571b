// 💵 Cash Detector
// Cash over the per-transaction limit, and same-day splits just under it

use super::{Detector, Neighborhood};
use crate::model::{FlagType, RedFlag, Severity, Transaction};

/// Payments within this fraction below the limit count toward structuring
const STRUCTURING_BAND: f64 = 0.10;

pub struct CashDetector {
    limit: f64,
}

impl CashDetector {
    pub fn new(limit: f64) -> Self {
        CashDetector { limit }
    }

    fn in_band(&self, amount: f64) -> bool {
        amount <= self.limit && amount >= self.limit * (1.0 - STRUCTURING_BAND)
    }

    fn is_cash_payment(tx: &Transaction) -> bool {
        tx.is_debit() && tx.is_cash()
    }

    fn check_limit(&self, tx: &Transaction) -> Option<RedFlag> {
        (tx.amount > self.limit).then(|| {
            RedFlag::raise(
                &tx.id,
                FlagType::CashLimit,
                Severity::High,
                format!(
                    "cash payment ₹{:.2} exceeds the ₹{:.0} limit for a single payment",
                    tx.amount, self.limit
                ),
                self.name(),
            )
        })
    }

    fn check_structuring(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Option<RedFlag> {
        if !self.in_band(tx.amount) {
            return None;
        }

        let siblings: Vec<&Transaction> = neighborhood
            .transactions
            .iter()
            .filter(|n| {
                Self::is_cash_payment(n)
                    && n.date == tx.date
                    && n.vendor.eq_ignore_ascii_case(&tx.vendor)
                    && self.in_band(n.amount)
            })
            .collect();

        if siblings.is_empty() {
            return None;
        }

        let total: f64 = tx.amount + siblings.iter().map(|n| n.amount).sum::<f64>();
        if total <= self.limit {
            return None;
        }

        Some(
            RedFlag::raise(
                &tx.id,
                FlagType::CashStructuring,
                Severity::Medium,
                format!(
                    "{} cash payments to '{}' on {} just under the ₹{:.0} limit total ₹{:.2}",
                    siblings.len() + 1,
                    tx.vendor,
                    tx.date,
                    self.limit,
                    total
                ),
                self.name(),
            )
            .with_subject_key(format!("{}/{}", tx.date, tx.vendor.to_lowercase())),
        )
    }
}

impl Detector for CashDetector {
    fn name(&self) -> &'static str {
        "cash"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        if !Self::is_cash_payment(tx) {
            return Vec::new();
        }

        self.check_limit(tx)
            .into_iter()
            .chain(self.check_structuring(tx, neighborhood))
            .collect()
    }
}
