// 🧮 GST Mismatch Detector
//
// Compares the input tax credit declared in the books for one supplier GSTIN
// and month against what the reconciliation feed says the supplier reported.

use super::{Detector, Neighborhood};
use crate::compliance::{gst::embedded_tax, validate_gstin};
use crate::model::{FlagType, RedFlag, Severity, Transaction};
use crate::normalization::round_paise;
use crate::services::ReconciliationFeed;
use std::sync::Arc;

pub struct GstMismatchDetector {
    feed: Arc<dyn ReconciliationFeed>,
    tolerance: f64,
}

impl GstMismatchDetector {
    pub fn new(feed: Arc<dyn ReconciliationFeed>, tolerance: f64) -> Self {
        GstMismatchDetector { feed, tolerance }
    }

    fn declared_itc(tx: &Transaction) -> f64 {
        tx.tax_amount.unwrap_or_else(|| embedded_tax(tx.amount))
    }
}

impl Detector for GstMismatchDetector {
    fn name(&self) -> &'static str {
        "gst_mismatch"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let gstin = match tx.gstin.as_deref() {
            Some(g) if tx.is_debit() && validate_gstin(g).is_ok() => g,
            _ => return Vec::new(),
        };
        let (year, month) = tx.period();

        let declared = round_paise(
            neighborhood
                .transactions
                .iter()
                .filter(|n| n.is_debit() && n.gstin.as_deref() == Some(gstin) && n.period() == (year, month))
                .chain(std::iter::once(tx))
                .map(Self::declared_itc)
                .sum(),
        );

        let message = match self.feed.reported_itc(gstin, year, month) {
            None => format!(
                "no filing found for supplier {} in {}-{:02}; declared ITC ₹{:.2} cannot be matched",
                gstin, year, month, declared
            ),
            Some(reported) if (declared - reported).abs() > self.tolerance => format!(
                "ITC for supplier {} in {}-{:02}: books ₹{:.2}, supplier filing ₹{:.2} (difference ₹{:.2})",
                gstin,
                year,
                month,
                declared,
                reported,
                round_paise(declared - reported)
            ),
            Some(_) => return Vec::new(),
        };

        vec![
            RedFlag::raise(&tx.id, FlagType::GstMismatch, Severity::High, message, self.name())
                .with_subject_key(format!("{}/{}-{:02}", gstin, year, month)),
        ]
    }
}
