// 🚩 Anomaly / Red-Flag Detector
//
// Independent detectors, each scanning one transaction against its
// neighborhood (other live transactions in the same sheet). Detectors only
// raise flags; resolving them is a reviewer action in the audit ledger.

pub mod cash;
pub mod duplicate;
pub mod gst_mismatch;
pub mod invoice;
pub mod pattern;
pub mod recurring;
pub mod vendor;

use crate::config::AnomalyConfig;
use crate::model::{RedFlag, Transaction};
use crate::services::ReconciliationFeed;
use crate::store::LedgerStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use cash::CashDetector;
pub use duplicate::DuplicateDetector;
pub use gst_mismatch::GstMismatchDetector;
pub use invoice::MissingInvoiceDetector;
pub use pattern::PatternDetector;
pub use recurring::{overdue_payments, OverduePayment, RecurringDetector, VendorPattern};
pub use vendor::VendorDetector;

// ============================================================================
// NEIGHBORHOOD
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Neighborhood {
    /// Other transactions of the same sheet/period
    pub transactions: Vec<Transaction>,

    /// Active ledger category per transaction id (subject included)
    categories: HashMap<String, String>,

    /// Transactions whose row was ingested again and hit the dedup key
    collisions: HashSet<String>,
}

impl Neighborhood {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Neighborhood {
            transactions,
            ..Default::default()
        }
    }

    /// Live same-sheet neighbors plus every active category the store knows
    pub fn from_store(store: &LedgerStore, tx: &Transaction) -> Self {
        let transactions = store.neighborhood(tx);
        let mut neighborhood = Neighborhood::new(Vec::new());

        for t in transactions.iter().chain(std::iter::once(tx)) {
            if let Some(c) = store.active_classification(&t.id) {
                neighborhood.categories.insert(t.id.clone(), c.ledger_category);
            }
        }
        neighborhood.transactions = transactions;
        neighborhood
    }

    pub fn with_category(mut self, tx_id: &str, category: &str) -> Self {
        self.categories.insert(tx_id.to_string(), category.to_string());
        self
    }

    pub fn with_collision(mut self, tx_id: &str) -> Self {
        self.collisions.insert(tx_id.to_string());
        self
    }

    pub fn add_collisions<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        self.collisions.extend(ids.into_iter().cloned());
    }

    pub fn category_of(&self, tx_id: &str) -> Option<&str> {
        self.categories.get(tx_id).map(String::as_str)
    }

    pub fn had_collision(&self, tx_id: &str) -> bool {
        self.collisions.contains(tx_id)
    }
}

// ============================================================================
// DETECTOR CONTRACT
// ============================================================================

pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag>;
}

// ============================================================================
// SCANNER
// ============================================================================

pub struct AnomalyScanner {
    detectors: Vec<Box<dyn Detector>>,
}

impl AnomalyScanner {
    pub fn new(detectors: Vec<Box<dyn Detector>>) -> Self {
        AnomalyScanner { detectors }
    }

    /// Every detector; GST mismatch only when a reconciliation feed is supplied
    pub fn standard(
        config: &AnomalyConfig,
        cash_limit: f64,
        feed: Option<Arc<dyn ReconciliationFeed>>,
    ) -> Self {
        let mut detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(DuplicateDetector::from_config(config)),
            Box::new(CashDetector::new(cash_limit)),
            Box::new(VendorDetector::new(config.known_vendors.clone())),
            Box::new(MissingInvoiceDetector::from_config(config)),
        ];
        if let Some(feed) = feed {
            detectors.push(Box::new(GstMismatchDetector::new(feed, config.gst_mismatch_tolerance)));
        }
        detectors.push(Box::new(PatternDetector::from_config(config)));
        detectors.push(Box::new(RecurringDetector::from_config(config)));
        AnomalyScanner::new(detectors)
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    pub fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        self.detectors
            .iter()
            .flat_map(|d| d.scan(tx, neighborhood))
            .collect()
    }
}

// ============================================================================
// TEST HELPERS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::testing::Fixture;
    use super::*;
    use crate::extraction::RawRow;
    use crate::model::FlagType;

    #[test]
    fn test_standard_without_feed_skips_gst_mismatch() {
        let scanner = AnomalyScanner::standard(&AnomalyConfig::default(), 10_000.0, None);
        assert_eq!(
            scanner.detector_names(),
            vec!["duplicate", "cash", "vendor", "missing_invoice", "pattern", "recurring"]
        );
    }

    #[test]
    fn test_scanner_combines_detectors() {
        let fx = Fixture::new();
        let tx = fx.add(
            RawRow::new("doc", "01/06/2024", "Office Rent", "50000")
                .with_mode("cash")
                .with_gstin("27AAPFU0939F1ZX"),
        );
        let scanner = AnomalyScanner::standard(&AnomalyConfig::default(), 10_000.0, None);

        let flags = scanner.scan(&tx, &Neighborhood::from_store(&fx.store, &tx));
        let types: Vec<FlagType> = flags.iter().map(|f| f.flag_type).collect();

        assert!(types.contains(&FlagType::CashLimit));
        assert!(types.contains(&FlagType::SuspiciousVendor));
        assert!(types.contains(&FlagType::MissingInvoice));
    }
}
