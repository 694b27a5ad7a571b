// 🧾 Missing Invoice Detector
// Debits with no supplier invoice number, graded by amount and GST exposure

use super::{Detector, Neighborhood};
use crate::config::AnomalyConfig;
use crate::model::{FlagType, RedFlag, Severity, Transaction};

const ITC_REFERENCE: &str = "CGST Act, 2017 §16(2)";

pub struct MissingInvoiceDetector {
    pub medium_amount: f64,
    pub high_amount: f64,
}

impl MissingInvoiceDetector {
    pub fn from_config(config: &AnomalyConfig) -> Self {
        MissingInvoiceDetector {
            medium_amount: config.invoice_medium_amount,
            high_amount: config.invoice_high_amount,
        }
    }

    /// ITC can only be claimed against a tax invoice
    fn gst_applicable(tx: &Transaction) -> bool {
        tx.gstin.is_some() || tx.tax_amount.map(|t| t > 0.0).unwrap_or(false)
    }
}

impl Detector for MissingInvoiceDetector {
    fn name(&self) -> &'static str {
        "missing_invoice"
    }

    fn scan(&self, tx: &Transaction, _neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let has_invoice = tx
            .invoice_number
            .as_deref()
            .map(|i| !i.trim().is_empty())
            .unwrap_or(false);
        if !tx.is_debit() || has_invoice {
            return Vec::new();
        }

        let (severity, message) = if tx.amount >= self.high_amount {
            (
                Severity::High,
                format!("payment of ₹{:.2} to '{}' has no invoice number", tx.amount, tx.vendor),
            )
        } else if Self::gst_applicable(tx) {
            (
                Severity::High,
                format!(
                    "GST-bearing payment to '{}' has no invoice number; ITC cannot be claimed ({})",
                    tx.vendor, ITC_REFERENCE
                ),
            )
        } else if tx.amount >= self.medium_amount {
            (
                Severity::Medium,
                format!("payment of ₹{:.2} to '{}' has no invoice number", tx.amount, tx.vendor),
            )
        } else {
            (Severity::Low, format!("no invoice number recorded for '{}'", tx.vendor))
        };

        vec![RedFlag::raise(&tx.id, FlagType::MissingInvoice, severity, message, self.name())
            .with_subject_key("invoice")]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::testing::Fixture;
    use crate::extraction::RawRow;

    fn detector() -> MissingInvoiceDetector {
        MissingInvoiceDetector::from_config(&AnomalyConfig::default())
    }

    fn severity_of(tx: &Transaction) -> Option<Severity> {
        detector()
            .scan(tx, &Neighborhood::default())
            .first()
            .map(|f| f.severity)
    }

    #[test]
    fn test_severity_by_amount() {
        let fx = Fixture::new();
        let large = fx.debit("01/06/2024", "Machine repair", "25000", "Ravi Works");
        let mid = fx.debit("02/06/2024", "Printer toner", "6000", "Corner Shop");
        let small = fx.debit("03/06/2024", "Tea and snacks", "300", "Chai Point");

        assert_eq!(severity_of(&large), Some(Severity::High));
        assert_eq!(severity_of(&mid), Some(Severity::Medium));
        assert_eq!(severity_of(&small), Some(Severity::Low));
    }

    #[test]
    fn test_gst_bearing_payment_is_high() {
        let fx = Fixture::new();
        let tx = fx.add(
            RawRow::new("doc", "01/06/2024", "Packing material", "2360")
                .with_type_hint("debit")
                .with_vendor("ABC Traders")
                .with_tax("360"),
        );

        let flags = detector().scan(&tx, &Neighborhood::default());
        assert_eq!(flags[0].severity, Severity::High);
        assert!(flags[0].message.contains("§16(2)"));
    }

    #[test]
    fn test_invoiced_debit_and_credits_skipped() {
        let fx = Fixture::new();
        let invoiced = fx.add(
            RawRow::new("doc", "01/06/2024", "Machine repair", "25000")
                .with_type_hint("debit")
                .with_invoice("INV-2024-117"),
        );
        let receipt = fx.add(RawRow::new("doc", "02/06/2024", "Sales receipt", "25000").with_type_hint("credit"));

        assert!(detector().scan(&invoiced, &Neighborhood::default()).is_empty());
        assert!(detector().scan(&receipt, &Neighborhood::default()).is_empty());
    }
}
