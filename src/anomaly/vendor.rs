// 🏷️ Vendor Detector
// Malformed GSTIN, one GSTIN shared by different vendors, vendor not on the approved list

use super::{Detector, Neighborhood};
use crate::compliance::validate_gstin;
use crate::model::{FlagType, RedFlag, Severity, Transaction};
use std::collections::BTreeSet;

pub struct VendorDetector {
    /// Approved vendors, lowercased. Empty = no list configured
    known_vendors: BTreeSet<String>,
}

impl VendorDetector {
    pub fn new(known_vendors: Vec<String>) -> Self {
        VendorDetector {
            known_vendors: known_vendors
                .into_iter()
                .map(|v| v.trim().to_lowercase())
                .filter(|v| !v.is_empty())
                .collect(),
        }
    }

    fn flag(&self, tx: &Transaction, severity: Severity, message: String) -> RedFlag {
        RedFlag::raise(&tx.id, FlagType::SuspiciousVendor, severity, message, self.name())
    }
}

impl Detector for VendorDetector {
    fn name(&self) -> &'static str {
        "vendor"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let mut flags = Vec::new();

        if let Some(gstin) = tx.gstin.as_deref() {
            match validate_gstin(gstin) {
                Err(reason) => flags.push(self.flag(
                    tx,
                    Severity::High,
                    format!("malformed GSTIN '{}' for vendor '{}': {}", gstin, tx.vendor, reason),
                )),
                Ok(()) => {
                    let others: BTreeSet<&str> = neighborhood
                        .transactions
                        .iter()
                        .filter(|n| n.gstin.as_deref() == Some(gstin))
                        .filter(|n| !n.vendor.eq_ignore_ascii_case(&tx.vendor))
                        .map(|n| n.vendor.as_str())
                        .collect();

                    if !others.is_empty() {
                        let names: Vec<&str> = others.into_iter().collect();
                        flags.push(
                            self.flag(
                                tx,
                                Severity::High,
                                format!(
                                    "GSTIN {} of '{}' is also used by: {}",
                                    gstin,
                                    tx.vendor,
                                    names.join(", ")
                                ),
                            )
                            .with_subject_key(format!("shared:{}", gstin)),
                        );
                    }
                }
            }
        }

        if tx.is_debit()
            && !self.known_vendors.is_empty()
            && !self.known_vendors.contains(&tx.vendor.to_lowercase())
        {
            flags.push(self.flag(
                tx,
                Severity::Medium,
                format!("vendor '{}' is not on the approved vendor list", tx.vendor),
            ));
        }

        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::testing::Fixture;
    use crate::extraction::RawRow;

    fn with_gstin(fx: &Fixture, vendor: &str, gstin: &str) -> Transaction {
        fx.add(
            RawRow::new("doc", "01/06/2024", &format!("Purchase from {}", vendor), "5000")
                .with_type_hint("debit")
                .with_vendor(vendor)
                .with_gstin(gstin),
        )
    }

    #[test]
    fn test_malformed_gstin_high() {
        let fx = Fixture::new();
        let tx = with_gstin(&fx, "ABC Traders", "27AAPFU0939F1ZX");

        let flags = VendorDetector::new(vec![]).scan(&tx, &Neighborhood::default());

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].severity, Severity::High);
        assert!(flags[0].message.contains("checksum"));
    }

    #[test]
    fn test_shared_gstin_across_vendors() {
        let fx = Fixture::new();
        let a = with_gstin(&fx, "ABC Traders", "27AAPFU0939F1ZV");
        let b = with_gstin(&fx, "XYZ Enterprises", "27AAPFU0939F1ZV");

        let flags = VendorDetector::new(vec![]).scan(&b, &Neighborhood::new(vec![a]));

        assert_eq!(flags.len(), 1);
        assert!(flags[0].message.contains("ABC Traders"));
    }

    #[test]
    fn test_shared_gstin_condition_stable_as_vendors_join() {
        let fx = Fixture::new();
        let a = with_gstin(&fx, "ABC Traders", "27AAPFU0939F1ZV");
        let b = with_gstin(&fx, "XYZ Enterprises", "27AAPFU0939F1ZV");
        let c = with_gstin(&fx, "PQR Metals", "27AAPFU0939F1ZV");
        let detector = VendorDetector::new(vec![]);

        let first = detector.scan(&b, &Neighborhood::new(vec![a.clone()]));
        let second = detector.scan(&b, &Neighborhood::new(vec![a, c]));

        assert!(second[0].message.contains("PQR Metals"));
        assert!(first[0].same_condition(&second[0]));
    }

    #[test]
    fn test_same_vendor_same_gstin_ok() {
        let fx = Fixture::new();
        let a = with_gstin(&fx, "ABC Traders", "27AAPFU0939F1ZV");
        let b = with_gstin(&fx, "abc traders", "27AAPFU0939F1ZV");

        assert!(VendorDetector::new(vec![]).scan(&b, &Neighborhood::new(vec![a])).is_empty());
    }

    #[test]
    fn test_unknown_vendor_only_with_list() {
        let fx = Fixture::new();
        let tx = fx.debit("01/06/2024", "Stationery", "500", "Corner Shop");

        assert!(VendorDetector::new(vec![]).scan(&tx, &Neighborhood::default()).is_empty());

        let flags = VendorDetector::new(vec!["ABC Traders".into()]).scan(&tx, &Neighborhood::default());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].severity, Severity::Medium);

        let approved = VendorDetector::new(vec!["corner shop".into()]);
        assert!(approved.scan(&tx, &Neighborhood::default()).is_empty());
    }
}
