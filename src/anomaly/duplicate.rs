// 🔍 Duplicate Detector
// Two strategies: exact dedup-key collision, fuzzy near-duplicate

use super::{Detector, Neighborhood};
use crate::config::AnomalyConfig;
use crate::model::{FlagType, RedFlag, Severity, Transaction};
use crate::normalization::text_similarity;

pub struct DuplicateDetector {
    /// Days between the two occurrences (inclusive)
    pub window_days: i64,

    /// Minimum description similarity (0.0 - 1.0)
    pub description_similarity: f64,

    /// Amount tolerance in rupees
    pub amount_tolerance: f64,
}

impl DuplicateDetector {
    pub fn from_config(config: &AnomalyConfig) -> Self {
        DuplicateDetector {
            window_days: config.near_duplicate_window_days,
            description_similarity: config.description_similarity,
            amount_tolerance: config.amount_tolerance,
        }
    }

    /// Strategy 1: the same row was ingested again (dedup key collision)
    fn check_exact_collision(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Option<RedFlag> {
        if !neighborhood.had_collision(&tx.id) {
            return None;
        }

        Some(RedFlag::raise(
            &tx.id,
            FlagType::Duplicate,
            Severity::Medium,
            format!(
                "identical row uploaded again ({} | ₹{:.2} | {}); kept a single transaction",
                tx.date, tx.amount, tx.description
            ),
            self.name(),
        ))
    }

    /// Strategy 2: near-duplicate of an earlier transaction.
    /// Same direction, amount within tolerance, similar description, within the window.
    /// Only the later occurrence (higher sequence) is flagged.
    fn check_near_duplicate(&self, tx: &Transaction, earlier: &Transaction) -> Option<RedFlag> {
        if earlier.sequence >= tx.sequence || earlier.direction != tx.direction {
            return None;
        }

        let amount_diff = (tx.amount - earlier.amount).abs();
        if amount_diff > self.amount_tolerance {
            return None;
        }

        let date_diff = (tx.date - earlier.date).num_days().abs();
        if date_diff > self.window_days {
            return None;
        }

        let similarity = text_similarity(&tx.description, &earlier.description);
        if similarity < self.description_similarity {
            return None;
        }

        Some(RedFlag::raise(
            &tx.id,
            FlagType::Duplicate,
            Severity::Medium,
            format!(
                "possible duplicate of transaction {}: {} ≈ {} | ₹{:.2} ≈ ₹{:.2} | description similarity {:.2}",
                earlier.id, earlier.date, tx.date, earlier.amount, tx.amount, similarity
            ),
            self.name(),
        ))
    }
}

impl Detector for DuplicateDetector {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let mut flags: Vec<RedFlag> = self.check_exact_collision(tx, neighborhood).into_iter().collect();

        flags.extend(
            neighborhood
                .transactions
                .iter()
                .filter_map(|earlier| self.check_near_duplicate(tx, earlier)),
        );

        flags
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::testing::Fixture;

    fn detector() -> DuplicateDetector {
        DuplicateDetector::from_config(&AnomalyConfig::default())
    }

    #[test]
    fn test_exact_collision_flag() {
        let fx = Fixture::new();
        let tx = fx.debit("01/06/2024", "Office Rent", "50000", "XYZ");

        let neighborhood = Neighborhood::new(vec![]).with_collision(&tx.id);
        let flags = detector().scan(&tx, &neighborhood);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].flag_type, FlagType::Duplicate);
        assert_eq!(flags[0].severity, Severity::Medium);
    }

    #[test]
    fn test_near_duplicate_flags_only_later_occurrence() {
        let fx = Fixture::new();
        let first = fx.debit("01/06/2024", "Payment to Sharma Traders", "12500", "Sharma");
        let second = fx.debit("03/06/2024", "Payment to Sharma Traders.", "12500", "Sharma");

        let on_second = detector().scan(&second, &Neighborhood::new(vec![first.clone()]));
        let on_first = detector().scan(&first, &Neighborhood::new(vec![second.clone()]));

        assert_eq!(on_second.len(), 1);
        assert!(on_second[0].message.contains(&first.id));
        assert!(on_first.is_empty());
    }

    #[test]
    fn test_outside_window_not_flagged() {
        let fx = Fixture::new();
        let first = fx.debit("01/06/2024", "Payment to Sharma Traders", "12500", "Sharma");
        let second = fx.debit("20/06/2024", "Payment to Sharma Traders", "12500", "Sharma");

        assert!(detector().scan(&second, &Neighborhood::new(vec![first])).is_empty());
    }

    #[test]
    fn test_different_amount_or_description_not_flagged() {
        let fx = Fixture::new();
        let first = fx.debit("01/06/2024", "Payment to Sharma Traders", "12500", "Sharma");
        let other_amount = fx.debit("02/06/2024", "Payment to Sharma Traders", "12600", "Sharma");
        let other_text = fx.debit("02/06/2024", "Diesel for generator", "12500", "HP");

        assert!(detector().scan(&other_amount, &Neighborhood::new(vec![first.clone()])).is_empty());
        assert!(detector().scan(&other_text, &Neighborhood::new(vec![first])).is_empty());
    }

    #[test]
    fn test_window_is_configurable() {
        let fx = Fixture::new();
        let first = fx.debit("01/06/2024", "Payment to Sharma Traders", "12500", "Sharma");
        let second = fx.debit("05/06/2024", "Payment to Sharma Traders", "12500", "Sharma");

        let narrow = DuplicateDetector {
            window_days: 2,
            ..detector()
        };
        assert!(narrow.scan(&second, &Neighborhood::new(vec![first])).is_empty());
    }
}
