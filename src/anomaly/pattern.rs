// 📈 Pattern Detector
// z-score of the amount against earlier transactions of the same category and direction.
// A constant history (rent, salary) has no spread, so any real departure from it is flagged.

use super::{Detector, Neighborhood};
use crate::config::AnomalyConfig;
use crate::model::{FlagType, RedFlag, Severity, Transaction};

/// Relative slack for a zero-variance history; at least ₹1
const CONSTANT_HISTORY_TOLERANCE: f64 = 0.01;

pub struct PatternDetector {
    pub z_score_threshold: f64,
    pub z_score_high: f64,
    pub min_history: usize,
}

impl PatternDetector {
    pub fn from_config(config: &AnomalyConfig) -> Self {
        PatternDetector {
            z_score_threshold: config.z_score_threshold,
            z_score_high: config.z_score_high,
            min_history: config.min_history,
        }
    }
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

impl Detector for PatternDetector {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let Some(category) = neighborhood.category_of(&tx.id) else {
            return Vec::new();
        };

        let history: Vec<f64> = neighborhood
            .transactions
            .iter()
            .filter(|n| n.direction == tx.direction && n.date < tx.date)
            .filter(|n| neighborhood.category_of(&n.id) == Some(category))
            .map(|n| n.amount)
            .collect();

        if history.len() < self.min_history.max(2) {
            return Vec::new();
        }

        let (mean, std) = mean_and_std(&history);

        let (severity, message) = if std <= f64::EPSILON {
            let tolerance = (mean.abs() * CONSTANT_HISTORY_TOLERANCE).max(1.0);
            if (tx.amount - mean).abs() <= tolerance {
                return Vec::new();
            }
            (
                Severity::Medium,
                format!(
                    "amount ₹{:.2} differs from the constant '{}' amount ₹{:.2} of {} earlier transactions",
                    tx.amount,
                    category,
                    mean,
                    history.len()
                ),
            )
        } else {
            let z = (tx.amount - mean) / std;
            let severity = if z.abs() > self.z_score_high {
                Severity::Medium
            } else if z.abs() > self.z_score_threshold {
                Severity::Low
            } else {
                return Vec::new();
            };
            (
                severity,
                format!(
                    "amount ₹{:.2} is {:.1} standard deviations from the '{}' average ₹{:.2} over {} earlier transactions",
                    tx.amount,
                    z,
                    category,
                    mean,
                    history.len()
                ),
            )
        };

        vec![
            RedFlag::raise(&tx.id, FlagType::PatternOutlier, severity, message, self.name())
                .with_subject_key(category),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::testing::Fixture;

    fn fuel_history(fx: &Fixture) -> (Neighborhood, Vec<Transaction>) {
        let amounts = ["1000", "1100", "900", "1050", "950", "1000"];
        let txs: Vec<Transaction> = amounts
            .iter()
            .enumerate()
            .map(|(i, a)| fx.debit(&format!("0{}/06/2024", i + 1), "Diesel", a, "HP"))
            .collect();

        let mut neighborhood = Neighborhood::new(txs.clone());
        for t in &txs {
            neighborhood = neighborhood.with_category(&t.id, "Fuel");
        }
        (neighborhood, txs)
    }

    fn detector() -> PatternDetector {
        PatternDetector::from_config(&AnomalyConfig::default())
    }

    #[test]
    fn test_large_outlier_medium() {
        let fx = Fixture::new();
        let (neighborhood, _) = fuel_history(&fx);
        let tx = fx.debit("20/06/2024", "Diesel", "5000", "HP");
        let neighborhood = neighborhood.with_category(&tx.id, "Fuel");

        let flags = detector().scan(&tx, &neighborhood);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].flag_type, FlagType::PatternOutlier);
        assert_eq!(flags[0].severity, Severity::Medium);
    }

    #[test]
    fn test_typical_amount_not_flagged() {
        let fx = Fixture::new();
        let (neighborhood, _) = fuel_history(&fx);
        let tx = fx.debit("20/06/2024", "Diesel", "1020", "HP");
        let neighborhood = neighborhood.with_category(&tx.id, "Fuel");

        assert!(detector().scan(&tx, &neighborhood).is_empty());
    }

    #[test]
    fn test_thin_history_skipped() {
        let fx = Fixture::new();
        let a = fx.debit("01/06/2024", "Diesel", "1000", "HP");
        let b = fx.debit("02/06/2024", "Diesel", "1200", "HP");
        let tx = fx.debit("20/06/2024", "Diesel", "90000", "HP");
        let neighborhood = Neighborhood::new(vec![a.clone(), b.clone()])
            .with_category(&a.id, "Fuel")
            .with_category(&b.id, "Fuel")
            .with_category(&tx.id, "Fuel");

        assert!(detector().scan(&tx, &neighborhood).is_empty());
    }

    fn rent_history(fx: &Fixture) -> Neighborhood {
        let months = ["01/01/2024", "01/02/2024", "01/03/2024", "01/04/2024", "01/05/2024", "01/06/2024"];
        months.iter().fold(Neighborhood::default(), |n, date| {
            let t = fx.debit(date, "Office rent", "50000", "XYZ Landlords");
            let mut n = n.with_category(&t.id, "Rent");
            n.transactions.push(t);
            n
        })
    }

    #[test]
    fn test_departure_from_constant_history_flagged() {
        let fx = Fixture::new();
        let neighborhood = rent_history(&fx);
        let tx = fx.debit("01/07/2024", "Office rent", "5000000", "XYZ Landlords");
        let neighborhood = neighborhood.with_category(&tx.id, "Rent");

        let flags = detector().scan(&tx, &neighborhood);

        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].severity, Severity::Medium);
        assert!(flags[0].message.contains("constant"));
        assert_eq!(flags[0].subject_key, "Rent");
    }

    #[test]
    fn test_same_amount_as_constant_history_not_flagged() {
        let fx = Fixture::new();
        let neighborhood = rent_history(&fx);
        let tx = fx.debit("01/07/2024", "Office rent July", "50000", "XYZ Landlords");
        let neighborhood = neighborhood.with_category(&tx.id, "Rent");

        assert!(detector().scan(&tx, &neighborhood).is_empty());
    }

    #[test]
    fn test_other_category_ignored() {
        let fx = Fixture::new();
        let (neighborhood, _) = fuel_history(&fx);
        let tx = fx.debit("20/06/2024", "Office chair", "5000", "IKEA");
        let neighborhood = neighborhood.with_category(&tx.id, "Furniture");

        assert!(detector().scan(&tx, &neighborhood).is_empty());
    }
}
