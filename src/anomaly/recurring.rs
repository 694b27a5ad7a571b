// 🔁 Recurring Payment Detector
//
// A vendor paid at least `min_occurrences` times before, with consistent
// amounts or a roughly monthly rhythm, forms a recurring pattern. A payment
// that breaks the amount or the rhythm is flagged. `overdue_payments` finds
// monthly patterns whose next payment never arrived.

use super::{Detector, Neighborhood};
use crate::config::AnomalyConfig;
use crate::model::{Direction, FlagType, RedFlag, Severity, Transaction};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Average gap (days) that counts as a monthly payment
const MONTHLY_GAP: std::ops::RangeInclusive<f64> = 25.0..=35.0;

// ============================================================================
// PATTERN
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VendorPattern {
    pub vendor: String,
    pub occurrences: usize,
    pub mean_amount: f64,
    pub std_amount: f64,
    pub avg_gap_days: f64,
    pub last_date: NaiveDate,
    pub consistent_amount: bool,
    pub monthly: bool,
}

impl VendorPattern {
    /// None when the history is too thin or shows neither property
    pub fn learn(vendor: &str, history: &[&Transaction], min_occurrences: usize, variance: f64) -> Option<Self> {
        if history.len() < min_occurrences.max(2) {
            return None;
        }

        let mut dates: Vec<NaiveDate> = history.iter().map(|t| t.date).collect();
        dates.sort();
        let gaps: Vec<f64> = dates.windows(2).map(|w| (w[1] - w[0]).num_days() as f64).collect();
        let avg_gap_days = gaps.iter().sum::<f64>() / gaps.len() as f64;

        let n = history.len() as f64;
        let mean_amount = history.iter().map(|t| t.amount).sum::<f64>() / n;
        let std_amount = (history
            .iter()
            .map(|t| (t.amount - mean_amount).powi(2))
            .sum::<f64>()
            / n)
            .sqrt();

        let consistent_amount = mean_amount > 0.0 && std_amount / mean_amount < variance;
        let monthly = MONTHLY_GAP.contains(&avg_gap_days);
        if !consistent_amount && !monthly {
            return None;
        }

        Some(VendorPattern {
            vendor: vendor.to_string(),
            occurrences: history.len(),
            mean_amount,
            std_amount,
            avg_gap_days,
            last_date: *dates.last()?,
            consistent_amount,
            monthly,
        })
    }

    /// Deviation score: z-score, or relative deviation when the amounts never varied
    fn amount_score(&self, amount: f64) -> f64 {
        if self.std_amount > f64::EPSILON {
            (amount - self.mean_amount).abs() / self.std_amount
        } else if self.mean_amount > 0.0 {
            (amount - self.mean_amount).abs() / self.mean_amount
        } else {
            0.0
        }
    }

    pub fn expected_next(&self) -> NaiveDate {
        self.last_date + Duration::days(self.avg_gap_days.round() as i64)
    }
}

// ============================================================================
// DETECTOR
// ============================================================================

pub struct RecurringDetector {
    pub min_occurrences: usize,
    pub amount_variance: f64,
    pub date_tolerance_days: i64,
    pub z_score_threshold: f64,
    pub z_score_high: f64,
}

impl RecurringDetector {
    pub fn from_config(config: &AnomalyConfig) -> Self {
        RecurringDetector {
            min_occurrences: config.recurring_min_occurrences,
            amount_variance: config.recurring_amount_variance,
            date_tolerance_days: config.recurring_date_tolerance_days,
            z_score_threshold: config.z_score_threshold,
            z_score_high: config.z_score_high,
        }
    }

    fn check_amount(&self, tx: &Transaction, pattern: &VendorPattern) -> Option<RedFlag> {
        let score = pattern.amount_score(tx.amount);
        let severity = if score > self.z_score_high {
            Severity::High
        } else if score > self.z_score_threshold {
            Severity::Medium
        } else {
            return None;
        };

        let deviation_pct = (tx.amount - pattern.mean_amount) / pattern.mean_amount * 100.0;
        Some(
            RedFlag::raise(
                &tx.id,
                FlagType::RecurringDeviation,
                severity,
                format!(
                    "payment ₹{:.2} to '{}' vs usual ₹{:.2} ({:+.1}%) over {} earlier payments",
                    tx.amount, tx.vendor, pattern.mean_amount, deviation_pct, pattern.occurrences
                ),
                self.name(),
            )
            .with_subject_key(format!("amount:{}", pattern.vendor)),
        )
    }

    fn check_timing(&self, tx: &Transaction, pattern: &VendorPattern) -> Option<RedFlag> {
        if !pattern.monthly {
            return None;
        }

        let days_since = (tx.date - pattern.last_date).num_days();
        let expected = pattern.avg_gap_days.round() as i64;
        let (severity, kind) = if days_since < expected - self.date_tolerance_days {
            (Severity::Low, "early")
        } else if days_since > expected + self.date_tolerance_days {
            (Severity::Medium, "late")
        } else {
            return None;
        };

        Some(
            RedFlag::raise(
                &tx.id,
                FlagType::RecurringDeviation,
                severity,
                format!(
                    "{} payment to '{}': {} days since the last one, usually ~{}",
                    kind, tx.vendor, days_since, expected
                ),
                self.name(),
            )
            .with_subject_key(format!("timing:{}", pattern.vendor)),
        )
    }
}

fn vendor_key(vendor: &str) -> String {
    vendor.trim().to_lowercase()
}

impl Detector for RecurringDetector {
    fn name(&self) -> &'static str {
        "recurring"
    }

    fn scan(&self, tx: &Transaction, neighborhood: &Neighborhood) -> Vec<RedFlag> {
        let vendor = vendor_key(&tx.vendor);
        if !tx.is_debit() || vendor.is_empty() {
            return Vec::new();
        }

        let history: Vec<&Transaction> = neighborhood
            .transactions
            .iter()
            .filter(|n| n.is_debit() && n.date < tx.date && vendor_key(&n.vendor) == vendor)
            .collect();

        let Some(pattern) = VendorPattern::learn(&vendor, &history, self.min_occurrences, self.amount_variance) else {
            return Vec::new();
        };

        self.check_amount(tx, &pattern)
            .into_iter()
            .chain(self.check_timing(tx, &pattern))
            .collect()
    }
}

// ============================================================================
// OVERDUE PAYMENTS
// ============================================================================

/// A monthly payment whose next occurrence is past due
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverduePayment {
    pub vendor: String,
    pub expected_date: NaiveDate,
    pub days_overdue: i64,
    pub expected_amount: f64,
    pub severity: Severity,
}

/// Monthly vendor patterns with no payment within tolerance of the expected date
pub fn overdue_payments(transactions: &[Transaction], as_of: NaiveDate, config: &AnomalyConfig) -> Vec<OverduePayment> {
    let mut by_vendor: BTreeMap<String, Vec<&Transaction>> = BTreeMap::new();
    for t in transactions
        .iter()
        .filter(|t| t.direction == Direction::Debit && t.date <= as_of)
    {
        let vendor = vendor_key(&t.vendor);
        if !vendor.is_empty() {
            by_vendor.entry(vendor).or_default().push(t);
        }
    }

    by_vendor
        .into_iter()
        .filter_map(|(vendor, history)| {
            let pattern = VendorPattern::learn(
                &vendor,
                &history,
                config.recurring_min_occurrences,
                config.recurring_amount_variance,
            )?;
            if !pattern.monthly {
                return None;
            }

            let expected_date = pattern.expected_next();
            let days_overdue = (as_of - expected_date).num_days();
            (days_overdue > config.recurring_date_tolerance_days).then(|| OverduePayment {
                vendor: history[0].vendor.clone(),
                expected_date,
                days_overdue,
                expected_amount: pattern.mean_amount,
                severity: Severity::Medium,
            })
        })
        .collect()
}
