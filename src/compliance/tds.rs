// 💸 TDS rules - one rule per Income Tax Act section (194C, 194J, 194I, 194H, 194A)
//
// A section applies when the payment looks like its kind of service (keywords
// or ledger category). TDS is then due if the single payment reaches the
// single threshold, or if the financial-year total of this section's payments
// to the vendor, including this one, exceeds the aggregate threshold.

use super::{find_keyword, padded_text, ComplianceRule, EvaluationContext, RuleOutcome};
use crate::config::TdsSectionConfig;
use crate::error::{PipelineError, Result};
use crate::model::PriorPayment;

/// Whether one section requires deduction on this payment
#[derive(Debug, Clone, PartialEq)]
pub struct TdsAssessment {
    pub due: bool,
    pub deduction: f64,
    pub reason: String,
}

pub struct TdsRule {
    id: String,
    section_reference: String,
    section: TdsSectionConfig,
}

impl TdsRule {
    pub fn new(section: TdsSectionConfig) -> Self {
        TdsRule {
            id: format!("tds.{}", section.section.to_lowercase()),
            section_reference: format!("Income Tax Act, 1961 §{}", section.section),
            section,
        }
    }

    pub fn section(&self) -> &TdsSectionConfig {
        &self.section
    }

    fn category_matches(&self, category: &str) -> bool {
        self.section
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Same test as `applies`, on an earlier payment
    fn covers(&self, payment: &PriorPayment) -> bool {
        self.category_matches(&payment.category)
            || find_keyword(&padded_text(&payment.description, &payment.category), &self.section.keywords).is_some()
    }

    /// Thresholds for a payment this section applies to
    pub fn assess(&self, ctx: &EvaluationContext) -> Result<TdsAssessment> {
        let s = &self.section;
        let prior = ctx.prior_total(|p| self.covers(p));
        if s.single_threshold <= 0.0 || s.aggregate_threshold <= 0.0 || !prior.is_finite() {
            return Err(PipelineError::ComplianceRule {
                rule_id: self.id.clone(),
                message: format!(
                    "unusable inputs: single {} / aggregate {} / prior total {}",
                    s.single_threshold, s.aggregate_threshold, prior
                ),
            });
        }

        let amount = ctx.transaction.amount;
        let aggregate = prior + amount;
        let deduction = amount * s.rate / 100.0;

        let (due, reason) = if amount >= s.single_threshold {
            (
                true,
                format!(
                    "{}: single payment ₹{:.2} reaches threshold ₹{:.0}; deduct {}% (₹{:.2})",
                    s.name, amount, s.single_threshold, s.rate, deduction
                ),
            )
        } else if aggregate > s.aggregate_threshold {
            (
                true,
                format!(
                    "{}: financial-year payments to '{}' total ₹{:.2}, above ₹{:.0}; deduct {}% (₹{:.2})",
                    s.name, ctx.transaction.vendor, aggregate, s.aggregate_threshold, s.rate, deduction
                ),
            )
        } else {
            (
                false,
                format!(
                    "{}: ₹{:.2} (year total ₹{:.2}) below thresholds ₹{:.0} / ₹{:.0}",
                    s.name, amount, aggregate, s.single_threshold, s.aggregate_threshold
                ),
            )
        };

        Ok(TdsAssessment { due, deduction, reason })
    }
}

impl ComplianceRule for TdsRule {
    fn id(&self) -> &str {
        &self.id
    }

    fn section_reference(&self) -> &str {
        &self.section_reference
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        ctx.transaction.is_debit()
            && (self.category_matches(ctx.category())
                || find_keyword(&ctx.text(), &self.section.keywords).is_some())
    }

    fn not_applicable_reason(&self) -> String {
        format!("not a {} payment", self.section.name.to_lowercase())
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        let assessment = self.assess(ctx)?;
        Ok(if assessment.due {
            RuleOutcome::applicable(assessment.reason)
        } else {
            RuleOutcome::not_applicable(assessment.reason)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::testing::classified;

    fn section(code: &str) -> TdsSectionConfig {
        TdsSectionConfig::defaults()
            .into_iter()
            .find(|s| s.section == code)
            .unwrap()
    }

    fn earlier(amount: f64, description: &str, category: &str) -> PriorPayment {
        PriorPayment {
            amount,
            description: description.to_string(),
            category: category.to_string(),
        }
    }

    fn run_with(
        rule: &TdsRule,
        description: &str,
        amount: &str,
        category: &str,
        prior: &[PriorPayment],
    ) -> Option<Result<RuleOutcome>> {
        let (tx, classification) = classified(description, amount, None, None, category);
        let ctx = EvaluationContext {
            transaction: &tx,
            classification: &classification,
            prior_payments: prior,
        };
        rule.applies(&ctx).then(|| rule.evaluate(&ctx))
    }

    /// Prior total as one earlier payment of the same kind
    fn run(rule: &TdsRule, description: &str, amount: &str, category: &str, prior: f64) -> Option<Result<RuleOutcome>> {
        run_with(rule, description, amount, category, &[earlier(prior, description, category)])
    }

    #[test]
    fn test_ids_and_references() {
        let rule = TdsRule::new(section("194C"));
        assert_eq!(rule.id(), "tds.194c");
        assert_eq!(rule.section_reference(), "Income Tax Act, 1961 §194C");
    }

    #[test]
    fn test_194c_single_threshold() {
        let rule = TdsRule::new(section("194C"));
        let outcome = run(&rule, "Contractor bill for shed", "35000", "Contract Labour", 0.0)
            .unwrap()
            .unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("350.00"));
    }

    #[test]
    fn test_194c_aggregate_threshold() {
        let rule = TdsRule::new(section("194C"));

        let below = run(&rule, "Contractor bill", "20000", "Contract Labour", 60_000.0).unwrap().unwrap();
        assert!(!below.applicable);

        let above = run(&rule, "Contractor bill", "20000", "Contract Labour", 90_000.0).unwrap().unwrap();
        assert!(above.applicable);
        assert!(above.reason.contains("110000.00"));
    }

    #[test]
    fn test_aggregate_counts_only_same_section_payments() {
        let rule = TdsRule::new(section("194C"));
        let prior = [
            earlier(60_000.0, "Shop rent May", "Rent"),
            earlier(45_000.0, "Shop rent June", ""),
            earlier(30_000.0, "Civil work order 12", "Repairs"),
        ];

        // Only the work order counts: 30000 + 20000 stays under 100000
        let outcome = run_with(&rule, "Contractor bill", "20000", "Contract Labour", &prior)
            .unwrap()
            .unwrap();
        assert!(!outcome.applicable);
        assert!(outcome.reason.contains("50000.00"));

        let more = [prior.to_vec(), vec![earlier(60_000.0, "Labour charges", "Contract Labour")]].concat();
        let outcome = run_with(&rule, "Contractor bill", "20000", "Contract Labour", &more)
            .unwrap()
            .unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("110000.00"));
    }

    #[test]
    fn test_category_alone_triggers_section() {
        let rule = TdsRule::new(section("194J"));
        let outcome = run(&rule, "Invoice 77", "45000", "Professional Fees", 0.0).unwrap().unwrap();
        assert!(outcome.applicable);
    }

    #[test]
    fn test_unrelated_payment_not_applicable() {
        let rule = TdsRule::new(section("194I"));
        assert!(run(&rule, "Diesel", "300000", "Fuel", 0.0).is_none());
    }

    #[test]
    fn test_bad_threshold_is_rule_error() {
        let mut cfg = section("194H");
        cfg.single_threshold = 0.0;
        let rule = TdsRule::new(cfg);
        let err = run(&rule, "Commission to agent", "5000", "Commission", 0.0).unwrap().unwrap_err();
        assert!(matches!(err, PipelineError::ComplianceRule { .. }));
    }
}
