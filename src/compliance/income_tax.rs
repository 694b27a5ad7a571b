// 🏛️ Income Tax Act rules - §40A(3) cash disallowance, §40(a)(ia) TDS default,
// §32 capital expenditure

use super::{find_keyword, ComplianceRule, EvaluationContext, RuleOutcome, TdsRule};
use crate::config::TdsSectionConfig;
use crate::error::Result;

// ============================================================================
// §40A(3) CASH PAYMENT LIMIT
// ============================================================================

/// applicable = expenditure disallowed because it was paid in cash above the limit
pub struct CashPaymentLimitRule {
    limit: f64,
}

impl CashPaymentLimitRule {
    pub fn new(limit: f64) -> Self {
        CashPaymentLimitRule { limit }
    }
}

impl ComplianceRule for CashPaymentLimitRule {
    fn id(&self) -> &str {
        "it.40a3_cash_limit"
    }

    fn section_reference(&self) -> &str {
        "Income Tax Act, 1961 §40A(3)"
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        ctx.transaction.is_debit() && ctx.transaction.is_cash()
    }

    fn not_applicable_reason(&self) -> String {
        "not a cash payment".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        let amount = ctx.transaction.amount;
        if amount > self.limit {
            Ok(RuleOutcome::applicable(format!(
                "cash payment ₹{:.2} exceeds ₹{:.0} per-transaction limit; '{}' expenditure is disallowed",
                amount,
                self.limit,
                ctx.category()
            )))
        } else {
            Ok(RuleOutcome::not_applicable(format!(
                "cash payment ₹{:.2} within ₹{:.0} limit",
                amount, self.limit
            )))
        }
    }
}

// ============================================================================
// §40(a)(ia) TDS DEFAULT
// ============================================================================

/// applicable = part of the expense disallowed because TDS was due but not deducted
pub struct TdsDefaultRule {
    sections: Vec<TdsRule>,
    /// Percent of the payment disallowed
    rate: f64,
}

impl TdsDefaultRule {
    pub fn new(sections: Vec<TdsSectionConfig>, rate: f64) -> Self {
        TdsDefaultRule {
            sections: sections.into_iter().map(TdsRule::new).collect(),
            rate,
        }
    }
}

impl ComplianceRule for TdsDefaultRule {
    fn id(&self) -> &str {
        "it.40a_ia_tds_default"
    }

    fn section_reference(&self) -> &str {
        "Income Tax Act, 1961 §40(a)(ia)"
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        self.sections.iter().any(|s| s.applies(ctx))
    }

    fn not_applicable_reason(&self) -> String {
        "no TDS section covers this payment".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        let mut due = Vec::new();
        for rule in self.sections.iter().filter(|s| s.applies(ctx)) {
            let assessment = rule.assess(ctx)?;
            if assessment.due {
                due.push((rule.section().section.as_str(), assessment.deduction));
            }
        }

        if due.is_empty() {
            return Ok(RuleOutcome::not_applicable("TDS not due on this payment"));
        }

        let sections: Vec<String> = due.iter().map(|(s, _)| format!("§{}", s)).collect();
        let expected: f64 = due.iter().map(|(_, d)| d).sum();

        match ctx.transaction.tds_deducted.filter(|d| *d > 0.0) {
            Some(deducted) => Ok(RuleOutcome::not_applicable(format!(
                "TDS ₹{:.2} deducted under {} (expected ₹{:.2})",
                deducted,
                sections.join(", "),
                expected
            ))),
            None => {
                let amount = ctx.transaction.amount;
                Ok(RuleOutcome::applicable(format!(
                    "TDS ₹{:.2} due under {} was not deducted; {}% of ₹{:.2} (₹{:.2}) is disallowed until it is deposited",
                    expected,
                    sections.join(", "),
                    self.rate,
                    amount,
                    amount * self.rate / 100.0
                )))
            }
        }
    }
}

// ============================================================================
// CAPITAL EXPENDITURE (§32 DEPRECIATION)
// ============================================================================

/// Asset blocks and their written-down-value rates
const ASSET_BLOCKS: &[(&str, &[&str], f64)] = &[
    ("building", &["building", "construction", "property"], 10.0),
    ("computer", &["computer", "computers", "laptop", "server"], 40.0),
    ("machinery", &["machinery", "machine", "equipment", "plant"], 15.0),
    ("vehicle", &["vehicle", "car", "truck", "scooter"], 15.0),
    ("furniture", &["furniture", "furnishing", "fixtures"], 10.0),
];

const DEFAULT_BLOCK_RATE: f64 = 15.0;

const CAPITAL_CATEGORIES: &[&str] = &["Fixed Assets"];

/// applicable = capitalise and depreciate instead of expensing
pub struct CapitalExpenditureRule {
    keywords: Vec<String>,
}

impl CapitalExpenditureRule {
    pub fn new() -> Self {
        CapitalExpenditureRule {
            keywords: ASSET_BLOCKS
                .iter()
                .flat_map(|(_, words, _)| words.iter().map(|w| w.to_string()))
                .chain(["land".to_string()])
                .collect(),
        }
    }

    fn block_for(text: &str) -> (&'static str, f64) {
        for (block, words, rate) in ASSET_BLOCKS {
            if words.iter().any(|w| text.contains(&format!(" {} ", w))) {
                return (*block, *rate);
            }
        }
        ("general plant", DEFAULT_BLOCK_RATE)
    }
}

impl Default for CapitalExpenditureRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceRule for CapitalExpenditureRule {
    fn id(&self) -> &str {
        "it.capital_expenditure"
    }

    fn section_reference(&self) -> &str {
        "Income Tax Act, 1961 §32"
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        ctx.transaction.is_debit()
    }

    fn not_applicable_reason(&self) -> String {
        "receipt, not an outlay".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        let text = ctx.text();
        let by_category = CAPITAL_CATEGORIES
            .iter()
            .any(|c| c.eq_ignore_ascii_case(ctx.category()));
        let keyword = find_keyword(&text, &self.keywords);

        if !by_category && keyword.is_none() {
            return Ok(RuleOutcome::not_applicable("revenue expenditure"));
        }

        if keyword == Some("land") {
            return Ok(RuleOutcome::applicable(
                "capital outlay on land: capitalise; land is not depreciable",
            ));
        }

        let (block, rate) = Self::block_for(&text);
        Ok(RuleOutcome::applicable(format!(
            "capital outlay: capitalise under block '{}' and claim depreciation at {}% WDV (first-year ₹{:.2}) instead of expensing",
            block,
            rate,
            ctx.transaction.amount * rate / 100.0
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::testing::classified;

    fn run(rule: &dyn ComplianceRule, description: &str, amount: &str, mode: Option<&str>, category: &str) -> Option<RuleOutcome> {
        let (tx, classification) = classified(description, amount, mode, None, category);
        let ctx = EvaluationContext {
            transaction: &tx,
            classification: &classification,
            prior_payments: &[],
        };
        rule.applies(&ctx).then(|| rule.evaluate(&ctx).unwrap())
    }

    fn run_deducted(
        rule: &dyn ComplianceRule,
        description: &str,
        amount: &str,
        category: &str,
        tds: Option<f64>,
    ) -> Option<RuleOutcome> {
        let (mut tx, classification) = classified(description, amount, None, None, category);
        tx.tds_deducted = tds;
        let ctx = EvaluationContext {
            transaction: &tx,
            classification: &classification,
            prior_payments: &[],
        };
        rule.applies(&ctx).then(|| rule.evaluate(&ctx).unwrap())
    }

    fn tds_default_rule() -> TdsDefaultRule {
        TdsDefaultRule::new(TdsSectionConfig::defaults(), 30.0)
    }

    #[test]
    fn test_tds_due_but_not_deducted_disallowed() {
        let outcome = run_deducted(&tds_default_rule(), "Contractor bill for shed", "45000", "Contract Labour", None)
            .unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("§194C"));
        assert!(outcome.reason.contains("13500.00"));
    }

    #[test]
    fn test_tds_deducted_not_disallowed() {
        let outcome = run_deducted(&tds_default_rule(), "Contractor bill for shed", "45000", "Contract Labour", Some(450.0))
            .unwrap();
        assert!(!outcome.applicable);
        assert!(outcome.reason.contains("450.00"));
    }

    #[test]
    fn test_tds_below_threshold_or_uncovered() {
        let below = run_deducted(&tds_default_rule(), "Contractor bill", "12000", "Contract Labour", None).unwrap();
        assert!(!below.applicable);

        assert!(run_deducted(&tds_default_rule(), "Diesel", "90000", "Fuel", None).is_none());
    }

    #[test]
    fn test_cash_over_limit_disallowed() {
        let rule = CashPaymentLimitRule::new(10_000.0);
        let outcome = run(&rule, "Office Rent", "50000", Some("cash"), "Rent").unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("50000.00"));
    }

    #[test]
    fn test_cash_at_limit_allowed() {
        let rule = CashPaymentLimitRule::new(10_000.0);
        let outcome = run(&rule, "Office Rent", "10000", Some("cash"), "Rent").unwrap();
        assert!(!outcome.applicable);
    }

    #[test]
    fn test_non_cash_not_evaluated() {
        let rule = CashPaymentLimitRule::new(10_000.0);
        assert!(run(&rule, "Office Rent", "50000", Some("neft"), "Rent").is_none());
    }

    #[test]
    fn test_capital_purchase_depreciation_block() {
        let rule = CapitalExpenditureRule::new();
        let outcome = run(&rule, "Dell laptop for accounts", "80000", None, "Fixed Assets").unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("'computer'"));
        assert!(outcome.reason.contains("32000.00"));
    }

    #[test]
    fn test_revenue_expense() {
        let rule = CapitalExpenditureRule::new();
        let outcome = run(&rule, "Printer paper", "800", None, "Office Supplies").unwrap();
        assert!(!outcome.applicable);
    }
}
