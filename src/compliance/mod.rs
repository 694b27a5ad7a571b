// ⚖️ Compliance Rule Engine
//
// Every rule is a pure function of (transaction, active classification,
// prior payments to the vendor). Rules never see each other's output, so they are
// evaluated in parallel and emitted in registry order. A rule that errors
// or panics yields an `unknown` finding instead of disappearing.

pub mod gst;
pub mod income_tax;
pub mod tds;

use crate::config::ComplianceConfig;
use crate::error::{PipelineError, Result};
use crate::model::{
    Applicability, ClassificationResult, ComplianceFinding, Origin, PriorPayment, Transaction,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::thread;
use tracing::warn;

pub use gst::{validate_gstin, GstinError, ItcEligibilityRule, ReverseChargeRule};
pub use income_tax::{CapitalExpenditureRule, CashPaymentLimitRule, TdsDefaultRule};
pub use tds::{TdsAssessment, TdsRule};

// ============================================================================
// RULE CONTRACT
// ============================================================================

/// Everything a rule may look at
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub transaction: &'a Transaction,
    pub classification: &'a ClassificationResult,

    /// Earlier debit payments to the same vendor in the same financial year
    pub prior_payments: &'a [PriorPayment],
}

impl<'a> EvaluationContext<'a> {
    pub fn category(&self) -> &str {
        &self.classification.ledger_category
    }

    /// Normalized description + category, padded for whole-word lookups
    pub fn text(&self) -> String {
        padded_text(&self.transaction.description, &self.classification.ledger_category)
    }

    /// Sum of the prior payments that `keep` accepts
    pub fn prior_total(&self, keep: impl Fn(&PriorPayment) -> bool) -> f64 {
        self.prior_payments.iter().filter(|p| keep(p)).map(|p| p.amount).sum()
    }
}

/// Normalized description + category, padded with spaces so every word has a boundary
pub fn padded_text(description: &str, category: &str) -> String {
    format!(
        " {} {} ",
        crate::normalization::normalize_description(description),
        crate::normalization::normalize_description(category)
    )
}

/// First keyword present as a whole word (or phrase) in padded text
pub fn find_keyword<'k>(padded_text: &str, keywords: &'k [String]) -> Option<&'k str> {
    keywords
        .iter()
        .map(String::as_str)
        .find(|k| crate::normalization::contains_phrase(padded_text, k))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub applicable: bool,
    pub reason: String,
    /// Overrides the rule's default section reference for this outcome
    pub section_reference: Option<String>,
}

impl RuleOutcome {
    pub fn applicable(reason: impl Into<String>) -> Self {
        RuleOutcome {
            applicable: true,
            reason: reason.into(),
            section_reference: None,
        }
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        RuleOutcome {
            applicable: false,
            reason: reason.into(),
            section_reference: None,
        }
    }

    pub fn citing(mut self, section: &str) -> Self {
        self.section_reference = Some(section.to_string());
        self
    }
}

pub trait ComplianceRule: Send + Sync {
    fn id(&self) -> &str;

    fn section_reference(&self) -> &str;

    /// Cheap applicability predicate; false yields a not_applicable finding
    fn applies(&self, ctx: &EvaluationContext) -> bool;

    /// Reason used when `applies` is false
    fn not_applicable_reason(&self) -> String {
        "preconditions not met".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome>;
}

// ============================================================================
// ENGINE
// ============================================================================

pub const ENGINE_VERSION: &str = "compliance-1";

pub struct ComplianceEngine {
    rules: Vec<Arc<dyn ComplianceRule>>,
    version: String,
}

impl ComplianceEngine {
    pub fn new(rules: Vec<Arc<dyn ComplianceRule>>, version: &str) -> Self {
        ComplianceEngine {
            rules,
            version: version.to_string(),
        }
    }

    /// Standard Indian rule registry. The version string fingerprints the
    /// configuration so findings record exactly which thresholds produced them.
    pub fn standard(config: &ComplianceConfig) -> Self {
        let mut rules: Vec<Arc<dyn ComplianceRule>> = vec![
            Arc::new(ItcEligibilityRule::new()),
            Arc::new(ReverseChargeRule::new()),
        ];
        for section in &config.tds_sections {
            rules.push(Arc::new(TdsRule::new(section.clone())));
        }
        rules.push(Arc::new(CashPaymentLimitRule::new(config.cash_payment_limit)));
        rules.push(Arc::new(TdsDefaultRule::new(
            config.tds_sections.clone(),
            config.tds_default_disallowance_rate,
        )));
        rules.push(Arc::new(CapitalExpenditureRule::new()));

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_string(config).unwrap_or_default());
        let digest = format!("{:x}", hasher.finalize());

        ComplianceEngine::new(rules, &format!("{}:{}", ENGINE_VERSION, &digest[..12]))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.iter().map(|r| r.id().to_string()).collect()
    }

    /// Evaluate every registered rule. Output order = registry order.
    pub fn evaluate(
        &self,
        transaction: &Transaction,
        classification: &ClassificationResult,
        prior_payments: &[PriorPayment],
    ) -> Vec<ComplianceFinding> {
        let ctx = EvaluationContext {
            transaction,
            classification,
            prior_payments,
        };

        let outcomes: Vec<std::result::Result<RuleOutcome, PipelineError>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .rules
                .iter()
                .map(|rule| {
                    let rule = Arc::clone(rule);
                    scope.spawn(move || run_rule(rule.as_ref(), &ctx))
                })
                .collect();

            handles
                .into_iter()
                .zip(&self.rules)
                .map(|(handle, rule)| {
                    handle.join().unwrap_or_else(|panic| {
                        Err(PipelineError::ComplianceRule {
                            rule_id: rule.id().to_string(),
                            message: panic_message(panic.as_ref()),
                        })
                    })
                })
                .collect()
        });

        self.rules
            .iter()
            .zip(outcomes)
            .map(|(rule, outcome)| self.to_finding(rule.as_ref(), &ctx, outcome))
            .collect()
    }

    fn to_finding(
        &self,
        rule: &dyn ComplianceRule,
        ctx: &EvaluationContext,
        outcome: std::result::Result<RuleOutcome, PipelineError>,
    ) -> ComplianceFinding {
        let (applicable, reason, section) = match outcome {
            Ok(o) => (
                Applicability::from_bool(o.applicable),
                o.reason,
                o.section_reference
                    .unwrap_or_else(|| rule.section_reference().to_string()),
            ),
            Err(e) => {
                warn!(
                    rule_id = rule.id(),
                    transaction_id = %ctx.transaction.id,
                    error = %e,
                    "compliance rule failed, recording unknown finding"
                );
                (
                    Applicability::Unknown,
                    format!("{}: {}", e.kind(), e),
                    rule.section_reference().to_string(),
                )
            }
        };

        ComplianceFinding {
            transaction_id: ctx.transaction.id.clone(),
            classification_version: ctx.classification.version,
            rule_id: rule.id().to_string(),
            applicable,
            section_reference: section,
            reason,
            rule_table_version: self.version.clone(),
            origin: Origin::Derived,
        }
    }
}

fn run_rule(rule: &dyn ComplianceRule, ctx: &EvaluationContext) -> Result<RuleOutcome> {
    if !rule.applies(ctx) {
        return Ok(RuleOutcome::not_applicable(rule.not_applicable_reason()));
    }
    rule.evaluate(ctx).map_err(|e| match e {
        PipelineError::ComplianceRule { .. } => e,
        other => PipelineError::ComplianceRule {
            rule_id: rule.id().to_string(),
            message: other.to_string(),
        },
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("rule panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("rule panicked: {}", s)
    } else {
        "rule panicked".to_string()
    }
}

// ============================================================================
// TEST HELPERS
// ============================================================================


// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::classified;
    use super::*;
    use crate::config::ComplianceConfig;

    struct FailingRule;

    impl ComplianceRule for FailingRule {
        fn id(&self) -> &str {
            "test.failing"
        }
        fn section_reference(&self) -> &str {
            "Test Act §1"
        }
        fn applies(&self, _ctx: &EvaluationContext) -> bool {
            true
        }
        fn evaluate(&self, _ctx: &EvaluationContext) -> Result<RuleOutcome> {
            Err(PipelineError::Config("threshold table missing".to_string()))
        }
    }

    struct PanickingRule;

    impl ComplianceRule for PanickingRule {
        fn id(&self) -> &str {
            "test.panicking"
        }
        fn section_reference(&self) -> &str {
            "Test Act §2"
        }
        fn applies(&self, _ctx: &EvaluationContext) -> bool {
            true
        }
        fn evaluate(&self, _ctx: &EvaluationContext) -> Result<RuleOutcome> {
            panic!("divide by zero")
        }
    }

    #[test]
    fn test_standard_registry_order() {
        let engine = ComplianceEngine::standard(&ComplianceConfig::default());
        assert_eq!(
            engine.rule_ids(),
            vec![
                "gst.itc_eligibility",
                "gst.reverse_charge",
                "tds.194c",
                "tds.194j",
                "tds.194i",
                "tds.194h",
                "tds.194a",
                "it.40a3_cash_limit",
                "it.40a_ia_tds_default",
                "it.capital_expenditure",
            ]
        );
        assert!(engine.version().starts_with("compliance-1:"));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let engine = ComplianceEngine::standard(&ComplianceConfig::default());
        let (tx, classification) = classified("Office Rent", "50000", Some("cash"), None, "Rent");

        let first = engine.evaluate(&tx, &classification, &[]);
        let second = engine.evaluate(&tx, &classification, &[]);

        assert_eq!(first, second);
        assert_eq!(first.len(), engine.rule_ids().len());
        assert!(first.iter().all(|f| f.classification_version == 1));
    }

    #[test]
    fn test_config_changes_version() {
        let default = ComplianceEngine::standard(&ComplianceConfig::default());
        let strict = ComplianceEngine::standard(&ComplianceConfig {
            cash_payment_limit: 5_000.0,
            ..ComplianceConfig::default()
        });
        assert_ne!(default.version(), strict.version());
    }

    #[test]
    fn test_failing_and_panicking_rules_become_unknown() {
        let engine = ComplianceEngine::new(
            vec![
                Arc::new(FailingRule),
                Arc::new(PanickingRule),
                Arc::new(CashPaymentLimitRule::new(10_000.0)),
            ],
            "test-1",
        );
        let (tx, classification) = classified("Office Rent", "50000", Some("cash"), None, "Rent");

        let findings = engine.evaluate(&tx, &classification, &[]);

        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].rule_id, "test.failing");
        assert_eq!(findings[0].applicable, Applicability::Unknown);
        assert!(findings[0].reason.contains("compliance_rule_error"));
        assert_eq!(findings[1].applicable, Applicability::Unknown);
        assert!(findings[1].reason.contains("divide by zero"));
        assert_eq!(findings[2].applicable, Applicability::Applicable);
    }

    #[test]
    fn test_find_keyword_whole_words() {
        let keywords = vec!["ca".to_string(), "legal".to_string()];
        assert_eq!(find_keyword(" legal fees ", &keywords), Some("legal"));
        assert_eq!(find_keyword(" cab fare ", &keywords), None);
    }
}
