// 🧭 Ledger Classification Engine - rule → similarity → model cascade
//
// Escalates only while confidence is insufficient and always records the
// tier that produced the answer. The cascade never fails: timeouts and
// service errors are recorded as degradations and land on needs_review.

use crate::config::ClassificationConfig;
use crate::model::{ClassificationProposal, Tier, Transaction};
use crate::rules::RuleTable;
use crate::services::{
    call_with_retry, ModelClassifier, RetryPolicy, SimilarMatch, SimilarityIndex, MODEL_SERVICE,
    SIMILARITY_SERVICE,
};
use crate::store::LedgerStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Category used when nothing trustworthy is available
pub const SUSPENSE_CATEGORY: &str = "Suspense";

/// Confidence of a reviewer-confirmed vendor → category mapping
pub const VENDOR_HISTORY_CONFIDENCE: f64 = 0.95;

// ============================================================================
// VENDOR HISTORY
// ============================================================================

/// Reviewer-confirmed categories, used by the rule tier
pub trait VendorHistory: Send + Sync {
    fn reviewer_category(&self, client_id: &str, vendor: &str) -> Option<String>;
}

impl VendorHistory for LedgerStore {
    fn reviewer_category(&self, client_id: &str, vendor: &str) -> Option<String> {
        LedgerStore::reviewer_category(self, client_id, vendor)
    }
}

// ============================================================================
// CANDIDATES
// ============================================================================

/// A sub-decision from one tier, kept in case later tiers fail
#[derive(Debug, Clone)]
struct Candidate {
    category: String,
    confidence: f64,
    tier: Tier,
    rationale: String,
    law_references: Vec<String>,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ClassificationEngine {
    rules: Arc<RuleTable>,
    similarity: Arc<dyn SimilarityIndex>,
    model: Arc<dyn ModelClassifier>,
    vendor_history: Option<Arc<dyn VendorHistory>>,
    config: ClassificationConfig,
    retry: RetryPolicy,
}

impl ClassificationEngine {
    pub fn new(
        rules: Arc<RuleTable>,
        similarity: Arc<dyn SimilarityIndex>,
        model: Arc<dyn ModelClassifier>,
        config: ClassificationConfig,
    ) -> Self {
        ClassificationEngine {
            retry: RetryPolicy::from_config(&config),
            rules,
            similarity,
            model,
            vendor_history: None,
            config,
        }
    }

    pub fn with_vendor_history(mut self, history: Arc<dyn VendorHistory>) -> Self {
        self.vendor_history = Some(history);
        self
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    /// Feed a confirmed classification into the similarity corpus
    pub fn learn(&self, tx: &Transaction, category: &str) {
        self.similarity.learn(&tx.client_id, &tx.description, category);
    }

    /// Run the cascade. Infallible by construction.
    pub async fn classify(&self, tx: &Transaction) -> ClassificationProposal {
        let mut degradations = Vec::new();

        // ---- Tier 1: rules + reviewer-confirmed vendor history ----
        let rule_candidate = self.rule_tier(tx);
        if let Some(c) = &rule_candidate {
            if c.confidence >= self.config.rule_threshold {
                return self.accept(c.clone(), false, degradations);
            }
        }
        debug!(transaction_id = %tx.id, "rule tier below threshold, escalating");

        // ---- Tier 2: tenant-scoped similarity ----
        let matches = match call_with_retry(SIMILARITY_SERVICE, &self.retry, || {
            self.similarity.nearest(&tx.client_id, &tx.description)
        })
        .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "similarity tier degraded");
                degradations.push(e.to_string());
                Vec::new()
            }
        };

        let similarity_candidate = matches.first().map(|top| Candidate {
            category: top.category.clone(),
            confidence: top.similarity,
            tier: Tier::Similarity,
            rationale: format!(
                "nearest classified transaction '{}' (similarity {:.2})",
                top.text, top.similarity
            ),
            law_references: self.rules.law_references_for(&top.category),
        });

        if let Some(c) = &similarity_candidate {
            if c.confidence >= self.config.similarity_threshold {
                return self.accept(c.clone(), false, degradations);
            }
        }
        debug!(transaction_id = %tx.id, "similarity tier below threshold, escalating");

        // ---- Tier 3: model-assisted, bounded by timeout ----
        let examples: Vec<SimilarMatch> = matches
            .into_iter()
            .take(self.config.similar_examples)
            .collect();
        let taxonomy = self.rules.categories().to_vec();

        let verdict = call_with_retry(MODEL_SERVICE, &self.retry, || {
            self.model.classify_with_context(tx, &examples, &taxonomy)
        })
        .await;

        let fallback = best_of(rule_candidate, similarity_candidate);

        match verdict {
            Ok(verdict) => {
                let rationale = verdict.rationale.trim().to_string();
                let confidence = verdict.confidence.clamp(0.0, 1.0);

                match self.rules.canonical_category(&verdict.category) {
                    Some(category) => {
                        let low_confidence = confidence < self.config.model_threshold;
                        let missing_rationale = rationale.is_empty();
                        if missing_rationale {
                            degradations.push("model returned no rationale".to_string());
                        }

                        self.accept(
                            Candidate {
                                category: category.to_string(),
                                confidence,
                                tier: Tier::Model,
                                rationale: if missing_rationale {
                                    "model gave no rationale".to_string()
                                } else {
                                    rationale
                                },
                                law_references: self.rules.law_references_for(category),
                            },
                            low_confidence || missing_rationale,
                            degradations,
                        )
                    }
                    None => {
                        warn!(
                            transaction_id = %tx.id,
                            category = %verdict.category,
                            "model proposed a category outside the taxonomy"
                        );
                        degradations.push(format!(
                            "model proposed unknown category '{}': {}",
                            verdict.category, rationale
                        ));
                        self.degrade(fallback, degradations)
                    }
                }
            }
            Err(e) => {
                warn!(transaction_id = %tx.id, error = %e, "model tier degraded");
                degradations.push(e.to_string());
                self.degrade(fallback, degradations)
            }
        }
    }

    fn rule_tier(&self, tx: &Transaction) -> Option<Candidate> {
        let history = self.vendor_history.as_ref().and_then(|h| {
            let category = h.reviewer_category(&tx.client_id, &tx.vendor)?;
            Some(Candidate {
                law_references: self.rules.law_references_for(&category),
                rationale: format!(
                    "reviewer previously confirmed '{}' for vendor '{}'",
                    category, tx.vendor
                ),
                category,
                confidence: VENDOR_HISTORY_CONFIDENCE,
                tier: Tier::Rule,
            })
        });

        let table = self.rules.best_match(tx).map(|m| Candidate {
            rationale: format!("rule '{}' matched: {}", m.rule_id, m.matched.join(", ")),
            category: m.category,
            confidence: m.confidence,
            tier: Tier::Rule,
            law_references: m.law_references,
        });

        best_of(history, table)
    }

    fn accept(
        &self,
        candidate: Candidate,
        needs_review: bool,
        degradations: Vec<String>,
    ) -> ClassificationProposal {
        ClassificationProposal {
            ledger_category: candidate.category,
            confidence: candidate.confidence,
            tier: candidate.tier,
            rationale: candidate.rationale,
            law_references: candidate.law_references,
            needs_review,
            rule_table_version: self.rules.version().to_string(),
            degradations,
        }
    }

    /// Model path gave nothing usable: keep the best earlier guess, flagged
    fn degrade(&self, fallback: Option<Candidate>, degradations: Vec<String>) -> ClassificationProposal {
        let candidate = fallback.unwrap_or_else(|| Candidate {
            category: SUSPENSE_CATEGORY.to_string(),
            confidence: 0.0,
            tier: Tier::Model,
            rationale: "no tier produced a usable category".to_string(),
            law_references: Vec::new(),
        });
        self.accept(candidate, true, degradations)
    }
}

fn best_of(a: Option<Candidate>, b: Option<Candidate>) -> Option<Candidate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.confidence > a.confidence { b } else { a }),
        (a, b) => a.or(b),
    }
}

// ============================================================================
// TESTS
// ============================================================================
