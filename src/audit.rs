// 📜 Audit / Override Ledger
//
// The only path by which a human changes a pipeline conclusion. An override
// never edits a row: it appends a new version (classification, finding) or
// sets the resolution pointer (red flag), and writes an AuditEntry linking
// old → new with actor and reason.

use crate::error::{PipelineError, Result};
use crate::model::{
    Applicability, AuditAction, AuditEntry, ClassificationProposal, ClassificationResult,
    FindingRecord, RedFlag, SubjectType, Tier,
};
use crate::rules::RuleTable;
use crate::services::SimilarityIndex;
use crate::store::LedgerStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// EVENTS
// ============================================================================

/// A state-changing event, before it gets an id and timestamp
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub previous_version: Option<u32>,
    pub new_version: Option<u32>,
    pub reason: Option<String>,
    pub data: serde_json::Value,
}

impl AuditEvent {
    pub fn new(subject_type: SubjectType, subject_id: &str, actor: &str, action: AuditAction) -> Self {
        AuditEvent {
            subject_type,
            subject_id: subject_id.to_string(),
            actor: actor.to_string(),
            action,
            previous_version: None,
            new_version: None,
            reason: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn versions(mut self, previous: Option<u32>, new: Option<u32>) -> Self {
        self.previous_version = previous;
        self.new_version = new;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

// ============================================================================
// OVERRIDE REQUESTS
// ============================================================================

/// What the reviewer is changing, with the version they last saw
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "snake_case")]
pub enum OverrideSubject {
    Classification {
        transaction_id: String,
        expected_version: u32,
        category: String,
    },
    ComplianceFinding {
        transaction_id: String,
        rule_id: String,
        expected_version: u32,
        applicable: Applicability,
    },
    RedFlagResolution {
        flag_id: String,
        note: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRequest {
    #[serde(flatten)]
    pub subject: OverrideSubject,
    pub actor: String,
    pub reason: String,
}

/// The new version (or resolved flag) an override produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum OverrideResult {
    Classification(ClassificationResult),
    ComplianceFinding(FindingRecord),
    RedFlag(RedFlag),
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideOutcome {
    pub transaction_id: String,
    pub result: OverrideResult,
    pub audit: AuditEntry,
}

// ============================================================================
// LEDGER
// ============================================================================

pub struct AuditLedger {
    store: LedgerStore,
    rules: Arc<RuleTable>,
    similarity: Option<Arc<dyn SimilarityIndex>>,
}

impl AuditLedger {
    pub fn new(store: LedgerStore, rules: Arc<RuleTable>) -> Self {
        AuditLedger {
            store,
            rules,
            similarity: None,
        }
    }

    /// Reviewer classifications are fed back into this corpus
    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityIndex>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    /// Stamp and append one event
    pub fn record(&self, event: AuditEvent) -> AuditEntry {
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            subject_type: event.subject_type,
            subject_id: event.subject_id,
            actor: event.actor,
            action: event.action,
            previous_version: event.previous_version,
            new_version: event.new_version,
            reason: event.reason,
            timestamp: Utc::now(),
            data: event.data,
        };
        self.store.append_audit(entry.clone());
        entry
    }

    /// Apply a reviewer override. Succeeds, or reports why it was rejected.
    pub fn override_subject(&self, request: OverrideRequest) -> Result<OverrideOutcome> {
        let actor = request.actor.trim();
        let reason = request.reason.trim();
        if actor.is_empty() {
            return Err(PipelineError::validation("actor", &request.actor, "override needs an actor"));
        }
        if reason.is_empty() {
            return Err(PipelineError::validation("reason", &request.reason, "override needs a reason"));
        }

        let outcome = match &request.subject {
            OverrideSubject::Classification {
                transaction_id,
                expected_version,
                category,
            } => self.override_classification(transaction_id, *expected_version, category, actor, reason),
            OverrideSubject::ComplianceFinding {
                transaction_id,
                rule_id,
                expected_version,
                applicable,
            } => self.override_finding(transaction_id, rule_id, *expected_version, *applicable, actor, reason),
            OverrideSubject::RedFlagResolution { flag_id, note } => {
                self.resolve_flag(flag_id, note, actor, reason)
            }
        };

        match &outcome {
            Ok(o) => info!(
                transaction_id = %o.transaction_id,
                actor = %actor,
                action = o.audit.action.as_str(),
                "override applied"
            ),
            Err(e) => warn!(actor = %actor, error = %e, "override rejected"),
        }
        outcome
    }

    fn override_classification(
        &self,
        tx_id: &str,
        expected_version: u32,
        category: &str,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome> {
        let tx = self.store.require_transaction(tx_id)?;
        let category = self
            .rules
            .canonical_category(category.trim())
            .ok_or_else(|| {
                PipelineError::validation("category", category, "not a category of the active rule table")
            })?
            .to_string();

        let previous = self
            .store
            .active_classification(tx_id)
            .map(|c| c.ledger_category);

        let proposal = ClassificationProposal {
            law_references: self.rules.law_references_for(&category),
            ledger_category: category.clone(),
            confidence: 1.0,
            tier: Tier::Reviewer,
            rationale: reason.to_string(),
            needs_review: false,
            rule_table_version: self.rules.version().to_string(),
            degradations: Vec::new(),
        };

        let result = self
            .store
            .record_classification(tx_id, proposal, actor, Some(expected_version))?;

        if let Some(similarity) = &self.similarity {
            similarity.learn(&tx.client_id, &tx.description, &category);
        }

        let audit = self.record(
            AuditEvent::new(SubjectType::Classification, tx_id, actor, AuditAction::Overridden)
                .versions(Some(expected_version), Some(result.version))
                .reason(reason)
                .data(json!({
                    "transaction_id": tx_id,
                    "from_category": previous,
                    "to_category": category,
                })),
        );

        Ok(OverrideOutcome {
            transaction_id: tx_id.to_string(),
            result: OverrideResult::Classification(result),
            audit,
        })
    }

    fn override_finding(
        &self,
        tx_id: &str,
        rule_id: &str,
        expected_version: u32,
        applicable: Applicability,
        actor: &str,
        reason: &str,
    ) -> Result<OverrideOutcome> {
        self.store.require_transaction(tx_id)?;
        let (previous, record) =
            self.store
                .override_finding(tx_id, rule_id, expected_version, applicable, reason)?;

        let audit = self.record(
            AuditEvent::new(
                SubjectType::ComplianceFinding,
                &format!("{}/{}", tx_id, rule_id),
                actor,
                AuditAction::Overridden,
            )
            .versions(Some(previous.version), Some(record.version))
            .reason(reason)
            .data(json!({
                "transaction_id": tx_id,
                "rule_id": rule_id,
                "from": previous.finding.applicable,
                "to": applicable,
                "superseded_record": previous.id,
                "new_record": record.id,
            })),
        );

        Ok(OverrideOutcome {
            transaction_id: tx_id.to_string(),
            result: OverrideResult::ComplianceFinding(record),
            audit,
        })
    }

    fn resolve_flag(&self, flag_id: &str, note: &str, actor: &str, reason: &str) -> Result<OverrideOutcome> {
        let note = if note.trim().is_empty() { reason } else { note.trim() };
        let flag = self.store.resolve_flag(flag_id, actor, note)?;

        let audit = self.record(
            AuditEvent::new(SubjectType::RedFlag, flag_id, actor, AuditAction::FlagResolved)
                .reason(reason)
                .data(json!({
                    "transaction_id": flag.transaction_id,
                    "flag_type": flag.flag_type,
                    "note": note,
                })),
        );

        Ok(OverrideOutcome {
            transaction_id: flag.transaction_id.clone(),
            result: OverrideResult::RedFlag(flag),
            audit,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
