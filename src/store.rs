// 🗄️ Ledger Store - append-only registry for every pipeline entity
//
// Nothing is ever removed. The only fields written after creation are
// `superseded_by` (classifications, findings) and the resolution fields of
// a RedFlag. Optimistic version checks guard every human write.

use crate::error::{PipelineError, Result};
use crate::model::{
    Applicability, AuditEntry, ClassificationProposal, ClassificationResult, ComplianceFinding,
    Direction, FindingRecord, Origin, PriorPayment, RedFlag, RetirementRecord, ReviewMark, Tier,
    Transaction,
};
use crate::normalization::{IngestOutcome, NormalizedRow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// STATE
// ============================================================================

/// Plain data copy of the whole store (persistence and restore)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub transactions: Vec<Transaction>,
    pub classifications: Vec<ClassificationResult>,
    pub findings: Vec<FindingRecord>,
    pub flags: Vec<RedFlag>,
    pub audit: Vec<AuditEntry>,
    pub review_marks: Vec<ReviewMark>,
    pub retirements: Vec<RetirementRecord>,
}

#[derive(Debug, Default)]
struct LedgerState {
    data: LedgerSnapshot,
    by_id: HashMap<String, usize>,
    /// (client_id, sheet_id, dedup_key): sheet ids are free text, so tenancy is part of the key
    by_dedup: HashMap<(String, String, String), usize>,
    next_sequence: u64,
}

impl LedgerState {
    fn from_snapshot(data: LedgerSnapshot) -> Self {
        let mut state = LedgerState {
            next_sequence: data.transactions.iter().map(|t| t.sequence + 1).max().unwrap_or(0),
            data,
            ..Default::default()
        };
        for (i, tx) in state.data.transactions.iter().enumerate() {
            state.by_id.insert(tx.id.clone(), i);
            state.by_dedup.insert(
                (tx.client_id.clone(), tx.sheet_id.clone(), tx.dedup_key.clone()),
                i,
            );
        }
        state
    }

    fn transaction(&self, id: &str) -> Option<&Transaction> {
        self.by_id.get(id).map(|&i| &self.data.transactions[i])
    }

    fn is_retired(&self, id: &str) -> bool {
        self.data.retirements.iter().any(|r| r.transaction_id == id)
    }

    fn active_classification(&self, tx_id: &str) -> Option<&ClassificationResult> {
        self.data
            .classifications
            .iter()
            .filter(|c| c.transaction_id == tx_id && c.is_active())
            .max_by_key(|c| c.version)
    }

    fn active_finding_index(&self, tx_id: &str, rule_id: &str) -> Option<usize> {
        self.data.findings.iter().position(|r| {
            r.is_active() && r.finding.transaction_id == tx_id && r.finding.rule_id == rule_id
        })
    }

    fn latest_finding_version(&self, tx_id: &str, rule_id: &str) -> u32 {
        self.data
            .findings
            .iter()
            .filter(|r| r.finding.transaction_id == tx_id && r.finding.rule_id == rule_id)
            .map(|r| r.version)
            .max()
            .unwrap_or(0)
    }

    fn active_findings(&self, tx_id: &str) -> Vec<FindingRecord> {
        self.data
            .findings
            .iter()
            .filter(|r| r.is_active() && r.finding.transaction_id == tx_id)
            .cloned()
            .collect()
    }

    fn needs_manual_review(&self, tx_id: &str) -> bool {
        let active = self.active_classification(tx_id);

        if active.map(|c| c.needs_review).unwrap_or(true) {
            return true;
        }

        if self
            .active_findings(tx_id)
            .iter()
            .any(|r| r.finding.applicable == Applicability::Unknown)
        {
            return true;
        }

        // A reviewer decision clears review marks raised before it
        let since = active.map(|c| c.created_at);
        self.data
            .review_marks
            .iter()
            .any(|m| m.transaction_id == tx_id && since.map(|s| m.created_at >= s).unwrap_or(true))
    }
}

// ============================================================================
// QUERY VIEW
// ============================================================================

/// Tenant-scoped query row: what a reviewer sees for one transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionView {
    pub transaction: Transaction,
    pub classification: Option<ClassificationResult>,
    pub findings: Vec<FindingRecord>,
    pub unresolved_flags: Vec<RedFlag>,
    pub needs_manual_review: bool,

    /// Active findings were derived from an older classification version
    pub findings_stale: bool,
}

// ============================================================================
// LEDGER STORE
// ============================================================================

/// Cheap to clone: all clones share the same append-only state
#[derive(Debug, Clone, Default)]
pub struct LedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        LedgerStore::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        LedgerStore {
            state: Arc::new(RwLock::new(LedgerState::from_snapshot(snapshot))),
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.read().data.clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Insert unless (client_id, sheet_id, dedup_key) already exists; then return the existing one
    pub fn upsert_transaction(&self, row: NormalizedRow) -> IngestOutcome {
        let mut state = self.write();

        let key = (row.client_id.clone(), row.sheet_id.clone(), row.dedup_key.clone());
        if let Some(&i) = state.by_dedup.get(&key) {
            return IngestOutcome::Existing(state.data.transactions[i].clone());
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let tx = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            client_id: row.client_id,
            sheet_id: row.sheet_id,
            document_id: row.document_id,
            sequence,
            date: row.date,
            description: row.description,
            amount: row.amount,
            direction: row.direction,
            vendor: row.vendor,
            gstin: row.gstin,
            payment_mode: row.payment_mode,
            tax_amount: row.tax_amount,
            invoice_number: row.invoice_number,
            tds_deducted: row.tds_deducted,
            dedup_key: row.dedup_key,
            created_at: Utc::now(),
        };

        let index = state.data.transactions.len();
        state.by_id.insert(tx.id.clone(), index);
        state.by_dedup.insert(key, index);
        state.data.transactions.push(tx.clone());

        IngestOutcome::Inserted(tx)
    }

    pub fn transaction(&self, id: &str) -> Option<Transaction> {
        self.read().transaction(id).cloned()
    }

    pub fn require_transaction(&self, id: &str) -> Result<Transaction> {
        self.transaction(id)
            .ok_or_else(|| PipelineError::unknown(format!("transaction {}", id)))
    }

    pub fn transaction_count(&self) -> usize {
        self.read().data.transactions.len()
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.read().is_retired(id)
    }

    /// Other live transactions of the same client and sheet
    pub fn neighborhood(&self, tx: &Transaction) -> Vec<Transaction> {
        let state = self.read();
        state
            .data
            .transactions
            .iter()
            .filter(|t| {
                t.id != tx.id
                    && t.client_id == tx.client_id
                    && t.sheet_id == tx.sheet_id
                    && !state.is_retired(&t.id)
            })
            .cloned()
            .collect()
    }

    pub fn client_transactions(&self, client_id: &str) -> Vec<Transaction> {
        let state = self.read();
        state
            .data
            .transactions
            .iter()
            .filter(|t| t.client_id == client_id && !state.is_retired(&t.id))
            .cloned()
            .collect()
    }

    /// Soft retire; the transaction stays in history
    pub fn retire(&self, tx_id: &str, actor: &str, reason: &str) -> Result<RetirementRecord> {
        let mut state = self.write();

        if state.transaction(tx_id).is_none() {
            return Err(PipelineError::unknown(format!("transaction {}", tx_id)));
        }
        if state.is_retired(tx_id) {
            return Err(PipelineError::Conflict {
                subject: format!("transaction {}", tx_id),
                expected: "live".to_string(),
                actual: "retired".to_string(),
            });
        }

        let record = RetirementRecord {
            transaction_id: tx_id.to_string(),
            actor: actor.to_string(),
            reason: reason.to_string(),
            retired_at: Utc::now(),
        };
        state.data.retirements.push(record.clone());
        Ok(record)
    }

    // ------------------------------------------------------------------------
    // Classifications
    // ------------------------------------------------------------------------

    /// Append a new classification version and supersede the active one.
    ///
    /// `expected_active` is the optimistic check: `Some(v)` requires version
    /// `v` to be the active one at write time.
    pub fn record_classification(
        &self,
        tx_id: &str,
        proposal: ClassificationProposal,
        actor: &str,
        expected_active: Option<u32>,
    ) -> Result<ClassificationResult> {
        let mut state = self.write();

        if state.transaction(tx_id).is_none() {
            return Err(PipelineError::unknown(format!("transaction {}", tx_id)));
        }

        let active_version = state.active_classification(tx_id).map(|c| c.version);

        if let Some(expected) = expected_active {
            if active_version != Some(expected) {
                return Err(PipelineError::Conflict {
                    subject: format!("classification of {}", tx_id),
                    expected: format!("active version {}", expected),
                    actual: match active_version {
                        Some(v) => format!("active version {}", v),
                        None => "no classification".to_string(),
                    },
                });
            }
        }

        let next_version = state
            .data
            .classifications
            .iter()
            .filter(|c| c.transaction_id == tx_id)
            .map(|c| c.version)
            .max()
            .unwrap_or(0)
            + 1;

        if let Some(previous) = active_version {
            if let Some(prev) = state
                .data
                .classifications
                .iter_mut()
                .find(|c| c.transaction_id == tx_id && c.version == previous)
            {
                prev.superseded_by = Some(next_version);
            }
        }

        let result = ClassificationResult::from_proposal(tx_id, next_version, proposal, actor);
        state.data.classifications.push(result.clone());
        Ok(result)
    }

    pub fn active_classification(&self, tx_id: &str) -> Option<ClassificationResult> {
        self.read().active_classification(tx_id).cloned()
    }

    /// All versions, ascending
    pub fn classification_history(&self, tx_id: &str) -> Vec<ClassificationResult> {
        let mut history: Vec<ClassificationResult> = self
            .read()
            .data
            .classifications
            .iter()
            .filter(|c| c.transaction_id == tx_id)
            .cloned()
            .collect();
        history.sort_by_key(|c| c.version);
        history
    }

    /// Most recent reviewer-confirmed category for this client + vendor
    pub fn reviewer_category(&self, client_id: &str, vendor: &str) -> Option<String> {
        let state = self.read();
        let vendor = vendor.trim().to_lowercase();

        state
            .data
            .classifications
            .iter()
            .filter(|c| c.is_active() && c.tier == Tier::Reviewer)
            .filter(|c| {
                state
                    .transaction(&c.transaction_id)
                    .map(|t| t.client_id == client_id && t.vendor.trim().to_lowercase() == vendor)
                    .unwrap_or(false)
            })
            .max_by_key(|c| c.created_at)
            .map(|c| c.ledger_category.clone())
    }

    /// Earlier debit payments to the vendor in the same financial year, each
    /// with its active category so rules can keep only their own kind
    pub fn prior_vendor_payments(&self, tx: &Transaction) -> Vec<PriorPayment> {
        let state = self.read();
        let vendor = tx.vendor.trim().to_lowercase();
        let fy = tx.financial_year_start();

        state
            .data
            .transactions
            .iter()
            .filter(|t| {
                t.id != tx.id
                    && t.client_id == tx.client_id
                    && t.direction == Direction::Debit
                    && t.vendor.trim().to_lowercase() == vendor
                    && t.financial_year_start() == fy
                    && (t.date < tx.date || (t.date == tx.date && t.sequence < tx.sequence))
                    && !state.is_retired(&t.id)
            })
            .map(|t| PriorPayment {
                amount: t.amount,
                description: t.description.clone(),
                category: state
                    .active_classification(&t.id)
                    .map(|c| c.ledger_category.clone())
                    .unwrap_or_default(),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Compliance findings
    // ------------------------------------------------------------------------

    /// Record a full recomputation. Each finding starts a new version of its
    /// (transaction, rule_id) chain, except where a reviewer decision on the
    /// same classification version is active.
    pub fn record_findings(&self, findings: Vec<ComplianceFinding>) -> Vec<FindingRecord> {
        let mut state = self.write();
        let mut recorded = Vec::with_capacity(findings.len());

        for finding in findings {
            let active = state.active_finding_index(&finding.transaction_id, &finding.rule_id);

            if let Some(i) = active {
                let current = &state.data.findings[i].finding;
                if current.origin == Origin::Reviewer
                    && current.classification_version == finding.classification_version
                {
                    recorded.push(state.data.findings[i].clone());
                    continue;
                }
            }

            let record = FindingRecord {
                id: uuid::Uuid::new_v4().to_string(),
                version: state.latest_finding_version(&finding.transaction_id, &finding.rule_id) + 1,
                finding,
                superseded_by: None,
                recorded_at: Utc::now(),
            };

            if let Some(i) = active {
                state.data.findings[i].superseded_by = Some(record.id.clone());
            }

            state.data.findings.push(record.clone());
            recorded.push(record);
        }

        recorded
    }

    /// Reviewer decision on one finding chain
    pub fn override_finding(
        &self,
        tx_id: &str,
        rule_id: &str,
        expected_version: u32,
        applicable: Applicability,
        reason: &str,
    ) -> Result<(FindingRecord, FindingRecord)> {
        let mut state = self.write();

        let index = state
            .active_finding_index(tx_id, rule_id)
            .ok_or_else(|| PipelineError::unknown(format!("finding {} on {}", rule_id, tx_id)))?;

        let previous = state.data.findings[index].clone();
        if previous.version != expected_version {
            return Err(PipelineError::Conflict {
                subject: format!("finding {} on {}", rule_id, tx_id),
                expected: format!("active version {}", expected_version),
                actual: format!("active version {}", previous.version),
            });
        }

        let record = FindingRecord {
            id: uuid::Uuid::new_v4().to_string(),
            version: state.latest_finding_version(tx_id, rule_id) + 1,
            finding: ComplianceFinding {
                applicable,
                reason: reason.to_string(),
                origin: Origin::Reviewer,
                ..previous.finding.clone()
            },
            superseded_by: None,
            recorded_at: Utc::now(),
        };

        state.data.findings[index].superseded_by = Some(record.id.clone());
        state.data.findings.push(record.clone());

        Ok((previous, record))
    }

    pub fn active_findings(&self, tx_id: &str) -> Vec<FindingRecord> {
        self.read().active_findings(tx_id)
    }

    pub fn finding_history(&self, tx_id: &str, rule_id: &str) -> Vec<FindingRecord> {
        let mut history: Vec<FindingRecord> = self
            .read()
            .data
            .findings
            .iter()
            .filter(|r| r.finding.transaction_id == tx_id && r.finding.rule_id == rule_id)
            .cloned()
            .collect();
        history.sort_by_key(|r| r.version);
        history
    }

    // ------------------------------------------------------------------------
    // Red flags
    // ------------------------------------------------------------------------

    /// Append flags, skipping any whose condition (transaction, type, detector,
    /// subject key) was already raised. Resolved flags count: a resolved
    /// condition is not raised again by a rescan.
    pub fn append_flags(&self, flags: Vec<RedFlag>) -> Vec<RedFlag> {
        let mut state = self.write();
        let mut added = Vec::new();

        for flag in flags {
            let exists = state.data.flags.iter().any(|f| f.same_condition(&flag));
            if !exists {
                state.data.flags.push(flag.clone());
                added.push(flag);
            }
        }

        added
    }

    pub fn flag(&self, flag_id: &str) -> Option<RedFlag> {
        self.read().data.flags.iter().find(|f| f.id == flag_id).cloned()
    }

    pub fn flags_for(&self, tx_id: &str) -> Vec<RedFlag> {
        self.read()
            .data
            .flags
            .iter()
            .filter(|f| f.transaction_id == tx_id)
            .cloned()
            .collect()
    }

    pub fn unresolved_flags(&self, tx_id: &str) -> Vec<RedFlag> {
        self.flags_for(tx_id).into_iter().filter(|f| !f.resolved).collect()
    }

    /// Set the resolution fields; a flag can only be resolved once
    pub fn resolve_flag(&self, flag_id: &str, actor: &str, note: &str) -> Result<RedFlag> {
        let mut state = self.write();

        let flag = state
            .data
            .flags
            .iter_mut()
            .find(|f| f.id == flag_id)
            .ok_or_else(|| PipelineError::unknown(format!("red flag {}", flag_id)))?;

        if flag.resolved {
            return Err(PipelineError::Conflict {
                subject: format!("red flag {}", flag_id),
                expected: "unresolved".to_string(),
                actual: "resolved".to_string(),
            });
        }

        flag.resolved = true;
        flag.resolution_note = Some(note.to_string());
        flag.resolved_by = Some(actor.to_string());
        Ok(flag.clone())
    }

    // ------------------------------------------------------------------------
    // Audit & review marks
    // ------------------------------------------------------------------------

    pub fn append_audit(&self, entry: AuditEntry) {
        self.write().data.audit.push(entry);
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.read().data.audit.clone()
    }

    /// Entries whose subject is `subject_id`, or whose payload names it as transaction
    pub fn audit_for(&self, subject_id: &str) -> Vec<AuditEntry> {
        self.read()
            .data
            .audit
            .iter()
            .filter(|e| {
                e.subject_id == subject_id
                    || e.data.get("transaction_id").and_then(|v| v.as_str()) == Some(subject_id)
            })
            .cloned()
            .collect()
    }

    pub fn mark_for_review(&self, tx_id: &str, stage: &str, reason: &str) -> ReviewMark {
        let mark = ReviewMark {
            transaction_id: tx_id.to_string(),
            stage: stage.to_string(),
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.write().data.review_marks.push(mark.clone());
        mark
    }

    pub fn review_marks(&self, tx_id: &str) -> Vec<ReviewMark> {
        self.read()
            .data
            .review_marks
            .iter()
            .filter(|m| m.transaction_id == tx_id)
            .cloned()
            .collect()
    }

    pub fn needs_manual_review(&self, tx_id: &str) -> bool {
        self.read().needs_manual_review(tx_id)
    }

    // ------------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------------

    pub fn view(&self, tx_id: &str) -> Option<TransactionView> {
        let state = self.read();
        let tx = state.transaction(tx_id)?;
        Some(Self::build_view(&state, tx))
    }

    /// Active (non-retired) transactions of one tenant, in ingestion order
    pub fn client_view(&self, client_id: &str) -> Vec<TransactionView> {
        let state = self.read();
        let mut views: Vec<TransactionView> = state
            .data
            .transactions
            .iter()
            .filter(|t| t.client_id == client_id && !state.is_retired(&t.id))
            .map(|t| Self::build_view(&state, t))
            .collect();
        views.sort_by_key(|v| v.transaction.sequence);
        views
    }

    fn build_view(state: &LedgerState, tx: &Transaction) -> TransactionView {
        let classification = state.active_classification(&tx.id).cloned();
        let findings = state.active_findings(&tx.id);

        let findings_stale = match &classification {
            Some(c) => {
                findings.is_empty()
                    || findings
                        .iter()
                        .any(|r| r.finding.classification_version != c.version)
            }
            None => false,
        };

        TransactionView {
            transaction: tx.clone(),
            unresolved_flags: state
                .data
                .flags
                .iter()
                .filter(|f| f.transaction_id == tx.id && !f.resolved)
                .cloned()
                .collect(),
            needs_manual_review: state.needs_manual_review(&tx.id),
            classification,
            findings,
            findings_stale,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::RawRow;
    use crate::model::{FlagType, Severity};
    use crate::normalization::normalize;

    fn proposal(category: &str, tier: Tier) -> ClassificationProposal {
        ClassificationProposal {
            ledger_category: category.to_string(),
            confidence: 0.9,
            tier,
            rationale: "test".to_string(),
            law_references: vec![],
            needs_review: false,
            rule_table_version: "builtin-1".to_string(),
            degradations: vec![],
        }
    }

    fn insert(store: &LedgerStore, description: &str, amount: &str) -> Transaction {
        let row = RawRow::new("doc", "01/05/2024", description, amount).with_vendor("Acme");
        store
            .upsert_transaction(normalize("c1", "s1", &row).unwrap())
            .transaction()
            .clone()
    }

    fn finding(tx_id: &str, version: u32, applicable: Applicability) -> ComplianceFinding {
        ComplianceFinding {
            transaction_id: tx_id.to_string(),
            classification_version: version,
            rule_id: "it.40a3_cash_limit".to_string(),
            applicable,
            section_reference: "Income Tax Act §40A(3)".to_string(),
            reason: "test".to_string(),
            rule_table_version: "builtin-1".to_string(),
            origin: Origin::Derived,
        }
    }

    #[test]
    fn test_sequences_increase() {
        let store = LedgerStore::new();
        let a = insert(&store, "first", "10");
        let b = insert(&store, "second", "20");
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn test_versions_monotonic_and_superseded() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Electricity bill", "1200");

        let v1 = store
            .record_classification(&tx.id, proposal("Utilities", Tier::Rule), "pipeline", None)
            .unwrap();
        let v2 = store
            .record_classification(&tx.id, proposal("Rent", Tier::Reviewer), "ca", Some(1))
            .unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);

        let history = store.classification_history(&tx.id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].superseded_by, Some(2));
        assert!(history[1].is_active());
        assert_eq!(store.active_classification(&tx.id).unwrap().ledger_category, "Rent");
    }

    #[test]
    fn test_stale_version_conflicts() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Electricity bill", "1200");
        store
            .record_classification(&tx.id, proposal("Utilities", Tier::Rule), "pipeline", None)
            .unwrap();
        store
            .record_classification(&tx.id, proposal("Rent", Tier::Reviewer), "ca", Some(1))
            .unwrap();

        let err = store
            .record_classification(&tx.id, proposal("Travel", Tier::Reviewer), "ca", Some(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
        assert_eq!(store.classification_history(&tx.id).len(), 2);
    }

    #[test]
    fn test_unknown_transaction() {
        let store = LedgerStore::new();
        let err = store
            .record_classification("nope", proposal("Rent", Tier::Rule), "pipeline", None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSubject { .. }));
    }

    #[test]
    fn test_findings_chain_and_reviewer_preservation() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Cash rent", "50000");

        let first = store.record_findings(vec![finding(&tx.id, 1, Applicability::Applicable)]);
        assert_eq!(first[0].version, 1);

        let (prev, over) = store
            .override_finding(&tx.id, "it.40a3_cash_limit", 1, Applicability::NotApplicable, "banking hours exception")
            .unwrap();
        assert_eq!(prev.version, 1);
        assert_eq!(over.version, 2);
        assert_eq!(over.finding.origin, Origin::Reviewer);

        // Same classification version: reviewer decision stays active
        let again = store.record_findings(vec![finding(&tx.id, 1, Applicability::Applicable)]);
        assert_eq!(again[0].id, over.id);

        // New classification version: full recompute supersedes it
        let recomputed = store.record_findings(vec![finding(&tx.id, 2, Applicability::Applicable)]);
        assert_eq!(recomputed[0].version, 3);
        assert_eq!(store.finding_history(&tx.id, "it.40a3_cash_limit").len(), 3);
        assert_eq!(store.active_findings(&tx.id).len(), 1);
    }

    #[test]
    fn test_flag_dedup_uses_subject_key_not_message() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Steel purchase", "11800");

        let first = RedFlag::raise(&tx.id, FlagType::GstMismatch, Severity::High, "books ₹1800.00".to_string(), "gst_mismatch")
            .with_subject_key("27AAPFU0939F1ZV/2024-05");
        let grown = RedFlag::raise(&tx.id, FlagType::GstMismatch, Severity::High, "books ₹7200.00".to_string(), "gst_mismatch")
            .with_subject_key("27AAPFU0939F1ZV/2024-05");
        let next_month = RedFlag::raise(&tx.id, FlagType::GstMismatch, Severity::High, "books ₹7200.00".to_string(), "gst_mismatch")
            .with_subject_key("27AAPFU0939F1ZV/2024-06");

        assert_eq!(store.append_flags(vec![first]).len(), 1);
        assert_eq!(store.append_flags(vec![grown]).len(), 0);
        assert_eq!(store.append_flags(vec![next_month]).len(), 1);
    }

    #[test]
    fn test_flags_append_once_and_resolve_once() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Cash rent", "50000");

        let flag = RedFlag::raise(&tx.id, FlagType::CashLimit, Severity::High, "over".to_string(), "cash");
        let dup = RedFlag::raise(&tx.id, FlagType::CashLimit, Severity::High, "over".to_string(), "cash");

        assert_eq!(store.append_flags(vec![flag.clone()]).len(), 1);
        assert_eq!(store.append_flags(vec![dup]).len(), 0);

        let resolved = store.resolve_flag(&flag.id, "ca", "paid via bank later").unwrap();
        assert!(resolved.resolved);
        assert!(store.unresolved_flags(&tx.id).is_empty());
        assert_eq!(store.flags_for(&tx.id).len(), 1);

        let err = store.resolve_flag(&flag.id, "ca", "again").unwrap_err();
        assert!(matches!(err, PipelineError::Conflict { .. }));
    }

    #[test]
    fn test_client_view_scoped_and_excludes_retired() {
        let store = LedgerStore::new();
        let kept = insert(&store, "Office rent", "1000");
        let retired = insert(&store, "Wrong row", "5");
        let other_row = RawRow::new("doc", "01/05/2024", "Other tenant", "10");
        store.upsert_transaction(normalize("c2", "s9", &other_row).unwrap());

        store.retire(&retired.id, "ca", "extraction noise").unwrap();
        assert!(store.retire(&retired.id, "ca", "again").is_err());

        let view = store.client_view("c1");
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].transaction.id, kept.id);
        assert!(view[0].needs_manual_review);
        assert!(!view[0].findings_stale);
        assert_eq!(store.transaction_count(), 3);
    }

    #[test]
    fn test_same_row_for_two_clients_stays_separate() {
        let store = LedgerStore::new();
        let row = RawRow::new("stmt", "12/06/2024", "NEFT to Sharma Traders", "18500").with_type_hint("debit");

        let a = store.upsert_transaction(normalize("client-a", "bank", &row).unwrap());
        let b = store.upsert_transaction(normalize("client-b", "bank", &row).unwrap());
        let b_again = store.upsert_transaction(normalize("client-b", "bank", &row).unwrap());

        assert!(a.is_new());
        assert!(b.is_new());
        assert_ne!(a.transaction_id(), b.transaction_id());
        assert_eq!(b.transaction().client_id, "client-b");
        assert_eq!(b_again.transaction_id(), b.transaction_id());

        // The restored index keeps tenants apart too
        let restored = LedgerStore::from_snapshot(store.snapshot());
        let again = restored.upsert_transaction(normalize("client-a", "bank", &row).unwrap());
        assert_eq!(again.transaction_id(), a.transaction_id());
        assert_eq!(restored.transaction_count(), 2);
    }

    #[test]
    fn test_prior_vendor_payments_carry_category() {
        let store = LedgerStore::new();
        let rent = RawRow::new("doc", "01/05/2024", "Shop rent May", "60000").with_vendor("BuildCo");
        let rent = store.upsert_transaction(normalize("c1", "s1", &rent).unwrap()).transaction().clone();
        store
            .record_classification(&rent.id, proposal("Rent", Tier::Rule), "pipeline", None)
            .unwrap();
        let row = RawRow::new("doc", "20/05/2024", "Contract work", "20000").with_vendor("BuildCo");
        let tx = store.upsert_transaction(normalize("c1", "s1", &row).unwrap()).transaction().clone();

        let prior = store.prior_vendor_payments(&tx);
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0].category, "Rent");
        assert_eq!(prior[0].description, "Shop rent May");
    }

    #[test]
    fn test_prior_vendor_payments_same_financial_year() {
        let store = LedgerStore::new();
        for (date, amount) in [("15/03/2024", "40000"), ("10/04/2024", "25000"), ("20/04/2024", "35000")] {
            let row = RawRow::new("doc", date, &format!("Contract work {}", date), amount)
                .with_vendor("BuildCo");
            store.upsert_transaction(normalize("c1", "s1", &row).unwrap());
        }
        let row = RawRow::new("doc", "30/04/2024", "Contract work final", "30000").with_vendor("buildco");
        let tx = store
            .upsert_transaction(normalize("c1", "s1", &row).unwrap())
            .transaction()
            .clone();

        // March 2024 belongs to FY 2023-24
        let total: f64 = store.prior_vendor_payments(&tx).iter().map(|p| p.amount).sum();
        assert_eq!(total, 60_000.0);
        assert!(store.prior_vendor_payments(&tx).iter().all(|p| p.category.is_empty()));
    }

    #[test]
    fn test_snapshot_restore_keeps_dedup_index() {
        let store = LedgerStore::new();
        let tx = insert(&store, "Office rent", "1000");

        let restored = LedgerStore::from_snapshot(store.snapshot());
        let again = insert(&restored, "Office rent", "1000");
        assert_eq!(again.id, tx.id);

        let next = insert(&restored, "Another", "1");
        assert!(next.sequence > tx.sequence);
    }
}
