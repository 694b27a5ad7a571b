// ⚙️ Pipeline - per-document batch jobs on a bounded worker pool
//
// ingest (in row order) → classify new transactions → barrier →
// compliance ∥ anomaly per transaction → BatchReport
//
// A single transaction's failure never aborts the batch: rejected rows are
// reported, failed tasks mark the transaction for manual review.

use crate::anomaly::{AnomalyScanner, Neighborhood};
use crate::audit::{AuditEvent, AuditLedger, OverrideOutcome, OverrideRequest, OverrideSubject};
use crate::classification::ClassificationEngine;
use crate::compliance::ComplianceEngine;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::extraction::{ExtractionAdapter, RawRow, SourceDocument};
use crate::model::{
    Applicability, AuditAction, ClassificationResult, FindingRecord, RedFlag, RetirementRecord,
    SubjectType, Tier, Transaction,
};
use crate::normalization::{ingest, IngestOutcome};
use crate::rules::RuleTable;
use crate::services::{CorpusIndex, ModelClassifier, OfflineModel, ReconciliationFeed, SimilarityIndex};
use crate::store::LedgerStore;
use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Actor recorded on everything the pipeline derives by itself
pub const PIPELINE_ACTOR: &str = "pipeline";

// ============================================================================
// JOBS & CANCELLATION
// ============================================================================

/// Cooperative cancellation: tasks check it before starting work
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: u64,
    pub document_id: String,
    pub cancellation: CancellationFlag,
}

/// One live job per document id. Starting a new job for the same document
/// (a re-upload) cancels the remaining tasks of the previous one.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, document_id: &str) -> JobHandle {
        let handle = JobHandle {
            job_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            document_id: document_id.to_string(),
            cancellation: CancellationFlag::default(),
        };

        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = jobs.insert(document_id.to_string(), handle.clone()) {
            previous.cancellation.cancel();
            info!(
                document_id = %document_id,
                superseded_job = previous.job_id,
                job_id = handle.job_id,
                "document re-submitted, cancelling previous job"
            );
        }
        handle
    }

    /// Drop the job if it is still the current one for its document
    pub fn finish(&self, handle: &JobHandle) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.get(&handle.document_id).map(|j| j.job_id) == Some(handle.job_id) {
            jobs.remove(&handle.document_id);
        }
    }

    pub fn cancel(&self, document_id: &str) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        match jobs.get(document_id) {
            Some(job) => {
                job.cancellation.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> Vec<JobHandle> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct RowRejection {
    pub line_number: usize,
    pub field: Option<&'static str>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub transaction_id: String,
    pub stage: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub job_id: u64,
    pub document_id: String,
    pub rows_total: usize,
    pub inserted: Vec<String>,
    /// Rows whose dedup key matched an existing transaction
    pub existing: Vec<String>,
    pub rejected: Vec<RowRejection>,
    pub classified: usize,
    pub findings_recorded: usize,
    pub flags_raised: usize,
    pub failures: Vec<TaskFailure>,
    pub needs_review: Vec<String>,
    pub cancelled: bool,
}

/// What one compliance + anomaly pass produced for a transaction
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageOutcome {
    pub transaction_id: String,
    pub findings: Vec<FindingRecord>,
    pub new_flags: Vec<RedFlag>,
}

// ============================================================================
// COLLABORATORS
// ============================================================================

pub struct Collaborators {
    pub similarity: Arc<dyn SimilarityIndex>,
    pub model: Arc<dyn ModelClassifier>,
    pub reconciliation: Option<Arc<dyn ReconciliationFeed>>,
}

impl Collaborators {
    /// In-process corpus, no model service, no reconciliation feed
    pub fn offline() -> Self {
        Collaborators {
            similarity: Arc::new(CorpusIndex::new()),
            model: Arc::new(OfflineModel),
            reconciliation: None,
        }
    }

    /// Offline collaborators whose corpus is rebuilt from the store: reviewer
    /// confirmations and confident rule hits, the same entries the pipeline
    /// teaches the corpus while it runs.
    pub fn offline_from_store(store: &LedgerStore) -> Self {
        let corpus = CorpusIndex::new();
        let snapshot = store.snapshot();
        let transactions: HashMap<&str, &Transaction> = snapshot
            .transactions
            .iter()
            .map(|t| (t.id.as_str(), t))
            .collect();

        let mut seeded = 0usize;
        for c in snapshot.classifications.iter().filter(|c| c.is_active()) {
            let confident = c.is_reviewer_confirmed() || (c.tier == Tier::Rule && !c.needs_review);
            if !confident {
                continue;
            }
            if let Some(tx) = transactions.get(c.transaction_id.as_str()) {
                corpus.learn(&tx.client_id, &tx.description, &c.ledger_category);
                seeded += 1;
            }
        }
        debug!(entries = seeded, "similarity corpus seeded from store");

        Collaborators {
            similarity: Arc::new(corpus),
            ..Self::offline()
        }
    }

    pub fn with_reconciliation(mut self, feed: Arc<dyn ReconciliationFeed>) -> Self {
        self.reconciliation = Some(feed);
        self
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Clone)]
pub struct Pipeline {
    store: LedgerStore,
    classifier: Arc<ClassificationEngine>,
    compliance: Arc<ComplianceEngine>,
    scanner: Arc<AnomalyScanner>,
    audit: Arc<AuditLedger>,
    config: Arc<PipelineConfig>,
    jobs: JobRegistry,
}

impl Pipeline {
    pub fn new(
        store: LedgerStore,
        config: PipelineConfig,
        rules: Arc<RuleTable>,
        collaborators: Collaborators,
    ) -> Self {
        let classifier = ClassificationEngine::new(
            Arc::clone(&rules),
            Arc::clone(&collaborators.similarity),
            collaborators.model,
            config.classification.clone(),
        )
        .with_vendor_history(Arc::new(store.clone()));

        let scanner = AnomalyScanner::standard(
            &config.anomaly,
            config.compliance.cash_payment_limit,
            collaborators.reconciliation,
        );

        let audit = AuditLedger::new(store.clone(), rules).with_similarity(collaborators.similarity);

        Pipeline {
            compliance: Arc::new(ComplianceEngine::standard(&config.compliance)),
            classifier: Arc::new(classifier),
            scanner: Arc::new(scanner),
            audit: Arc::new(audit),
            config: Arc::new(config),
            jobs: JobRegistry::new(),
            store,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        self.classifier.rules()
    }

    pub fn compliance(&self) -> &ComplianceEngine {
        &self.compliance
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn audit(&self) -> &AuditLedger {
        &self.audit
    }

    // ------------------------------------------------------------------------
    // Batch processing
    // ------------------------------------------------------------------------

    /// Extract a document with the given adapter and process its rows
    pub async fn process_document(
        &self,
        adapter: &dyn ExtractionAdapter,
        client_id: &str,
        sheet_id: &str,
        document: &SourceDocument,
    ) -> Result<BatchReport> {
        let rows = adapter.extract(document)?;
        debug!(
            document_id = %document.document_id,
            adapter = adapter.name(),
            rows = rows.len(),
            "document extracted"
        );
        Ok(self
            .process_rows(client_id, sheet_id, &document.document_id, rows)
            .await)
    }

    pub async fn process_rows(
        &self,
        client_id: &str,
        sheet_id: &str,
        document_id: &str,
        rows: Vec<RawRow>,
    ) -> BatchReport {
        let job = self.jobs.start(document_id);
        let mut report = BatchReport {
            job_id: job.job_id,
            document_id: document_id.to_string(),
            rows_total: rows.len(),
            ..Default::default()
        };
        info!(document_id = %document_id, job_id = job.job_id, rows = rows.len(), "batch started");

        // ---- Stage 1: ingest, in row order ----
        let mut touched: Vec<Transaction> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut collisions: HashSet<String> = HashSet::new();

        for row in &rows {
            if job.cancellation.is_cancelled() {
                break;
            }
            match ingest(&self.store, client_id, sheet_id, row) {
                Ok(outcome) => {
                    let tx = outcome.transaction().clone();
                    match outcome {
                        IngestOutcome::Inserted(_) => report.inserted.push(tx.id.clone()),
                        IngestOutcome::Existing(_) => {
                            report.existing.push(tx.id.clone());
                            collisions.insert(tx.id.clone());
                        }
                    }
                    if seen.insert(tx.id.clone()) {
                        touched.push(tx);
                    }
                }
                Err(e) => {
                    warn!(
                        document_id = %document_id,
                        line = row.line_number,
                        error = %e,
                        "row rejected"
                    );
                    report.rejected.push(RowRejection {
                        line_number: row.line_number,
                        field: e.field(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // ---- Stage 2: classification (barrier before the next stage) ----
        let to_classify: Vec<Transaction> = touched
            .iter()
            .filter(|t| self.store.active_classification(&t.id).is_none())
            .cloned()
            .collect();
        self.classify_stage(&job, to_classify, &mut report).await;

        // ---- Stage 3: compliance ∥ anomaly ----
        self.evaluation_stage(&job, touched.clone(), Arc::new(collisions), &mut report)
            .await;

        report.cancelled = job.cancellation.is_cancelled();
        report.needs_review = touched
            .iter()
            .filter(|t| self.store.needs_manual_review(&t.id))
            .map(|t| t.id.clone())
            .collect();
        self.jobs.finish(&job);

        info!(
            document_id = %document_id,
            job_id = job.job_id,
            inserted = report.inserted.len(),
            existing = report.existing.len(),
            rejected = report.rejected.len(),
            classified = report.classified,
            flags = report.flags_raised,
            needs_review = report.needs_review.len(),
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    async fn classify_stage(&self, job: &JobHandle, transactions: Vec<Transaction>, report: &mut BatchReport) {
        let permits = Arc::new(Semaphore::new(self.config.pipeline.workers));
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();

        for tx in transactions {
            let pipeline = self.clone();
            let permits = Arc::clone(&permits);
            let cancellation = job.cancellation.clone();
            let tx_id = tx.id.clone();

            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancellation.is_cancelled() {
                    return None;
                }
                Some(pipeline.classify_and_record(&tx, PIPELINE_ACTOR, None).await)
            });
            in_flight.insert(handle.id(), tx_id);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Some(Ok(_)))) => report.classified += 1,
                Ok((_, None)) => {}
                Ok((id, Some(Err(e)))) => {
                    let tx_id = in_flight.get(&id).cloned().unwrap_or_default();
                    self.fail(report, &tx_id, "classification", e.to_string());
                }
                Err(join_error) => {
                    let tx_id = in_flight.get(&join_error.id()).cloned().unwrap_or_default();
                    self.fail(report, &tx_id, "classification", join_error.to_string());
                }
            }
        }
    }

    async fn evaluation_stage(
        &self,
        job: &JobHandle,
        transactions: Vec<Transaction>,
        collisions: Arc<HashSet<String>>,
        report: &mut BatchReport,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.pipeline.workers));
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, String> = HashMap::new();

        for tx in transactions {
            let pipeline = self.clone();
            let permits = Arc::clone(&permits);
            let cancellation = job.cancellation.clone();
            let collisions = Arc::clone(&collisions);
            let tx_id = tx.id.clone();

            let handle = tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                if cancellation.is_cancelled() {
                    return None;
                }
                Some(pipeline.evaluate_concurrently(tx, collisions).await)
            });
            in_flight.insert(handle.id(), tx_id);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Some(Ok(outcome)))) => {
                    report.findings_recorded += outcome.findings.len();
                    report.flags_raised += outcome.new_flags.len();
                }
                Ok((_, None)) => {}
                Ok((id, Some(Err(e)))) => {
                    let tx_id = in_flight.get(&id).cloned().unwrap_or_default();
                    self.fail(report, &tx_id, "evaluation", e.to_string());
                }
                Err(join_error) => {
                    let tx_id = in_flight.get(&join_error.id()).cloned().unwrap_or_default();
                    self.fail(report, &tx_id, "evaluation", join_error.to_string());
                }
            }
        }
    }

    /// Compliance and anomaly scanning share no mutable state; run them side by side
    async fn evaluate_concurrently(&self, tx: Transaction, collisions: Arc<HashSet<String>>) -> Result<StageOutcome> {
        let Some(classification) = self.store.active_classification(&tx.id) else {
            return Err(PipelineError::unknown(format!("classification of {}", tx.id)));
        };

        let compliance = {
            let pipeline = self.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || {
                if pipeline.findings_current(&tx.id, &classification) {
                    Vec::new()
                } else {
                    pipeline.run_compliance(&tx, &classification, PIPELINE_ACTOR)
                }
            })
        };
        let anomaly = {
            let pipeline = self.clone();
            let tx = tx.clone();
            tokio::task::spawn_blocking(move || pipeline.run_anomaly(&tx, &collisions, PIPELINE_ACTOR))
        };

        let (findings, new_flags) = tokio::join!(compliance, anomaly);
        let findings = findings.map_err(|e| PipelineError::ComplianceRule {
            rule_id: "*".to_string(),
            message: e.to_string(),
        })?;
        let new_flags = new_flags.map_err(|e| PipelineError::ExternalService {
            service: "anomaly".to_string(),
            message: e.to_string(),
        })?;

        Ok(StageOutcome {
            transaction_id: tx.id,
            findings,
            new_flags,
        })
    }

    fn fail(&self, report: &mut BatchReport, tx_id: &str, stage: &str, reason: String) {
        error!(transaction_id = %tx_id, stage = stage, error = %reason, "task failed, marking for review");
        if !tx_id.is_empty() {
            self.store.mark_for_review(tx_id, stage, &reason);
            self.audit.record(
                AuditEvent::new(SubjectType::Transaction, tx_id, PIPELINE_ACTOR, AuditAction::MarkedForReview)
                    .reason(reason.clone())
                    .data(json!({ "stage": stage })),
            );
        }
        report.failures.push(TaskFailure {
            transaction_id: tx_id.to_string(),
            stage: stage.to_string(),
            reason,
        });
    }

    // ------------------------------------------------------------------------
    // Stages (shared by batch and single-transaction operations)
    // ------------------------------------------------------------------------

    async fn classify_and_record(
        &self,
        tx: &Transaction,
        actor: &str,
        expected_active: Option<u32>,
    ) -> Result<ClassificationResult> {
        let proposal = self.classifier.classify(tx).await;
        let confident_rule_hit = proposal.tier == Tier::Rule && !proposal.needs_review;

        let result = self
            .store
            .record_classification(&tx.id, proposal, actor, expected_active)?;

        if confident_rule_hit {
            self.classifier.learn(tx, &result.ledger_category);
        }

        let action = if result.version == 1 {
            AuditAction::Classified
        } else {
            AuditAction::Reclassified
        };
        self.audit.record(
            AuditEvent::new(SubjectType::Classification, &tx.id, actor, action)
                .versions(expected_active, Some(result.version))
                .data(json!({
                    "transaction_id": tx.id,
                    "category": result.ledger_category,
                    "tier": result.tier,
                    "confidence": result.confidence,
                    "needs_review": result.needs_review,
                    "degradations": result.degradations,
                })),
        );

        debug!(
            transaction_id = %tx.id,
            tier = ?result.tier,
            category = %result.ledger_category,
            confidence = result.confidence,
            "classified"
        );
        Ok(result)
    }

    /// Active findings already derive from this classification and rule table
    fn findings_current(&self, tx_id: &str, classification: &ClassificationResult) -> bool {
        let findings = self.store.active_findings(tx_id);
        !findings.is_empty()
            && findings.iter().all(|r| {
                r.finding.classification_version == classification.version
                    && r.finding.rule_table_version == self.compliance.version()
            })
    }

    fn run_compliance(&self, tx: &Transaction, classification: &ClassificationResult, actor: &str) -> Vec<FindingRecord> {
        let prior = self.store.prior_vendor_payments(tx);
        let findings = self.compliance.evaluate(tx, classification, &prior);
        let recorded = self.store.record_findings(findings);

        let unknown: Vec<&str> = recorded
            .iter()
            .filter(|r| r.finding.applicable == Applicability::Unknown)
            .map(|r| r.finding.rule_id.as_str())
            .collect();
        let applicable: Vec<&str> = recorded
            .iter()
            .filter(|r| r.finding.applicable == Applicability::Applicable)
            .map(|r| r.finding.rule_id.as_str())
            .collect();

        if !unknown.is_empty() {
            warn!(transaction_id = %tx.id, rules = ?unknown, "compliance rules could not be evaluated");
        }

        self.audit.record(
            AuditEvent::new(SubjectType::Transaction, &tx.id, actor, AuditAction::FindingsEvaluated)
                .versions(None, Some(classification.version))
                .data(json!({
                    "transaction_id": tx.id,
                    "rule_table_version": self.compliance.version(),
                    "applicable": applicable,
                    "unknown": unknown,
                })),
        );
        recorded
    }

    fn run_anomaly(&self, tx: &Transaction, collisions: &HashSet<String>, actor: &str) -> Vec<RedFlag> {
        let mut neighborhood = Neighborhood::from_store(&self.store, tx);
        neighborhood.add_collisions(collisions.iter().filter(|id| **id == tx.id));

        let added = self.store.append_flags(self.scanner.scan(tx, &neighborhood));
        for flag in &added {
            self.audit.record(
                AuditEvent::new(SubjectType::RedFlag, &flag.id, actor, AuditAction::FlagRaised).data(json!({
                    "transaction_id": flag.transaction_id,
                    "flag_type": flag.flag_type,
                    "severity": flag.severity,
                    "detector": flag.detector,
                })),
            );
        }
        added
    }

    // ------------------------------------------------------------------------
    // Single-transaction operations
    // ------------------------------------------------------------------------

    /// Run the cascade for one transaction and record it as the next version
    pub async fn classify_transaction(&self, tx_id: &str, actor: &str) -> Result<ClassificationResult> {
        let tx = self.store.require_transaction(tx_id)?;
        let expected = self.store.active_classification(tx_id).map(|c| c.version);
        self.classify_and_record(&tx, actor, expected).await
    }

    /// Re-run the cascade (e.g. after corpus updates). Reviewer-confirmed
    /// classifications are left alone: returns Ok(None).
    pub async fn reclassify(&self, tx_id: &str, actor: &str) -> Result<Option<ClassificationResult>> {
        let tx = self.store.require_transaction(tx_id)?;
        let active = self.store.active_classification(tx_id);

        if active.as_ref().map(|c| c.is_reviewer_confirmed()).unwrap_or(false) {
            debug!(transaction_id = %tx_id, "reviewer-confirmed classification kept");
            return Ok(None);
        }

        let result = self
            .classify_and_record(&tx, actor, active.map(|c| c.version))
            .await?;
        Ok(Some(result))
    }

    /// Explicit re-evaluation trigger: recompute findings from the active
    /// classification and rescan for red flags.
    pub fn reevaluate(&self, tx_id: &str, actor: &str) -> Result<StageOutcome> {
        let tx = self.store.require_transaction(tx_id)?;
        if self.store.is_retired(tx_id) {
            return Err(PipelineError::Conflict {
                subject: format!("transaction {}", tx_id),
                expected: "active".to_string(),
                actual: "retired".to_string(),
            });
        }
        let classification = self
            .store
            .active_classification(tx_id)
            .ok_or_else(|| PipelineError::unknown(format!("classification of {}", tx_id)))?;

        let findings = self.run_compliance(&tx, &classification, actor);
        let new_flags = self.run_anomaly(&tx, &HashSet::new(), actor);

        self.audit.record(
            AuditEvent::new(SubjectType::Transaction, tx_id, actor, AuditAction::Reevaluated)
                .versions(None, Some(classification.version))
                .data(json!({
                    "transaction_id": tx_id,
                    "findings": findings.len(),
                    "new_flags": new_flags.len(),
                })),
        );
        info!(transaction_id = %tx_id, actor = %actor, "re-evaluated");

        Ok(StageOutcome {
            transaction_id: tx_id.to_string(),
            findings,
            new_flags,
        })
    }

    /// Reviewer override; cascades into re-evaluation only when configured to
    pub fn apply_override(&self, request: OverrideRequest) -> Result<OverrideOutcome> {
        let reevaluate = self.config.pipeline.auto_reevaluate_on_override
            && matches!(request.subject, OverrideSubject::Classification { .. });
        let actor = request.actor.clone();

        let outcome = self.audit.override_subject(request)?;
        if reevaluate {
            self.reevaluate(&outcome.transaction_id, &actor)?;
        }
        Ok(outcome)
    }

    /// Soft-retire a transaction; it drops out of views and neighborhoods
    pub fn retire(&self, tx_id: &str, actor: &str, reason: &str) -> Result<RetirementRecord> {
        let record = self.store.retire(tx_id, actor, reason)?;
        self.audit.record(
            AuditEvent::new(SubjectType::Transaction, tx_id, actor, AuditAction::Retired).reason(reason),
        );
        Ok(record)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlagType, Tier};
    use crate::services::{ModelVerdict, SimilarMatch};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClassifier for CountingModel {
        async fn classify_with_context(
            &self,
            _tx: &Transaction,
            _examples: &[SimilarMatch],
            _taxonomy: &[String],
        ) -> Result<ModelVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ModelVerdict {
                category: "Office Supplies".to_string(),
                confidence: 0.8,
                rationale: "looks like stationery".to_string(),
            })
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            LedgerStore::new(),
            PipelineConfig::default(),
            Arc::new(RuleTable::builtin()),
            Collaborators::offline(),
        )
    }

    fn rows() -> Vec<RawRow> {
        vec![
            RawRow::new("doc-1", "01/06/2024", "Office Rent", "50000")
                .with_type_hint("debit")
                .with_mode("cash"),
            RawRow::new("doc-1", "02/06/2024", "Electricity bill MSEB", "4200").with_type_hint("debit"),
            RawRow::new("doc-1", "31/02/2024", "Broken date", "100"),
            RawRow::new("doc-1", "03/06/2024", "Unlabelled transfer", "abc"),
        ]
    }

    #[test]
    fn test_job_registry_cancels_previous_job() {
        let jobs = JobRegistry::new();
        let first = jobs.start("doc-1");
        let second = jobs.start("doc-1");
        let other = jobs.start("doc-2");

        assert!(first.cancellation.is_cancelled());
        assert!(!second.cancellation.is_cancelled());
        assert!(!other.cancellation.is_cancelled());

        jobs.finish(&first);
        assert_eq!(jobs.active_jobs().len(), 2);
        jobs.finish(&second);
        assert_eq!(jobs.active_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_partial_failure() {
        let p = pipeline();
        let report = p.process_rows("c1", "s1", "doc-1", rows()).await;

        assert_eq!(report.rows_total, 4);
        assert_eq!(report.inserted.len(), 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[1].field, Some("amount"));
        assert_eq!(report.classified, 2);
        assert!(!report.cancelled);

        for id in &report.inserted {
            assert!(p.store().active_classification(id).is_some());
            assert_eq!(p.store().active_findings(id).len(), p.compliance().rule_ids().len());
        }
    }

    #[tokio::test]
    async fn test_reupload_is_idempotent_and_flags_duplicate() {
        let p = pipeline();
        let first = p.process_rows("c1", "s1", "doc-1", rows()).await;
        let second = p.process_rows("c1", "s1", "doc-1", rows()).await;

        assert_eq!(p.store().transaction_count(), 2);
        assert_eq!(second.existing, first.inserted);
        assert_eq!(second.classified, 0);
        assert_eq!(second.findings_recorded, 0);

        for id in &first.inserted {
            assert_eq!(p.store().classification_history(id).len(), 1);
            let duplicates = p
                .store()
                .flags_for(id)
                .into_iter()
                .filter(|f| f.flag_type == FlagType::Duplicate)
                .count();
            assert_eq!(duplicates, 1);
        }
    }

    #[tokio::test]
    async fn test_model_tier_used_when_rules_fall_short() {
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let p = Pipeline::new(
            LedgerStore::new(),
            PipelineConfig::default(),
            Arc::new(RuleTable::builtin()),
            Collaborators {
                similarity: Arc::new(CorpusIndex::new()),
                model: model.clone(),
                reconciliation: None,
            },
        );

        let report = p
            .process_rows(
                "c1",
                "s1",
                "doc-9",
                vec![RawRow::new("doc-9", "05/06/2024", "Misc purchase 4471", "650").with_type_hint("debit")],
            )
            .await;

        let c = p.store().active_classification(&report.inserted[0]).unwrap();
        assert_eq!(c.tier, Tier::Model);
        assert_eq!(c.rationale, "looks like stationery");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reclassify_keeps_reviewer_decision() {
        let p = pipeline();
        let report = p.process_rows("c1", "s1", "doc-1", rows()).await;
        let tx_id = report.inserted[1].clone();

        p.apply_override(OverrideRequest {
            subject: OverrideSubject::Classification {
                transaction_id: tx_id.clone(),
                expected_version: 1,
                category: "Utilities".to_string(),
            },
            actor: "ca".to_string(),
            reason: "shared meter".to_string(),
        })
        .unwrap();

        assert!(p.reclassify(&tx_id, PIPELINE_ACTOR).await.unwrap().is_none());
        assert_eq!(p.store().classification_history(&tx_id).len(), 2);
    }

    #[tokio::test]
    async fn test_override_does_not_cascade_by_default() {
        let p = pipeline();
        let report = p.process_rows("c1", "s1", "doc-1", rows()).await;
        let tx_id = report.inserted[1].clone();

        p.apply_override(OverrideRequest {
            subject: OverrideSubject::Classification {
                transaction_id: tx_id.clone(),
                expected_version: 1,
                category: "Rent".to_string(),
            },
            actor: "ca".to_string(),
            reason: "sub-let".to_string(),
        })
        .unwrap();

        assert!(p.store().view(&tx_id).unwrap().findings_stale);

        let outcome = p.reevaluate(&tx_id, "ca").unwrap();
        assert!(outcome.findings.iter().all(|r| r.finding.classification_version == 2));
        assert!(!p.store().view(&tx_id).unwrap().findings_stale);
    }

    #[tokio::test]
    async fn test_retired_transaction_cannot_be_reevaluated() {
        let p = pipeline();
        let report = p.process_rows("c1", "s1", "doc-1", rows()).await;
        let tx_id = report.inserted[0].clone();

        p.retire(&tx_id, "ca", "entered on wrong sheet").unwrap();
        assert!(matches!(p.reevaluate(&tx_id, "ca"), Err(PipelineError::Conflict { .. })));
        assert!(p.store().client_view("c1").iter().all(|v| v.transaction.id != tx_id));
    }
}
