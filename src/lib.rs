// Eagle Ledger - Core Library
// Ingestion, classification, compliance and anomaly pipeline for client ledgers.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod error;
pub mod config;
pub mod model;
pub mod extraction;
pub mod normalization;
pub mod store;
pub mod rules;          // Ledger rule table + taxonomy
pub mod services;       // Similarity / model / reconciliation seams
pub mod classification; // Rule → similarity → model cascade
pub mod compliance;     // GST, TDS, income-tax rules
pub mod anomaly;        // Red-flag detectors
pub mod audit;          // Audit log + overrides
pub mod pipeline;       // Batch jobs on a bounded worker pool
pub mod db;             // SQLite persistence

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use config::PipelineConfig;
pub use model::{
    Applicability, AuditAction, AuditEntry, ClassificationProposal, ClassificationResult,
    ComplianceFinding, Direction, FindingRecord, FlagType, Origin, PaymentMode, RedFlag,
    Severity, SubjectType, Tier, Transaction,
};
pub use extraction::{CsvExtractionAdapter, ExtractionAdapter, RawRow, SourceDocument};
pub use normalization::{ingest, normalize, IngestOutcome, NormalizedRow};
pub use store::{LedgerSnapshot, LedgerStore, TransactionView};
pub use rules::{LedgerRule, RuleTable};
pub use services::{
    CorpusIndex, ModelClassifier, ModelVerdict, OfflineModel, ReconciliationFeed,
    ReconciliationRecord, SimilarMatch, SimilarityIndex, StaticReconciliationFeed,
};
pub use classification::ClassificationEngine;
pub use compliance::{ComplianceEngine, ComplianceRule};
pub use anomaly::{AnomalyScanner, Detector, Neighborhood};
pub use audit::{AuditLedger, OverrideOutcome, OverrideRequest, OverrideResult, OverrideSubject};
pub use pipeline::{BatchReport, Collaborators, JobRegistry, Pipeline, StageOutcome};
pub use db::{load_store, open_database, save_store, setup_database};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
