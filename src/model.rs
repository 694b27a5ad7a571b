// 📒 Ledger data model
//
// Identity vs value: a Transaction is an immutable fact with a stable id.
// Everything derived from it (classification, findings, flags) is an
// append-only, versioned value pointing back at that id.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// TRANSACTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }

    pub fn parse(value: &str) -> Option<Direction> {
        match value.trim().to_lowercase().as_str() {
            "credit" | "cr" | "deposit" | "receipt" | "income" => Some(Direction::Credit),
            "debit" | "dr" | "withdrawal" | "payment" | "expense" | "purchase" => {
                Some(Direction::Debit)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMode {
    Cash,
    Upi,
    Neft,
    Rtgs,
    Imps,
    Cheque,
    Card,
    Other,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMode::Cash => "cash",
            PaymentMode::Upi => "upi",
            PaymentMode::Neft => "neft",
            PaymentMode::Rtgs => "rtgs",
            PaymentMode::Imps => "imps",
            PaymentMode::Cheque => "cheque",
            PaymentMode::Card => "card",
            PaymentMode::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<PaymentMode> {
        match value.trim().to_lowercase().as_str() {
            "cash" => Some(PaymentMode::Cash),
            "upi" => Some(PaymentMode::Upi),
            "neft" => Some(PaymentMode::Neft),
            "rtgs" => Some(PaymentMode::Rtgs),
            "imps" => Some(PaymentMode::Imps),
            "cheque" | "chq" | "check" => Some(PaymentMode::Cheque),
            "card" | "pos" => Some(PaymentMode::Card),
            "" => None,
            _ => Some(PaymentMode::Other),
        }
    }
}

/// Canonical ledger fact produced by normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Stable identity (UUID)
    pub id: String,

    /// Tenant
    pub client_id: String,
    pub sheet_id: String,
    pub document_id: String,

    /// Ingestion order within the store
    pub sequence: u64,

    pub date: NaiveDate,
    pub description: String,

    /// Always positive; the sign lives in `direction`
    pub amount: f64,
    pub direction: Direction,

    pub vendor: String,
    pub gstin: Option<String>,
    pub payment_mode: Option<PaymentMode>,

    /// GST declared on the source row, when the extraction supplied it
    pub tax_amount: Option<f64>,

    /// Supplier invoice / bill number
    #[serde(default)]
    pub invoice_number: Option<String>,

    /// TDS withheld on this payment, when the books record it
    #[serde(default)]
    pub tds_deducted: Option<f64>,

    /// Deduplication hash - NOT identity
    pub dedup_key: String,

    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_cash(&self) -> bool {
        self.payment_mode == Some(PaymentMode::Cash)
    }

    pub fn is_debit(&self) -> bool {
        self.direction == Direction::Debit
    }

    /// Indian financial year start (April 1st) containing this transaction
    pub fn financial_year_start(&self) -> i32 {
        financial_year_start(self.date)
    }

    /// (year, month) period used by GST returns
    pub fn period(&self) -> (i32, u32) {
        (self.date.year(), self.date.month())
    }
}

/// An earlier payment to the same vendor, as compliance rules see it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorPayment {
    pub amount: f64,
    pub description: String,

    /// Active ledger category; empty while unclassified
    pub category: String,
}

/// Financial year (April–March) start year for a date
pub fn financial_year_start(date: NaiveDate) -> i32 {
    if date.month() >= 4 {
        date.year()
    } else {
        date.year() - 1
    }
}

/// Soft retirement marker; the transaction itself is never deleted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetirementRecord {
    pub transaction_id: String,
    pub actor: String,
    pub reason: String,
    pub retired_at: DateTime<Utc>,
}

/// needs_manual_review marker raised by a pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewMark {
    pub transaction_id: String,
    pub stage: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Rule,
    Similarity,
    Model,
    /// Reviewer-confirmed override
    Reviewer,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Rule => "rule",
            Tier::Similarity => "similarity",
            Tier::Model => "model",
            Tier::Reviewer => "reviewer",
        }
    }

    pub fn parse(value: &str) -> Option<Tier> {
        match value {
            "rule" => Some(Tier::Rule),
            "similarity" => Some(Tier::Similarity),
            "model" => Some(Tier::Model),
            "reviewer" => Some(Tier::Reviewer),
            _ => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the cascade (or a reviewer) concluded, before it is versioned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationProposal {
    pub ledger_category: String,
    pub confidence: f64,
    pub tier: Tier,
    pub rationale: String,
    pub law_references: Vec<String>,
    pub needs_review: bool,
    pub rule_table_version: String,

    /// Non-fatal failures met on the way (timeouts, unreachable services)
    pub degradations: Vec<String>,
}

/// A recorded, versioned classification. Never edited except `superseded_by`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub transaction_id: String,
    pub version: u32,
    pub ledger_category: String,
    pub confidence: f64,
    pub tier: Tier,
    pub rationale: String,
    pub law_references: Vec<String>,
    pub needs_review: bool,
    pub rule_table_version: String,
    pub degradations: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub superseded_by: Option<u32>,
}

impl ClassificationResult {
    pub fn from_proposal(
        transaction_id: &str,
        version: u32,
        proposal: ClassificationProposal,
        created_by: &str,
    ) -> Self {
        ClassificationResult {
            transaction_id: transaction_id.to_string(),
            version,
            ledger_category: proposal.ledger_category,
            confidence: proposal.confidence.clamp(0.0, 1.0),
            tier: proposal.tier,
            rationale: proposal.rationale,
            law_references: proposal.law_references,
            needs_review: proposal.needs_review,
            rule_table_version: proposal.rule_table_version,
            degradations: proposal.degradations,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            superseded_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn is_reviewer_confirmed(&self) -> bool {
        self.tier == Tier::Reviewer
    }
}

// ============================================================================
// COMPLIANCE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    Applicable,
    NotApplicable,
    /// The rule could not be evaluated; a human must decide
    Unknown,
}

impl Applicability {
    pub fn from_bool(value: bool) -> Self {
        if value {
            Applicability::Applicable
        } else {
            Applicability::NotApplicable
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Applicability::Applicable => "applicable",
            Applicability::NotApplicable => "not_applicable",
            Applicability::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "applicable" => Some(Applicability::Applicable),
            "not_applicable" => Some(Applicability::NotApplicable),
            "unknown" => Some(Applicability::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Derived,
    Reviewer,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Derived => "derived",
            Origin::Reviewer => "reviewer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "derived" => Some(Origin::Derived),
            "reviewer" => Some(Origin::Reviewer),
            _ => None,
        }
    }
}

/// Pure output of a compliance rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceFinding {
    pub transaction_id: String,
    pub classification_version: u32,
    pub rule_id: String,
    pub applicable: Applicability,
    pub section_reference: String,
    pub reason: String,
    pub rule_table_version: String,
    pub origin: Origin,
}

/// Stored finding: versioned per (transaction, rule_id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingRecord {
    pub id: String,
    pub version: u32,
    pub finding: ComplianceFinding,
    pub superseded_by: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl FindingRecord {
    pub fn is_active(&self) -> bool {
        self.superseded_by.is_none()
    }
}

// ============================================================================
// RED FLAGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Duplicate,
    CashLimit,
    CashStructuring,
    SuspiciousVendor,
    GstMismatch,
    PatternOutlier,
    RecurringDeviation,
    MissingInvoice,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Duplicate => "duplicate",
            FlagType::CashLimit => "cash_limit",
            FlagType::CashStructuring => "cash_structuring",
            FlagType::SuspiciousVendor => "suspicious_vendor",
            FlagType::GstMismatch => "gst_mismatch",
            FlagType::PatternOutlier => "pattern_outlier",
            FlagType::RecurringDeviation => "recurring_deviation",
            FlagType::MissingInvoice => "missing_invoice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "duplicate" => Some(FlagType::Duplicate),
            "cash_limit" => Some(FlagType::CashLimit),
            "cash_structuring" => Some(FlagType::CashStructuring),
            "suspicious_vendor" => Some(FlagType::SuspiciousVendor),
            "gst_mismatch" => Some(FlagType::GstMismatch),
            "pattern_outlier" => Some(FlagType::PatternOutlier),
            "recurring_deviation" => Some(FlagType::RecurringDeviation),
            "missing_invoice" => Some(FlagType::MissingInvoice),
            _ => None,
        }
    }
}

impl fmt::Display for FlagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedFlag {
    pub id: String,
    pub transaction_id: String,
    pub flag_type: FlagType,
    pub severity: Severity,
    pub message: String,
    pub detector: String,

    /// Stable identity of the flagged condition; rescans dedup on this, not the message
    #[serde(default)]
    pub subject_key: String,

    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolution_note: Option<String>,
    pub resolved_by: Option<String>,
}

impl RedFlag {
    pub fn raise(
        transaction_id: &str,
        flag_type: FlagType,
        severity: Severity,
        message: String,
        detector: &str,
    ) -> Self {
        RedFlag {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.to_string(),
            flag_type,
            severity,
            subject_key: message.clone(),
            message,
            detector: detector.to_string(),
            created_at: Utc::now(),
            resolved: false,
            resolution_note: None,
            resolved_by: None,
        }
    }

    /// For messages that embed neighborhood totals
    pub fn with_subject_key(mut self, key: impl Into<String>) -> Self {
        self.subject_key = key.into();
        self
    }

    /// Same condition on the same transaction
    pub fn same_condition(&self, other: &RedFlag) -> bool {
        self.transaction_id == other.transaction_id
            && self.flag_type == other.flag_type
            && self.detector == other.detector
            && self.subject_key == other.subject_key
    }
}

// ============================================================================
// AUDIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Transaction,
    Classification,
    ComplianceFinding,
    RedFlag,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Transaction => "transaction",
            SubjectType::Classification => "classification",
            SubjectType::ComplianceFinding => "compliance_finding",
            SubjectType::RedFlag => "red_flag",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "transaction" => Some(SubjectType::Transaction),
            "classification" => Some(SubjectType::Classification),
            "compliance_finding" => Some(SubjectType::ComplianceFinding),
            "red_flag" => Some(SubjectType::RedFlag),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Classified,
    Reclassified,
    Overridden,
    FindingsEvaluated,
    FlagRaised,
    FlagResolved,
    Reevaluated,
    MarkedForReview,
    Retired,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Classified => "classified",
            AuditAction::Reclassified => "reclassified",
            AuditAction::Overridden => "overridden",
            AuditAction::FindingsEvaluated => "findings_evaluated",
            AuditAction::FlagRaised => "flag_raised",
            AuditAction::FlagResolved => "flag_resolved",
            AuditAction::Reevaluated => "reevaluated",
            AuditAction::MarkedForReview => "marked_for_review",
            AuditAction::Retired => "retired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "classified" => Some(AuditAction::Classified),
            "reclassified" => Some(AuditAction::Reclassified),
            "overridden" => Some(AuditAction::Overridden),
            "findings_evaluated" => Some(AuditAction::FindingsEvaluated),
            "flag_raised" => Some(AuditAction::FlagRaised),
            "flag_resolved" => Some(AuditAction::FlagResolved),
            "reevaluated" => Some(AuditAction::Reevaluated),
            "marked_for_review" => Some(AuditAction::MarkedForReview),
            "retired" => Some(AuditAction::Retired),
            _ => None,
        }
    }
}

/// One entry per state-changing event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub actor: String,
    pub action: AuditAction,
    pub previous_version: Option<u32>,
    pub new_version: Option<u32>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

// ============================================================================
// TESTS
// ============================================================================
