// 🔌 External collaborators - similarity index, model classifier, reconciliation feed
//
// Each collaborator sits behind a narrow trait so the cascade's decision
// logic can be tested with deterministic mocks. Outbound calls go through
// `call_with_retry`: hard per-call timeout, exponential backoff.

use crate::config::ClassificationConfig;
use crate::error::{PipelineError, Result};
use crate::model::Transaction;
use crate::normalization::text_similarity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const SIMILARITY_SERVICE: &str = "similarity_index";
pub const MODEL_SERVICE: &str = "model_classifier";

// ============================================================================
// CONTRACTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMatch {
    pub category: String,
    pub similarity: f64,
    pub text: String,
}

/// Nearest previously classified transactions, scoped to one tenant
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Best matches first. Must never return another client's data.
    async fn nearest(&self, client_id: &str, text: &str) -> Result<Vec<SimilarMatch>>;

    /// Teach the index a confirmed (text, category) pair
    fn learn(&self, client_id: &str, text: &str, category: &str);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub category: String,
    pub confidence: f64,
    pub rationale: String,
}

#[async_trait]
pub trait ModelClassifier: Send + Sync {
    async fn classify_with_context(
        &self,
        transaction: &Transaction,
        examples: &[SimilarMatch],
        taxonomy: &[String],
    ) -> Result<ModelVerdict>;
}

/// Authoritative filings data (e.g. supplier-uploaded invoices), keyed by GSTIN + period
pub trait ReconciliationFeed: Send + Sync {
    /// ITC the counterparty reported for (gstin, year, month); None = no record
    fn reported_itc(&self, gstin: &str, year: i32, month: u32) -> Option<f64>;
}

// ============================================================================
// CORPUS INDEX (in-process similarity)
// ============================================================================

#[derive(Debug, Clone)]
struct CorpusEntry {
    text: String,
    category: String,
}

/// Per-client corpus scored with character-bigram similarity
#[derive(Debug)]
pub struct CorpusIndex {
    corpora: RwLock<HashMap<String, Vec<CorpusEntry>>>,
    max_results: usize,
}

impl CorpusIndex {
    pub fn new() -> Self {
        CorpusIndex {
            corpora: RwLock::new(HashMap::new()),
            max_results: 10,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn len(&self, client_id: &str) -> usize {
        self.corpora
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, client_id: &str) -> bool {
        self.len(client_id) == 0
    }

    fn search(&self, client_id: &str, text: &str) -> Vec<SimilarMatch> {
        let corpora = self.corpora.read().unwrap_or_else(PoisonError::into_inner);
        let Some(corpus) = corpora.get(client_id) else {
            return Vec::new();
        };

        let mut matches: Vec<SimilarMatch> = corpus
            .iter()
            .map(|entry| SimilarMatch {
                category: entry.category.clone(),
                similarity: text_similarity(text, &entry.text),
                text: entry.text.clone(),
            })
            .filter(|m| m.similarity > 0.0)
            .collect();

        // Ties broken by text so results are deterministic
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.text.cmp(&b.text))
        });
        matches.truncate(self.max_results);
        matches
    }
}

impl Default for CorpusIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SimilarityIndex for CorpusIndex {
    async fn nearest(&self, client_id: &str, text: &str) -> Result<Vec<SimilarMatch>> {
        Ok(self.search(client_id, text))
    }

    fn learn(&self, client_id: &str, text: &str, category: &str) {
        let mut corpora = self.corpora.write().unwrap_or_else(PoisonError::into_inner);
        let corpus = corpora.entry(client_id.to_string()).or_default();

        // Re-learning the same text replaces its category (latest confirmation wins)
        match corpus.iter_mut().find(|e| e.text.eq_ignore_ascii_case(text)) {
            Some(entry) => entry.category = category.to_string(),
            None => corpus.push(CorpusEntry {
                text: text.to_string(),
                category: category.to_string(),
            }),
        }
    }
}

// ============================================================================
// OFFLINE MODEL
// ============================================================================

/// Used when no model service is configured. The error is not degradable so
/// no retries are spent on it; the cascade still lands on its needs_review path.
#[derive(Debug, Default)]
pub struct OfflineModel;

#[async_trait]
impl ModelClassifier for OfflineModel {
    async fn classify_with_context(
        &self,
        _transaction: &Transaction,
        _examples: &[SimilarMatch],
        _taxonomy: &[String],
    ) -> Result<ModelVerdict> {
        Err(PipelineError::Config("no model service configured".to_string()))
    }
}

// ============================================================================
// STATIC RECONCILIATION FEED
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub gstin: String,
    pub year: i32,
    pub month: u32,
    pub itc: f64,
}

#[derive(Debug, Default)]
pub struct StaticReconciliationFeed {
    records: HashMap<(String, i32, u32), f64>,
}

impl StaticReconciliationFeed {
    pub fn new(records: Vec<ReconciliationRecord>) -> Self {
        let mut feed = StaticReconciliationFeed::default();
        for r in records {
            *feed
                .records
                .entry((r.gstin.trim().to_uppercase(), r.year, r.month))
                .or_insert(0.0) += r.itc;
        }
        feed
    }

    /// JSON array of ReconciliationRecord
    pub fn from_json(content: &str) -> Result<Self> {
        let records: Vec<ReconciliationRecord> = serde_json::from_str(content)?;
        Ok(Self::new(records))
    }
}

impl ReconciliationFeed for StaticReconciliationFeed {
    fn reported_itc(&self, gstin: &str, year: i32, month: u32) -> Option<f64> {
        self.records
            .get(&(gstin.trim().to_uppercase(), year, month))
            .copied()
    }
}

// ============================================================================
// RETRY WITH TIMEOUT
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClassificationConfig) -> Self {
        RetryPolicy {
            timeout: config.call_timeout(),
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
        }
    }
}

/// Run `op` with a hard timeout per attempt, retrying degradable failures
/// with doubling backoff. The last failure is returned after the final attempt.
pub async fn call_with_retry<T, F, Fut>(service: &str, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0;

    loop {
        let error = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_degradable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => PipelineError::ClassificationTimeout {
                service: service.to_string(),
                timeout_ms: policy.timeout.as_millis() as u64,
            },
        };

        if attempt >= policy.max_retries {
            debug!(service, attempts = attempt + 1, "giving up");
            return Err(error);
        }

        warn!(
            service,
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "external call failed, retrying"
        );

        tokio::time::sleep(backoff).await;
        backoff *= 2;
        attempt += 1;
    }
}

// ============================================================================
// TESTS
// ============================================================================
