// ⚙️ Pipeline configuration - TOML file, env override, compiled defaults
//
// Resolution order for the file path:
//   1. explicit path (CLI flag)
//   2. EAGLE_LEDGER_CONFIG environment variable
//   3. compiled defaults (no file)

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "EAGLE_LEDGER_CONFIG";

// ============================================================================
// TOP-LEVEL CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub classification: ClassificationConfig,
    pub compliance: ComplianceConfig,
    pub anomaly: AnomalyConfig,
    pub pipeline: WorkerConfig,

    /// Optional JSON rule table; the built-in table is used when absent
    pub rules_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            classification: ClassificationConfig::default(),
            compliance: ComplianceConfig::default(),
            anomaly: AnomalyConfig::default(),
            pipeline: WorkerConfig::default(),
            rules_path: None,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!(
                "failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Resolve the config file (CLI path > env var > defaults) and load it
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = cli_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Self::from_file(path);
            }
        }

        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.classification;
        for (name, value) in [
            ("classification.rule_threshold", c.rule_threshold),
            ("classification.similarity_threshold", c.similarity_threshold),
            ("classification.model_threshold", c.model_threshold),
            ("anomaly.description_similarity", self.anomaly.description_similarity),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if c.call_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "classification.call_timeout_ms must be positive".to_string(),
            ));
        }

        if self.pipeline.workers == 0 {
            return Err(PipelineError::Config(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }

        if self.compliance.cash_payment_limit <= 0.0 {
            return Err(PipelineError::Config(
                "compliance.cash_payment_limit must be positive".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.compliance.tds_default_disallowance_rate) {
            return Err(PipelineError::Config(format!(
                "compliance.tds_default_disallowance_rate must be a percentage, got {}",
                self.compliance.tds_default_disallowance_rate
            )));
        }

        if self.anomaly.invoice_high_amount < self.anomaly.invoice_medium_amount {
            return Err(PipelineError::Config(
                "anomaly.invoice_high_amount cannot be below anomaly.invoice_medium_amount".to_string(),
            ));
        }

        if self.anomaly.near_duplicate_window_days < 0 {
            return Err(PipelineError::Config(
                "anomaly.near_duplicate_window_days cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// CLASSIFICATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    /// T1: minimum rule confidence to stop at the rule tier
    pub rule_threshold: f64,

    /// T2: minimum top-match similarity to stop at the similarity tier
    pub similarity_threshold: f64,

    /// T3: model confidence below this is accepted but tagged needs_review
    pub model_threshold: f64,

    /// Hard timeout for a single external call
    pub call_timeout_ms: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// First backoff delay, doubled after every failed attempt
    pub initial_backoff_ms: u64,

    /// Number of similar examples handed to the model tier
    pub similar_examples: usize,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        ClassificationConfig {
            rule_threshold: 0.90,
            similarity_threshold: 0.75,
            model_threshold: 0.50,
            call_timeout_ms: 5_000,
            max_retries: 2,
            initial_backoff_ms: 200,
            similar_examples: 5,
        }
    }
}

impl ClassificationConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

// ============================================================================
// COMPLIANCE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Income Tax Act §40A(3) per-transaction cash limit (₹)
    pub cash_payment_limit: f64,

    /// TDS sections with thresholds, evaluated independently
    pub tds_sections: Vec<TdsSectionConfig>,

    /// Income Tax Act §40(a)(ia): percent of the payment disallowed when TDS was due but not deducted
    pub tds_default_disallowance_rate: f64,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        ComplianceConfig {
            cash_payment_limit: 10_000.0,
            tds_sections: TdsSectionConfig::defaults(),
            tds_default_disallowance_rate: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TdsSectionConfig {
    /// Section code, e.g. "194C"
    pub section: String,
    pub name: String,

    /// A single payment at or above this makes TDS applicable
    pub single_threshold: f64,

    /// Cumulative payments to the vendor in the financial year above this
    pub aggregate_threshold: f64,

    /// Rate in percent
    pub rate: f64,

    /// Description keywords
    pub keywords: Vec<String>,

    /// Ledger categories that imply this section
    #[serde(default)]
    pub categories: Vec<String>,
}

impl TdsSectionConfig {
    pub fn defaults() -> Vec<TdsSectionConfig> {
        fn section(
            code: &str,
            name: &str,
            single: f64,
            aggregate: f64,
            rate: f64,
            keywords: &[&str],
            categories: &[&str],
        ) -> TdsSectionConfig {
            TdsSectionConfig {
                section: code.to_string(),
                name: name.to_string(),
                single_threshold: single,
                aggregate_threshold: aggregate,
                rate,
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                categories: categories.iter().map(|c| c.to_string()).collect(),
            }
        }

        vec![
            section(
                "194C",
                "Payments to Contractors",
                30_000.0,
                100_000.0,
                1.0,
                &["contractor", "contract", "sub-contract", "labour", "work order", "construction"],
                &["Contract Labour"],
            ),
            section(
                "194J",
                "Professional/Technical Services",
                30_000.0,
                30_000.0,
                10.0,
                &["professional", "consultant", "consulting", "technical", "legal", "audit", "architect", "advisory"],
                &["Professional Fees"],
            ),
            section(
                "194I",
                "Rent Payments",
                240_000.0,
                240_000.0,
                10.0,
                &["rent", "lease", "rental", "tenancy"],
                &["Rent"],
            ),
            section(
                "194H",
                "Commission/Brokerage",
                15_000.0,
                15_000.0,
                5.0,
                &["commission", "brokerage", "broker"],
                &["Commission"],
            ),
            section(
                "194A",
                "Interest Payments",
                40_000.0,
                40_000.0,
                10.0,
                &["interest", "loan interest", "deposit interest"],
                &["Interest Expense"],
            ),
        ]
    }
}

// ============================================================================
// ANOMALY DETECTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Near-duplicate time window in days
    pub near_duplicate_window_days: i64,

    /// Minimum description similarity for a near-duplicate (0..1)
    pub description_similarity: f64,

    /// Absolute amount tolerance for "same amount" (₹)
    pub amount_tolerance: f64,

    /// |z| above this raises a low-severity pattern flag
    pub z_score_threshold: f64,

    /// |z| above this raises a medium-severity pattern flag
    pub z_score_high: f64,

    /// Minimum same-category history before z-scores are meaningful
    pub min_history: usize,

    /// Approved vendors; empty disables the unknown-vendor check
    pub known_vendors: Vec<String>,

    /// ITC difference (₹) tolerated against the reconciliation feed
    pub gst_mismatch_tolerance: f64,

    /// Debit without an invoice number: medium at or above this amount (₹)
    pub invoice_medium_amount: f64,

    /// ... and high at or above this one
    pub invoice_high_amount: f64,

    /// Earlier payments to one vendor needed before it counts as recurring
    pub recurring_min_occurrences: usize,

    /// Coefficient of variation below which vendor amounts count as consistent
    pub recurring_amount_variance: f64,

    /// Slack (days) around the usual interval of a monthly payment
    pub recurring_date_tolerance_days: i64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        AnomalyConfig {
            near_duplicate_window_days: 7,
            description_similarity: 0.85,
            amount_tolerance: 0.01,
            z_score_threshold: 2.5,
            z_score_high: 3.0,
            min_history: 5,
            known_vendors: Vec::new(),
            gst_mismatch_tolerance: 1.0,
            invoice_medium_amount: 5_000.0,
            invoice_high_amount: 10_000.0,
            recurring_min_occurrences: 3,
            recurring_amount_variance: 0.2,
            recurring_date_tolerance_days: 5,
        }
    }
}

// ============================================================================
// WORKER POOL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent per-transaction tasks within one document job
    pub workers: usize,

    /// Re-run compliance/anomaly stages right after a classification override
    pub auto_reevaluate_on_override: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            workers: 8,
            auto_reevaluate_on_override: false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = PipelineConfig::default();
        assert_eq!(config.classification.rule_threshold, 0.90);
        assert_eq!(config.classification.similarity_threshold, 0.75);
        assert_eq!(config.classification.model_threshold, 0.50);
        assert_eq!(config.compliance.cash_payment_limit, 10_000.0);
        assert_eq!(config.compliance.tds_sections.len(), 5);
        assert!(!config.pipeline.auto_reevaluate_on_override);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [classification]
            rule_threshold = 0.8

            [anomaly]
            near_duplicate_window_days = 3
            known_vendors = ["XYZ Landlords"]
            "#,
        )
        .unwrap();

        assert_eq!(config.classification.rule_threshold, 0.8);
        assert_eq!(config.classification.similarity_threshold, 0.75);
        assert_eq!(config.anomaly.near_duplicate_window_days, 3);
        assert_eq!(config.anomaly.known_vendors, vec!["XYZ Landlords".to_string()]);
        assert_eq!(config.pipeline.workers, 8);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [classification]
            similarity_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_inverted_invoice_bands_rejected() {
        let err = PipelineConfig::from_toml_str(
            "[anomaly]\ninvoice_medium_amount = 20000.0\ninvoice_high_amount = 10000.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("invoice_high_amount"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = PipelineConfig::from_toml_str("[pipeline]\nworkers = 0\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eagle.toml");
        fs::write(&path, "[compliance]\ncash_payment_limit = 20000.0\n").unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.compliance.cash_payment_limit, 20_000.0);
    }
}
