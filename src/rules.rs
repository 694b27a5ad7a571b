// 🏷️ Ledger Rules - Rules as Data
// Versioned, immutable rule table for the deterministic classification tier

use crate::error::{PipelineError, Result};
use crate::model::{Direction, Transaction};
use crate::normalization::{contains_phrase, pad_words};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const BUILTIN_VERSION: &str = "builtin-1";

/// Confidence cap when only one keyword of a rule is present
pub const SINGLE_KEYWORD_CONFIDENCE: f64 = 0.75;

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRule {
    /// Rule ID for tracking
    pub id: String,

    /// Ledger category to assign
    pub category: String,

    /// Description keywords (case-insensitive, whole words or phrases)
    #[serde(default)]
    pub keywords: Vec<String>,

    /// Wildcard pattern over the description (supports *)
    #[serde(default)]
    pub pattern: Option<String>,

    /// Regular expression over the description
    #[serde(default)]
    pub regex: Option<String>,

    /// Vendor wildcard pattern; a rule with one is vendor-anchored
    #[serde(default)]
    pub vendor_pattern: Option<String>,

    /// Only fire for this direction
    #[serde(default)]
    pub direction: Option<Direction>,

    /// Declared confidence (0.0 - 1.0)
    pub confidence: f64,

    /// Priority (higher = applied first)
    #[serde(default = "default_priority")]
    pub priority: i32,

    /// Statutory references the category implies
    #[serde(default)]
    pub law_references: Vec<String>,
}

fn default_priority() -> i32 {
    0
}

/// Wildcard matching: "*" matches any run, no "*" means substring
pub fn wildcard_matches(pattern: &str, text: &str) -> bool {
    let pattern_lower = pattern.to_lowercase();
    let text_lower = text.to_lowercase();

    if !pattern_lower.contains('*') {
        return text_lower.contains(&pattern_lower);
    }

    let parts: Vec<&str> = pattern_lower.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !text_lower.starts_with(first) {
        return false;
    }
    if !text_lower[first.len()..].ends_with(last) {
        return false;
    }

    // Middle parts must appear in order, between the anchored ends
    let end = text_lower.len() - last.len();
    let mut current_pos = first.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text_lower[current_pos..end].find(part) {
            Some(pos) => current_pos += pos + part.len(),
            None => return false,
        }
    }

    true
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub rule_id: String,
    pub category: String,
    pub confidence: f64,
    pub matched: Vec<String>,
    pub law_references: Vec<String>,
}

// ============================================================================
// RULE TABLE
// ============================================================================

/// Immutable once built; share it as `Arc<RuleTable>`
#[derive(Debug)]
pub struct RuleTable {
    version: String,
    categories: Vec<String>,
    rules: Vec<CompiledRule>,
}

#[derive(Debug)]
struct CompiledRule {
    rule: LedgerRule,
    regex: Option<Regex>,
}

/// JSON file layout for custom tables
#[derive(Debug, Deserialize)]
struct RuleTableFile {
    version: String,
    #[serde(default)]
    categories: Vec<String>,
    rules: Vec<LedgerRule>,
}

impl RuleTable {
    /// Build a table; rules are sorted by priority (higher first)
    pub fn new(version: &str, categories: Vec<String>, rules: Vec<LedgerRule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            if !(0.0..=1.0).contains(&rule.confidence) {
                return Err(PipelineError::Config(format!(
                    "rule '{}' confidence {} outside [0, 1]",
                    rule.id, rule.confidence
                )));
            }
            let regex = match &rule.regex {
                Some(expr) => Some(Regex::new(&format!("(?i){}", expr)).map_err(|e| {
                    PipelineError::Config(format!("rule '{}' has invalid regex: {}", rule.id, e))
                })?),
                None => None,
            };
            compiled.push(CompiledRule { rule, regex });
        }

        // Stable sort keeps file order among equal priorities
        compiled.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        // Taxonomy = declared categories plus every rule target
        let mut taxonomy = categories;
        for c in &compiled {
            if !taxonomy.contains(&c.rule.category) {
                taxonomy.push(c.rule.category.clone());
            }
        }

        Ok(RuleTable {
            version: version.to_string(),
            categories: taxonomy,
            rules: compiled,
        })
    }

    /// Load a rule table from JSON
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!("failed to read rules file {:?}: {}", path.as_ref(), e))
        })?;
        let file: RuleTableFile = serde_json::from_str(&content)?;
        RuleTable::new(&file.version, file.categories, file.rules)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn contains_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Canonical spelling of a category, if it belongs to the taxonomy
    pub fn canonical_category(&self, category: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.eq_ignore_ascii_case(category.trim()))
            .map(String::as_str)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn law_references_for(&self, category: &str) -> Vec<String> {
        self.rules
            .iter()
            .find(|c| c.rule.category.eq_ignore_ascii_case(category))
            .map(|c| c.rule.law_references.clone())
            .unwrap_or_default()
    }

    /// Best match across all rules: highest confidence, then priority order
    pub fn best_match(&self, tx: &Transaction) -> Option<RuleMatch> {
        let mut best: Option<RuleMatch> = None;
        for compiled in &self.rules {
            if let Some(m) = self.score(compiled, tx) {
                if best.as_ref().map(|b| m.confidence > b.confidence).unwrap_or(true) {
                    best = Some(m);
                }
            }
        }
        best
    }

    fn score(&self, compiled: &CompiledRule, tx: &Transaction) -> Option<RuleMatch> {
        let rule = &compiled.rule;

        if let Some(direction) = rule.direction {
            if direction != tx.direction {
                return None;
            }
        }

        let vendor_anchored = match &rule.vendor_pattern {
            Some(pattern) if wildcard_matches(pattern, &tx.vendor) => true,
            Some(_) => return None,
            None => false,
        };

        let description = pad_words(&tx.description);
        let mut matched: Vec<String> = rule
            .keywords
            .iter()
            .filter(|k| contains_phrase(&description, k))
            .cloned()
            .collect();

        // Pattern and regex hits count like keywords
        if let Some(pattern) = &rule.pattern {
            if wildcard_matches(pattern, &tx.description) {
                matched.push(pattern.clone());
            }
        }
        if let Some(regex) = &compiled.regex {
            if regex.is_match(&tx.description) {
                matched.push(regex.as_str().to_string());
            }
        }

        let has_text_conditions =
            !rule.keywords.is_empty() || rule.pattern.is_some() || rule.regex.is_some();

        let confidence = match matched.len() {
            0 if vendor_anchored && !has_text_conditions => rule.confidence,
            0 => return None,
            1 if !vendor_anchored => rule.confidence.min(SINGLE_KEYWORD_CONFIDENCE),
            _ => rule.confidence,
        };

        Some(RuleMatch {
            rule_id: rule.id.clone(),
            category: rule.category.clone(),
            confidence,
            matched,
            law_references: rule.law_references.clone(),
        })
    }

    /// Built-in table for Indian small-business books
    pub fn builtin() -> Self {
        fn rule(
            id: &str,
            category: &str,
            keywords: &[&str],
            confidence: f64,
            priority: i32,
            law_references: &[&str],
        ) -> LedgerRule {
            LedgerRule {
                id: id.to_string(),
                category: category.to_string(),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                pattern: None,
                regex: None,
                vendor_pattern: None,
                direction: Some(Direction::Debit),
                confidence,
                priority,
                law_references: law_references.iter().map(|l| l.to_string()).collect(),
            }
        }

        let mut rules = vec![
            rule("rent", "Rent", &["rent", "lease", "rental", "office rent"], 0.95, 50, &["Income Tax Act §194I"]),
            rule("salary", "Salary & Wages", &["salary", "salaries", "wages", "payroll", "staff"], 0.95, 40, &["Income Tax Act §192"]),
            rule("professional", "Professional Fees", &["consultant", "legal", "audit", "ca fees", "professional", "fees"], 0.95, 40, &["Income Tax Act §194J"]),
            rule("electricity", "Electricity", &["electricity", "power", "eb bill", "mseb", "bill"], 0.92, 30, &[]),
            rule("telephone", "Telephone", &["telephone", "mobile", "airtel", "jio", "vodafone", "recharge"], 0.92, 30, &[]),
            rule("internet", "Internet", &["internet", "broadband", "wifi", "fiber"], 0.92, 30, &[]),
            rule("office_supplies", "Office Supplies", &["stationery", "office supplies", "printing", "paper"], 0.9, 20, &[]),
            rule("travel", "Travel", &["travel", "flight", "train", "taxi", "uber", "ola", "ticket"], 0.9, 20, &[]),
            rule("fuel", "Fuel", &["petrol", "diesel", "fuel", "cng"], 0.92, 20, &[]),
            rule("repairs", "Repairs & Maintenance", &["repair", "repairs", "maintenance", "servicing", "amc"], 0.9, 20, &[]),
            rule("insurance", "Insurance", &["insurance", "premium", "policy"], 0.92, 20, &[]),
            rule("bank_charges", "Bank Charges", &["bank charges", "bank fee", "service charge", "sms charges"], 0.95, 30, &[]),
            rule("interest", "Interest Expense", &["interest", "loan interest", "emi"], 0.9, 25, &["Income Tax Act §194A"]),
            rule("purchase", "Purchase of Goods", &["purchase", "inventory", "stock", "raw material"], 0.9, 10, &["CGST Act §16"]),
            rule("fixed_assets", "Fixed Assets", &["machinery", "equipment", "vehicle", "computer", "furniture", "laptop"], 0.92, 35, &["Income Tax Act §32"]),
            rule("contract_labour", "Contract Labour", &["contractor", "contract", "labour", "work order"], 0.92, 30, &["Income Tax Act §194C"]),
            rule("commission", "Commission", &["commission", "brokerage", "broker"], 0.92, 30, &["Income Tax Act §194H"]),
            rule("food", "Food & Beverages", &["food", "beverage", "restaurant", "catering", "snacks"], 0.9, 15, &["CGST Act §17(5)"]),
            rule("utilities", "Utilities", &["water", "utility", "utilities", "gas"], 0.9, 10, &[]),
        ];

        let mut sales = rule("sales", "Sales", &["sales", "revenue", "invoice", "receipt"], 0.92, 10, &[]);
        sales.direction = Some(Direction::Credit);
        rules.push(sales);

        let mut interest_income = rule("interest_income", "Interest Income", &["interest", "int cr", "fd interest"], 0.9, 10, &[]);
        interest_income.direction = Some(Direction::Credit);
        rules.push(interest_income);

        let categories = vec!["Suspense".to_string(), "Drawings".to_string()];

        // Built-in rules are validated constants; an error here is a programming error
        match RuleTable::new(BUILTIN_VERSION, categories, rules) {
            Ok(table) => table,
            Err(_) => RuleTable {
                version: BUILTIN_VERSION.to_string(),
                categories: vec!["Suspense".to_string()],
                rules: Vec::new(),
            },
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
    use crate::normalization::normalize;
    use crate::store::LedgerStore;

    fn tx(description: &str, vendor: &str, type_hint: &str) -> Transaction {
        let row = RawRow::new("doc", "01/04/2024", description, "50000")
            .with_vendor(vendor)
            .with_type_hint(type_hint);
        let store = LedgerStore::new();
        store
            .upsert_transaction(normalize("c1", "s1", &row).unwrap())
            .transaction()
            .clone()
    }

    #[test]
    fn test_exact_pattern_match() {
        assert!(wildcard_matches("RENT", "Office Rent April"));
        assert!(wildcard_matches("rent", "RENT"));
        assert!(!wildcard_matches("RENT", "Diesel"));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(wildcard_matches("XYZ*", "XYZ Landlords"));
        assert!(wildcard_matches("*landlord*", "XYZ Landlords Pvt"));
        assert!(wildcard_matches("neft*rent*", "NEFT-123-office rent-apr"));
        assert!(!wildcard_matches("XYZ*", "ABC XYZ"));
        assert!(!wildcard_matches("ab*ba", "aba"));
    }

    #[test]
    fn test_two_keywords_reach_declared_confidence() {
        let table = RuleTable::builtin();
        let m = table.best_match(&tx("Office Rent April", "XYZ Landlords", "debit")).unwrap();
        assert_eq!(m.category, "Rent");
        assert_eq!(m.confidence, 0.95);
        assert!(m.law_references.iter().any(|l| l.contains("194I")));
    }

    #[test]
    fn test_single_keyword_capped() {
        let table = RuleTable::builtin();
        let m = table.best_match(&tx("Diesel", "HP Pump", "debit")).unwrap();
        assert_eq!(m.category, "Fuel");
        assert_eq!(m.confidence, SINGLE_KEYWORD_CONFIDENCE);
    }

    #[test]
    fn test_direction_restricts_rules() {
        let table = RuleTable::builtin();
        let m = table.best_match(&tx("Sales invoice 42", "Customer", "credit")).unwrap();
        assert_eq!(m.category, "Sales");
        assert!(table.best_match(&tx("Sales invoice 42", "Customer", "debit")).is_none());
    }

    #[test]
    fn test_vendor_anchored_rule() {
        let mut rule = LedgerRule {
            id: "xyz_rent".to_string(),
            category: "Rent".to_string(),
            keywords: vec!["rent".to_string()],
            pattern: None,
            regex: None,
            vendor_pattern: Some("XYZ Landlords*".to_string()),
            direction: None,
            confidence: 0.97,
            priority: 100,
            law_references: vec![],
        };
        let table = RuleTable::new("t-1", vec![], vec![rule.clone()]).unwrap();

        let hit = table.best_match(&tx("rent", "XYZ Landlords", "debit")).unwrap();
        assert_eq!(hit.confidence, 0.97);
        assert!(table.best_match(&tx("rent", "Someone Else", "debit")).is_none());

        rule.regex = Some("(".to_string());
        assert!(RuleTable::new("t-2", vec![], vec![rule]).is_err());
    }

    #[test]
    fn test_regex_rule() {
        let rule = LedgerRule {
            id: "gst_payment".to_string(),
            category: "GST Payable".to_string(),
            keywords: vec!["gst".to_string()],
            pattern: None,
            regex: Some(r"\bchallan\s+\d+".to_string()),
            vendor_pattern: None,
            direction: None,
            confidence: 0.93,
            priority: 0,
            law_references: vec![],
        };
        let table = RuleTable::new("t-1", vec![], vec![rule]).unwrap();
        let m = table.best_match(&tx("GST CHALLAN 445", "Govt", "debit")).unwrap();
        assert_eq!(m.confidence, 0.93);
        assert!(table.contains_category("gst payable"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(
            &path,
            r#"{"version": "client-7", "categories": ["Suspense"],
                "rules": [{"id": "r1", "category": "Rent", "keywords": ["rent", "lease"], "confidence": 0.9}]}"#,
        )
        .unwrap();

        let table = RuleTable::from_file(&path).unwrap();
        assert_eq!(table.version(), "client-7");
        assert_eq!(table.rule_count(), 1);
        assert_eq!(table.categories(), &["Suspense".to_string(), "Rent".to_string()]);
    }

    #[test]
    fn test_keywords_match_whole_words_only() {
        let table = RuleTable::builtin();
        assert!(table.best_match(&tx("Current account sweep", "HDFC", "debit")).is_none());

        let m = table.best_match(&tx("LIC premium", "LIC", "debit")).unwrap();
        assert_eq!(m.category, "Insurance");
        assert_eq!(m.matched, vec!["premium".to_string()]);

        let m = table.best_match(&tx("Taxi Kolkata airport", "Meru", "debit")).unwrap();
        assert_eq!(m.category, "Travel");
        assert_eq!(m.matched, vec!["taxi".to_string()]);

        let m = table.best_match(&tx("Office-rent/APR", "XYZ Landlords", "debit")).unwrap();
        assert_eq!(m.category, "Rent");
    }

    #[test]
    fn test_no_match() {
        let table = RuleTable::builtin();
        assert!(table.best_match(&tx("ZZQ 0000", "Nobody", "debit")).is_none());
    }
}
