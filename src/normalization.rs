// 🧹 Normalization Service - raw rows → canonical transactions
//
// Parsing is pure (`normalize`); the only side effect is the idempotent
// upsert in `ingest`, keyed by (sheet_id, dedup_key).

use crate::error::{PipelineError, Result};
use crate::extraction::RawRow;
use crate::model::{Direction, PaymentMode, Transaction};
use crate::store::LedgerStore;
use chrono::{Datelike, NaiveDate};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

// ============================================================================
// AMOUNT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedAmount {
    /// Absolute value, rounded to paise
    pub value: f64,
    /// Leading '-', trailing '-' or accounting parentheses
    pub negative: bool,
    /// Explicit Cr/Dr marker in the text
    pub marker: Option<Direction>,
}

pub fn round_paise(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parse Indian-format amount text: "₹1,50,000.00", "(2,500)", "12,000 Cr", "Rs. 450 Dr"
pub fn parse_amount(text: &str) -> Result<ParsedAmount> {
    let original = text;
    let mut s = text.trim().to_lowercase();

    if s.is_empty() {
        return Err(PipelineError::validation("amount", original, "empty amount"));
    }

    let mut marker = None;
    for (suffix, direction) in [
        ("cr.", Direction::Credit),
        ("cr", Direction::Credit),
        ("dr.", Direction::Debit),
        ("dr", Direction::Debit),
    ] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            marker = Some(direction);
            s = stripped.to_string();
            break;
        }
    }

    for token in ["₹", "inr", "rs.", "rs", ",", " "] {
        s = s.replace(token, "");
    }

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') && s.len() >= 2 {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    if let Some(stripped) = s.strip_prefix('-') {
        negative = true;
        s = stripped.to_string();
    } else if let Some(stripped) = s.strip_suffix('-') {
        negative = true;
        s = stripped.to_string();
    }
    if let Some(stripped) = s.strip_prefix('+') {
        s = stripped.to_string();
    }

    if !s.chars().any(|c| c.is_ascii_digit()) {
        return Err(PipelineError::validation("amount", original, "no digits"));
    }

    let value: f64 = s
        .parse()
        .map_err(|_| PipelineError::validation("amount", original, "not a number"))?;

    if !value.is_finite() {
        return Err(PipelineError::validation("amount", original, "not finite"));
    }

    let value = round_paise(value.abs());
    if value == 0.0 {
        return Err(PipelineError::validation("amount", original, "zero amount"));
    }

    Ok(ParsedAmount {
        value,
        negative,
        marker,
    })
}

/// Optional amounts (tax columns): empty → None, garbage → ValidationError
pub fn parse_optional_amount(field: &'static str, text: Option<&str>) -> Result<Option<f64>> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        None => Ok(None),
        Some(t) => match parse_amount(t) {
            Ok(parsed) => Ok(Some(parsed.value)),
            Err(_) => Err(PipelineError::validation(field, t, "not a number")),
        },
    }
}

// ============================================================================
// DATE
// ============================================================================

const FOUR_DIGIT_YEAR_FORMATS: &[&str] = &[
    "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d", "%d-%b-%Y", "%d %b %Y", "%d %B %Y",
];
const TWO_DIGIT_YEAR_FORMATS: &[&str] = &["%d/%m/%y", "%d-%m-%y", "%d.%m.%y", "%d-%b-%y"];

/// Day-first dates as printed on Indian statements
pub fn parse_date(text: &str) -> Result<NaiveDate> {
    let s = text.trim();
    if s.is_empty() {
        return Err(PipelineError::validation("date", text, "empty date"));
    }

    // chrono's %Y happily reads "24" as year 24, so pick the family by the tail
    let digit_run = |segment: Option<&str>| segment.map(str::len).unwrap_or(0);
    let head_len = digit_run(s.split(|c: char| !c.is_ascii_digit()).next());
    let tail_len = digit_run(s.rsplit(|c: char| !c.is_ascii_digit()).next());
    let formats = if tail_len == 2 && head_len != 4 {
        TWO_DIGIT_YEAR_FORMATS
    } else {
        FOUR_DIGIT_YEAR_FORMATS
    };

    for format in formats {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            if date.year() < 1900 {
                break;
            }
            return Ok(date);
        }
    }

    Err(PipelineError::validation("date", text, "unrecognized date format"))
}

// ============================================================================
// DIRECTION / MODE / VENDOR
// ============================================================================

const CREDIT_KEYWORDS: &[&str] = &[
    "deposit", "received", "receipt", "refund", "credited", "by transfer", "sales", "reversal",
];
const DEBIT_KEYWORDS: &[&str] = &[
    "withdrawal", "paid", "payment", "purchase", "debited", "to transfer", "charges",
];

/// type hint > Cr/Dr marker > sign > description keywords > debit
pub fn infer_direction(
    type_hint: Option<&str>,
    amount: &ParsedAmount,
    description: &str,
) -> Result<Direction> {
    if let Some(hint) = type_hint.map(str::trim).filter(|h| !h.is_empty()) {
        return Direction::parse(hint)
            .ok_or_else(|| PipelineError::validation("type", hint, "unknown direction hint"));
    }

    if let Some(marker) = amount.marker {
        return Ok(marker);
    }

    if amount.negative {
        return Ok(Direction::Debit);
    }

    let lower = description.to_lowercase();
    if CREDIT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Ok(Direction::Credit);
    }
    if DEBIT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Ok(Direction::Debit);
    }

    Ok(Direction::Debit)
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_uppercase())
        .collect()
}

/// Mode hint, else the first payment-rail token in the description
pub fn infer_payment_mode(mode_hint: Option<&str>, description: &str) -> Option<PaymentMode> {
    if let Some(mode) = mode_hint.and_then(PaymentMode::parse) {
        return Some(mode);
    }

    tokens(description).iter().find_map(|t| match t.as_str() {
        "CASH" | "CSH" => Some(PaymentMode::Cash),
        "UPI" => Some(PaymentMode::Upi),
        "NEFT" => Some(PaymentMode::Neft),
        "RTGS" => Some(PaymentMode::Rtgs),
        "IMPS" => Some(PaymentMode::Imps),
        "CHQ" | "CHEQUE" | "CLG" => Some(PaymentMode::Cheque),
        "POS" | "CARD" => Some(PaymentMode::Card),
        _ => None,
    })
}

const RAIL_PREFIXES: &[&str] = &["UPI", "NEFT", "RTGS", "IMPS", "POS", "ACH", "CHQ"];

/// Vendor hint, else the payee segment of "UPI/123/ABC TRADERS/okaxis" or
/// "NEFT-HDFC0001-XYZ LANDLORDS" style narrations, else the cleaned description
pub fn extract_vendor(vendor_hint: Option<&str>, description: &str) -> String {
    if let Some(vendor) = vendor_hint.map(str::trim).filter(|v| !v.is_empty()) {
        return collapse_whitespace(vendor);
    }

    let desc = description.trim();
    let upper = desc.to_uppercase();

    if RAIL_PREFIXES.iter().any(|p| upper.starts_with(p)) {
        let separator = if desc.contains('/') { '/' } else { '-' };
        let payee = desc
            .split(separator)
            .skip(1)
            .map(str::trim)
            .find(|seg| seg.len() > 2 && !seg.chars().any(|c| c.is_ascii_digit()));
        if let Some(payee) = payee {
            return collapse_whitespace(payee);
        }
    }

    // Cleaned description: drop digits/reference noise, keep the first words
    let cleaned: Vec<String> = desc
        .split_whitespace()
        .filter(|w| !w.chars().any(|c| c.is_ascii_digit()))
        .take(4)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '&').to_string())
        .filter(|w| !w.is_empty())
        .collect();

    if cleaned.is_empty() {
        collapse_whitespace(desc)
    } else {
        cleaned.join(" ")
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// DEDUP KEY & TEXT SIMILARITY
// ============================================================================

/// Lower-case, alphanumerics only, single spaces
pub fn normalize_description(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized text padded with spaces so every word has a boundary on both sides
pub fn pad_words(text: &str) -> String {
    format!(" {} ", normalize_description(text))
}

/// Whole-word (or whole-phrase) lookup in text produced by `pad_words`
pub fn contains_phrase(padded: &str, phrase: &str) -> bool {
    let phrase = normalize_description(phrase);
    !phrase.is_empty() && padded.contains(&format!(" {} ", phrase))
}

/// Compute dedup key for re-ingestion detection
/// NOTE: This is for DEDUPLICATION, not IDENTITY! Identity = id (UUID)
pub fn compute_dedup_key(
    sheet_id: &str,
    date: NaiveDate,
    description: &str,
    amount: f64,
    direction: Direction,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{:.2}|{}",
        sheet_id,
        date.format("%Y-%m-%d"),
        normalize_description(description),
        amount,
        direction.as_str()
    ));
    format!("{:x}", hasher.finalize())
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = normalize_description(text).chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Character-bigram Dice coefficient in [0, 1]
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let na = normalize_description(a);
    let nb = normalize_description(b);
    if na == nb {
        return if na.is_empty() { 0.0 } else { 1.0 };
    }

    let ba = bigrams(&na);
    let bb = bigrams(&nb);
    if ba.is_empty() || bb.is_empty() {
        return 0.0;
    }

    let shared = ba.intersection(&bb).count();
    (2.0 * shared as f64) / (ba.len() + bb.len()) as f64
}

// ============================================================================
// NORMALIZE + INGEST
// ============================================================================

/// Everything a Transaction has except identity and ingestion metadata
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub client_id: String,
    pub sheet_id: String,
    pub document_id: String,
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub direction: Direction,
    pub vendor: String,
    pub gstin: Option<String>,
    pub payment_mode: Option<PaymentMode>,
    pub tax_amount: Option<f64>,
    pub invoice_number: Option<String>,
    pub tds_deducted: Option<f64>,
    pub dedup_key: String,
}

pub fn normalize(client_id: &str, sheet_id: &str, row: &RawRow) -> Result<NormalizedRow> {
    let description = collapse_whitespace(&row.description_text);
    if description.is_empty() {
        return Err(PipelineError::validation(
            "description",
            &row.description_text,
            "empty description",
        ));
    }

    let date = parse_date(&row.date_text)?;
    let amount = parse_amount(&row.amount_text)?;
    let direction = infer_direction(row.type_hint.as_deref(), &amount, &description)?;
    let tax_amount = parse_optional_amount("tax", row.tax_text.as_deref())?;
    let tds_deducted = parse_optional_amount("tds", row.tds_text.as_deref())?;
    let invoice_number = row
        .invoice_text
        .as_deref()
        .map(collapse_whitespace)
        .filter(|i| !i.is_empty());

    let gstin = row
        .gstin_text
        .as_deref()
        .map(|g| g.trim().to_uppercase())
        .filter(|g| !g.is_empty());

    let dedup_key = compute_dedup_key(sheet_id, date, &description, amount.value, direction);

    Ok(NormalizedRow {
        client_id: client_id.to_string(),
        sheet_id: sheet_id.to_string(),
        document_id: row.document_id.clone(),
        date,
        vendor: extract_vendor(row.vendor_text.as_deref(), &description),
        payment_mode: infer_payment_mode(row.mode_hint.as_deref(), &description),
        description,
        amount: amount.value,
        direction,
        gstin,
        tax_amount,
        invoice_number,
        tds_deducted,
        dedup_key,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Inserted(Transaction),
    /// dedup_key already present for the sheet: no-op, existing transaction
    Existing(Transaction),
}

impl IngestOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            IngestOutcome::Inserted(tx) | IngestOutcome::Existing(tx) => tx,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction().id
    }

    pub fn is_new(&self) -> bool {
        matches!(self, IngestOutcome::Inserted(_))
    }
}

/// Normalize and upsert one raw row. Emits no audit entry.
pub fn ingest(
    store: &LedgerStore,
    client_id: &str,
    sheet_id: &str,
    row: &RawRow,
) -> Result<IngestOutcome> {
    let normalized = normalize(client_id, sheet_id, row)?;
    let outcome = store.upsert_transaction(normalized);

    if !outcome.is_new() {
        debug!(
            transaction_id = %outcome.transaction_id(),
            line = row.line_number,
            "dedup key collision, returning existing transaction"
        );
    }

    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount_indian_formats() {
        assert_eq!(parse_amount("₹1,50,000.00").unwrap().value, 150_000.0);
        assert_eq!(parse_amount("Rs. 450").unwrap().value, 450.0);

        let paren = parse_amount("(2,500)").unwrap();
        assert_eq!(paren.value, 2_500.0);
        assert!(paren.negative);

        let cr = parse_amount("12,000 Cr").unwrap();
        assert_eq!(cr.marker, Some(Direction::Credit));

        let dr = parse_amount("300.50 DR").unwrap();
        assert_eq!(dr.marker, Some(Direction::Debit));
        assert_eq!(dr.value, 300.5);
    }

    #[test]
    fn test_parse_amount_rejections_name_field() {
        for bad in ["", "abc", "0.00", "--"] {
            let err = parse_amount(bad).unwrap_err();
            assert_eq!(err.field(), Some("amount"), "input {:?}", bad);
        }
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        for text in ["01/04/2024", "01-04-2024", "01.04.2024", "2024-04-01", "01-Apr-2024", "01/04/24"] {
            assert_eq!(parse_date(text).unwrap(), expected, "input {}", text);
        }
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        let err = parse_date("31/31/2024").unwrap_err();
        assert_eq!(err.field(), Some("date"));
        assert!(parse_date("yesterday").is_err());
    }

    #[test]
    fn test_direction_precedence() {
        let plain = parse_amount("100").unwrap();
        let negative = parse_amount("-100").unwrap();
        let cr = parse_amount("100 Cr").unwrap();

        // hint wins over everything
        assert_eq!(
            infer_direction(Some("credit"), &negative, "payment").unwrap(),
            Direction::Credit
        );
        // marker beats sign and keywords
        assert_eq!(infer_direction(None, &cr, "payment").unwrap(), Direction::Credit);
        assert_eq!(infer_direction(None, &negative, "refund").unwrap(), Direction::Debit);
        assert_eq!(infer_direction(None, &plain, "Refund from vendor").unwrap(), Direction::Credit);
        assert_eq!(infer_direction(None, &plain, "Misc").unwrap(), Direction::Debit);
        assert!(infer_direction(Some("sideways"), &plain, "x").is_err());
    }

    #[test]
    fn test_payment_mode_inference() {
        assert_eq!(
            infer_payment_mode(None, "NEFT-HDFC0001-XYZ"),
            Some(PaymentMode::Neft)
        );
        assert_eq!(infer_payment_mode(None, "Cash paid to driver"), Some(PaymentMode::Cash));
        assert_eq!(infer_payment_mode(Some("upi"), "Cash"), Some(PaymentMode::Upi));
        assert_eq!(infer_payment_mode(None, "Office Rent"), None);
    }

    #[test]
    fn test_vendor_extraction() {
        assert_eq!(extract_vendor(None, "UPI/412345678/ABC Traders/okaxis"), "ABC Traders");
        assert_eq!(extract_vendor(None, "NEFT-HDFC0001234-XYZ LANDLORDS"), "XYZ LANDLORDS");
        assert_eq!(extract_vendor(Some("  Acme  Ltd "), "whatever"), "Acme Ltd");
        assert_eq!(extract_vendor(None, "Office Rent April 2024"), "Office Rent April");
    }

    #[test]
    fn test_dedup_key_ignores_case_and_punctuation() {
        let date = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let a = compute_dedup_key("s1", date, "Office Rent - April", 50_000.0, Direction::Debit);
        let b = compute_dedup_key("s1", date, "office rent april", 50_000.0, Direction::Debit);
        let other_sheet = compute_dedup_key("s2", date, "office rent april", 50_000.0, Direction::Debit);
        let other_dir = compute_dedup_key("s1", date, "office rent april", 50_000.0, Direction::Credit);

        assert_eq!(a, b);
        assert_ne!(a, other_sheet);
        assert_ne!(a, other_dir);
    }

    #[test]
    fn test_text_similarity() {
        assert_eq!(text_similarity("Office Rent", "office rent"), 1.0);
        assert!(text_similarity("Office Rent April", "Office Rent Apr") > 0.85);
        assert!(text_similarity("Office Rent", "Diesel for truck") < 0.3);
        assert_eq!(text_similarity("", ""), 0.0);
    }

    #[test]
    fn test_contains_phrase_respects_word_boundaries() {
        let padded = pad_words("NEFT/current a/c - Kolkata premium");
        assert!(!contains_phrase(&padded, "rent"));
        assert!(!contains_phrase(&padded, "ola"));
        assert!(!contains_phrase(&padded, "emi"));
        assert!(contains_phrase(&padded, "Premium"));
        assert!(contains_phrase(&padded, "a/c"));
        assert!(!contains_phrase(&padded, " - "));
    }

    #[test]
    fn test_normalize_rejects_empty_description() {
        let row = RawRow::new("d1", "01/04/2024", "   ", "100");
        let err = normalize("c1", "s1", &row).unwrap_err();
        assert_eq!(err.field(), Some("description"));
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let store = LedgerStore::new();
        let row = RawRow::new("d1", "01/04/2024", "Office Rent", "50,000").with_mode("cash");

        let first = ingest(&store, "c1", "s1", &row).unwrap();
        let second = ingest(&store, "c1", "s1", &row).unwrap();

        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.transaction_id(), second.transaction_id());
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(first.transaction().payment_mode, Some(PaymentMode::Cash));
    }
}
