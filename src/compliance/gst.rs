// 🧾 GST rules - ITC eligibility (CGST Act §16, §17(5)) and reverse charge (§9(3))

use super::{find_keyword, ComplianceRule, EvaluationContext, RuleOutcome};
use crate::error::Result;
use thiserror::Error;

// ============================================================================
// GSTIN VALIDATION
// ============================================================================

const GSTIN_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GstinError {
    #[error("GSTIN must be 15 characters, got {0}")]
    WrongLength(usize),

    #[error("GSTIN character {position} ('{found}') does not fit the format")]
    BadFormat { position: usize, found: char },

    #[error("GSTIN state code {0} does not exist")]
    BadStateCode(String),

    #[error("GSTIN checksum mismatch: expected '{expected}', found '{found}'")]
    BadChecksum { expected: char, found: char },
}

fn charset_value(c: u8) -> Option<u32> {
    GSTIN_CHARSET.iter().position(|&x| x == c).map(|p| p as u32)
}

/// Mod-36 check character over the first 14 characters
fn checksum_char(body: &[u8]) -> Option<char> {
    let mut sum = 0u32;
    for (i, &c) in body.iter().take(14).enumerate() {
        let factor = if i % 2 == 0 { 1 } else { 2 };
        let product = charset_value(c)? * factor;
        sum += product / 36 + product % 36;
    }
    let check = (36 - sum % 36) % 36;
    Some(GSTIN_CHARSET[check as usize] as char)
}

/// Structure: 2-digit state, 10-char PAN, entity number, 'Z', check character
pub fn validate_gstin(gstin: &str) -> std::result::Result<(), GstinError> {
    let bytes = gstin.as_bytes();
    if bytes.len() != 15 || !gstin.is_ascii() {
        return Err(GstinError::WrongLength(gstin.chars().count()));
    }

    for (position, &b) in bytes.iter().enumerate() {
        let ok = match position {
            0..=1 | 7..=10 => b.is_ascii_digit(),
            2..=6 | 11 => b.is_ascii_uppercase(),
            12 => (b'1'..=b'9').contains(&b) || b.is_ascii_uppercase(),
            13 => b == b'Z',
            _ => b.is_ascii_digit() || b.is_ascii_uppercase(),
        };
        if !ok {
            return Err(GstinError::BadFormat {
                position: position + 1,
                found: b as char,
            });
        }
    }

    let state = &gstin[..2];
    let state_ok = matches!(state.parse::<u32>(), Ok(1..=38) | Ok(97) | Ok(99));
    if !state_ok {
        return Err(GstinError::BadStateCode(state.to_string()));
    }

    let found = bytes[14] as char;
    match checksum_char(bytes) {
        Some(expected) if expected == found => Ok(()),
        Some(expected) => Err(GstinError::BadChecksum { expected, found }),
        None => Err(GstinError::BadFormat {
            position: 15,
            found,
        }),
    }
}

pub fn is_registered(gstin: Option<&str>) -> bool {
    gstin.map(|g| validate_gstin(g).is_ok()).unwrap_or(false)
}

/// Default GST rate used to estimate embedded tax when the row carries none
pub const DEFAULT_GST_RATE: f64 = 18.0;

/// GST contained in a tax-inclusive amount: amount × r / (100 + r)
pub fn embedded_tax(amount: f64) -> f64 {
    crate::normalization::round_paise(amount * DEFAULT_GST_RATE / (100.0 + DEFAULT_GST_RATE))
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// ITC ELIGIBILITY
// ============================================================================

/// Categories that are not taxable inward supplies at all
const NON_SUPPLY_CATEGORIES: &[&str] = &["Salary & Wages", "Interest Expense", "Drawings"];

/// applicable = input tax credit may be claimed
pub struct ItcEligibilityRule {
    blocked_keywords: Vec<String>,
}

impl ItcEligibilityRule {
    pub fn new() -> Self {
        ItcEligibilityRule {
            blocked_keywords: words(&[
                "food", "beverage", "beverages", "outdoor catering", "catering", "restaurant",
                "beauty treatment", "health services", "cosmetic", "plastic surgery",
                "membership", "club", "health club", "fitness",
            ]),
        }
    }
}

impl Default for ItcEligibilityRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceRule for ItcEligibilityRule {
    fn id(&self) -> &str {
        "gst.itc_eligibility"
    }

    fn section_reference(&self) -> &str {
        "CGST Act, 2017 §16"
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        ctx.transaction.is_debit()
            && !NON_SUPPLY_CATEGORIES
                .iter()
                .any(|c| c.eq_ignore_ascii_case(ctx.category()))
    }

    fn not_applicable_reason(&self) -> String {
        "no taxable inward supply (receipt, salary, interest or drawings)".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        let tx = ctx.transaction;

        if let Some(keyword) = find_keyword(&ctx.text(), &self.blocked_keywords) {
            return Ok(RuleOutcome::not_applicable(format!(
                "ITC blocked credit: '{}' falls under §17(5)",
                keyword
            ))
            .citing("CGST Act, 2017 §17(5)"));
        }

        let gstin = tx.gstin.as_deref();
        if let Err(reason) = gstin.map(validate_gstin).unwrap_or(Err(GstinError::WrongLength(0))) {
            let detail = if gstin.is_none() {
                "vendor GSTIN missing".to_string()
            } else {
                reason.to_string()
            };
            return Ok(RuleOutcome::not_applicable(format!(
                "ITC cannot be claimed without a valid supplier GSTIN: {}",
                detail
            ))
            .citing("CGST Act, 2017 §16(2)(b)"));
        }

        let tax = tx.tax_amount.unwrap_or_else(|| embedded_tax(tx.amount));
        Ok(RuleOutcome::applicable(format!(
            "ITC claimable on purchase from registered supplier; tax ₹{:.2}{}",
            tax,
            if tx.tax_amount.is_some() { "" } else { " (estimated at 18%)" }
        )))
    }
}

// ============================================================================
// REVERSE CHARGE
// ============================================================================

/// applicable = recipient must pay GST under reverse charge
pub struct ReverseChargeRule {
    service_keywords: Vec<String>,
}

impl ReverseChargeRule {
    pub fn new() -> Self {
        ReverseChargeRule {
            service_keywords: words(&[
                "legal", "advocate", "chartered accountant", "company secretary", "cost accountant",
                "architect", "interior decorator", "technical testing", "security", "manpower",
                "contract labour", "labour", "goods transport", "gta",
            ]),
        }
    }
}

impl Default for ReverseChargeRule {
    fn default() -> Self {
        Self::new()
    }
}

impl ComplianceRule for ReverseChargeRule {
    fn id(&self) -> &str {
        "gst.reverse_charge"
    }

    fn section_reference(&self) -> &str {
        "CGST Act, 2017 §9(3)"
    }

    fn applies(&self, ctx: &EvaluationContext) -> bool {
        ctx.transaction.is_debit() && !is_registered(ctx.transaction.gstin.as_deref())
    }

    fn not_applicable_reason(&self) -> String {
        "supplier is GST-registered or transaction is a receipt".to_string()
    }

    fn evaluate(&self, ctx: &EvaluationContext) -> Result<RuleOutcome> {
        Ok(match find_keyword(&ctx.text(), &self.service_keywords) {
            Some(keyword) => RuleOutcome::applicable(format!(
                "'{}' service from an unregistered supplier: recipient pays GST under reverse charge",
                keyword
            )),
            None => RuleOutcome::not_applicable("no notified reverse-charge service"),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::testing::classified;

    const VALID: &str = "27AAPFU0939F1ZV";

    fn ctx_eval(rule: &dyn ComplianceRule, description: &str, gstin: Option<&str>, category: &str) -> Option<RuleOutcome> {
        let (tx, classification) = classified(description, "11800", None, gstin, category);
        let ctx = EvaluationContext {
            transaction: &tx,
            classification: &classification,
            prior_payments: &[],
        };
        if rule.applies(&ctx) {
            Some(rule.evaluate(&ctx).unwrap())
        } else {
            None
        }
    }

    #[test]
    fn test_gstin_validation() {
        assert_eq!(validate_gstin(VALID), Ok(()));
        assert_eq!(validate_gstin("29AABCU9603R1ZJ"), Ok(()));
        assert_eq!(validate_gstin("27AAPFU0939F1Z"), Err(GstinError::WrongLength(14)));
        assert!(matches!(
            validate_gstin("27AAPFU0939F1ZX"),
            Err(GstinError::BadChecksum { expected: 'V', found: 'X' })
        ));
        assert!(matches!(
            validate_gstin("27aapfu0939f1zv"),
            Err(GstinError::BadFormat { position: 3, .. })
        ));
        assert!(matches!(
            validate_gstin("00AAPFU0939F1ZV"),
            Err(GstinError::BadStateCode(_))
        ));
    }

    #[test]
    fn test_embedded_tax() {
        assert_eq!(embedded_tax(11_800.0), 1_800.0);
    }

    #[test]
    fn test_itc_eligible_with_valid_gstin() {
        let outcome = ctx_eval(&ItcEligibilityRule::new(), "Raw material purchase", Some(VALID), "Purchase of Goods").unwrap();
        assert!(outcome.applicable);
        assert!(outcome.reason.contains("1800.00"));
        assert_eq!(outcome.section_reference, None);
    }

    #[test]
    fn test_itc_blocked_by_17_5() {
        let outcome = ctx_eval(&ItcEligibilityRule::new(), "Team lunch", Some(VALID), "Food & Beverages").unwrap();
        assert!(!outcome.applicable);
        assert_eq!(outcome.section_reference.as_deref(), Some("CGST Act, 2017 §17(5)"));
    }

    #[test]
    fn test_itc_requires_gstin() {
        let outcome = ctx_eval(&ItcEligibilityRule::new(), "Raw material purchase", None, "Purchase of Goods").unwrap();
        assert!(!outcome.applicable);
        assert_eq!(outcome.section_reference.as_deref(), Some("CGST Act, 2017 §16(2)(b)"));
    }

    #[test]
    fn test_itc_not_for_salary() {
        assert!(ctx_eval(&ItcEligibilityRule::new(), "June salary", Some(VALID), "Salary & Wages").is_none());
    }

    #[test]
    fn test_reverse_charge_for_unregistered_legal_service() {
        let rule = ReverseChargeRule::new();
        let outcome = ctx_eval(&rule, "Legal opinion on lease", None, "Professional Fees").unwrap();
        assert!(outcome.applicable);

        let outcome = ctx_eval(&rule, "Printer paper", None, "Office Supplies").unwrap();
        assert!(!outcome.applicable);

        assert!(ctx_eval(&rule, "Legal opinion", Some(VALID), "Professional Fees").is_none());
    }
}
