// 📄 Extraction Adapter - raw row candidates from source documents
//
// OCR and PDF extraction live outside this crate. Anything that can turn a
// document into best-effort text rows implements `ExtractionAdapter`; the
// bundled CSV adapter handles statements that are already tabular.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// ============================================================================
// RAW ROW
// ============================================================================

/// Best-effort text extracted from one line item. Nothing here is trusted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub document_id: String,
    pub date_text: String,
    pub description_text: String,
    pub amount_text: String,

    #[serde(default)]
    pub type_hint: Option<String>,
    #[serde(default)]
    pub vendor_text: Option<String>,
    #[serde(default)]
    pub gstin_text: Option<String>,
    #[serde(default)]
    pub mode_hint: Option<String>,
    #[serde(default)]
    pub tax_text: Option<String>,
    #[serde(default)]
    pub invoice_text: Option<String>,
    #[serde(default)]
    pub tds_text: Option<String>,

    /// 1-based line in the source document (provenance only)
    #[serde(default)]
    pub line_number: usize,
}

impl RawRow {
    pub fn new(document_id: &str, date: &str, description: &str, amount: &str) -> Self {
        RawRow {
            document_id: document_id.to_string(),
            date_text: date.to_string(),
            description_text: description.to_string(),
            amount_text: amount.to_string(),
            ..Default::default()
        }
    }

    pub fn with_type_hint(mut self, hint: &str) -> Self {
        self.type_hint = Some(hint.to_string());
        self
    }

    pub fn with_vendor(mut self, vendor: &str) -> Self {
        self.vendor_text = Some(vendor.to_string());
        self
    }

    pub fn with_gstin(mut self, gstin: &str) -> Self {
        self.gstin_text = Some(gstin.to_string());
        self
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode_hint = Some(mode.to_string());
        self
    }

    pub fn with_tax(mut self, tax: &str) -> Self {
        self.tax_text = Some(tax.to_string());
        self
    }

    pub fn with_invoice(mut self, invoice: &str) -> Self {
        self.invoice_text = Some(invoice.to_string());
        self
    }

    pub fn with_tds(mut self, tds: &str) -> Self {
        self.tds_text = Some(tds.to_string());
        self
    }
}

/// A document handed to an adapter
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub document_id: String,
    pub content: Vec<u8>,
}

impl SourceDocument {
    pub fn from_path<P: AsRef<Path>>(document_id: &str, path: P) -> Result<Self> {
        Ok(SourceDocument {
            document_id: document_id.to_string(),
            content: fs::read(path.as_ref())?,
        })
    }

    pub fn from_text(document_id: &str, text: &str) -> Self {
        SourceDocument {
            document_id: document_id.to_string(),
            content: text.as_bytes().to_vec(),
        }
    }
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

pub trait ExtractionAdapter: Send + Sync {
    /// Turn a document into raw row candidates, in document order
    fn extract(&self, document: &SourceDocument) -> Result<Vec<RawRow>>;

    /// Adapter name (for provenance in logs)
    fn name(&self) -> &str;
}

// ============================================================================
// CSV ADAPTER
// ============================================================================

/// Header aliases seen on Indian bank statements and purchase registers
const DATE_HEADERS: &[&str] = &["date", "txn date", "transaction date", "value date"];
const DESCRIPTION_HEADERS: &[&str] = &["description", "narration", "particulars", "details"];
const AMOUNT_HEADERS: &[&str] = &["amount", "amount (inr)", "value"];
const TYPE_HEADERS: &[&str] = &["type", "dr/cr", "cr/dr", "direction"];
const VENDOR_HEADERS: &[&str] = &["vendor", "party", "party name", "payee"];
const GSTIN_HEADERS: &[&str] = &["gstin", "vendor gstin", "gst number"];
const MODE_HEADERS: &[&str] = &["mode", "payment mode", "payment_mode"];
const TAX_HEADERS: &[&str] = &["tax", "gst", "gst amount", "tax amount"];
const INVOICE_HEADERS: &[&str] = &["invoice", "invoice no", "invoice number", "bill no", "voucher no"];
const TDS_HEADERS: &[&str] = &["tds", "tds amount", "tds deducted"];

/// Separate debit/credit columns are folded into a signed amount text
const DEBIT_HEADERS: &[&str] = &["debit", "withdrawal", "withdrawal amt"];
const CREDIT_HEADERS: &[&str] = &["credit", "deposit", "deposit amt"];

#[derive(Debug, Default)]
pub struct CsvExtractionAdapter;

impl CsvExtractionAdapter {
    pub fn new() -> Self {
        CsvExtractionAdapter
    }
}

struct HeaderIndex(HashMap<String, usize>);

impl HeaderIndex {
    fn position(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| self.0.get(*alias).copied())
    }
}

fn cell(record: &csv::StringRecord, index: Option<usize>) -> Option<String> {
    index
        .and_then(|i| record.get(i))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ExtractionAdapter for CsvExtractionAdapter {
    fn extract(&self, document: &SourceDocument) -> Result<Vec<RawRow>> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(document.content.as_slice());

        let headers = HeaderIndex(
            reader
                .headers()?
                .iter()
                .enumerate()
                .map(|(i, h)| (h.trim().to_lowercase(), i))
                .collect(),
        );

        let date_col = headers.position(DATE_HEADERS);
        let desc_col = headers.position(DESCRIPTION_HEADERS);
        let amount_col = headers.position(AMOUNT_HEADERS);
        let debit_col = headers.position(DEBIT_HEADERS);
        let credit_col = headers.position(CREDIT_HEADERS);
        let type_col = headers.position(TYPE_HEADERS);
        let vendor_col = headers.position(VENDOR_HEADERS);
        let gstin_col = headers.position(GSTIN_HEADERS);
        let mode_col = headers.position(MODE_HEADERS);
        let tax_col = headers.position(TAX_HEADERS);
        let invoice_col = headers.position(INVOICE_HEADERS);
        let tds_col = headers.position(TDS_HEADERS);

        let mut rows = Vec::new();

        for (line_num, record) in reader.records().enumerate() {
            let record = record?;

            // Debit/credit column pairs: whichever side is filled decides the hint
            let (amount_text, split_hint) = match cell(&record, amount_col) {
                Some(amount) => (amount, None),
                None => match (cell(&record, debit_col), cell(&record, credit_col)) {
                    (Some(debit), _) => (debit, Some("debit".to_string())),
                    (None, Some(credit)) => (credit, Some("credit".to_string())),
                    (None, None) => (String::new(), None),
                },
            };

            rows.push(RawRow {
                document_id: document.document_id.clone(),
                date_text: cell(&record, date_col).unwrap_or_default(),
                description_text: cell(&record, desc_col).unwrap_or_default(),
                amount_text,
                type_hint: cell(&record, type_col).or(split_hint),
                vendor_text: cell(&record, vendor_col),
                gstin_text: cell(&record, gstin_col),
                mode_hint: cell(&record, mode_col),
                tax_text: cell(&record, tax_col),
                invoice_text: cell(&record, invoice_col),
                tds_text: cell(&record, tds_col),
                // +2: header line plus 1-based numbering
                line_number: line_num + 2,
            });
        }

        Ok(rows)
    }

    fn name(&self) -> &str {
        "csv"
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_with_amount_column() {
        let doc = SourceDocument::from_text(
            "doc-1",
            "Date,Narration,Amount,Type,Vendor,GSTIN,Mode\n\
             01/04/2024,Office Rent April,\"50,000.00\",Debit,XYZ Landlords,,cash\n",
        );

        let rows = CsvExtractionAdapter::new().extract(&doc).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].document_id, "doc-1");
        assert_eq!(rows[0].description_text, "Office Rent April");
        assert_eq!(rows[0].amount_text, "50,000.00");
        assert_eq!(rows[0].type_hint.as_deref(), Some("Debit"));
        assert_eq!(rows[0].vendor_text.as_deref(), Some("XYZ Landlords"));
        assert_eq!(rows[0].gstin_text, None);
        assert_eq!(rows[0].mode_hint.as_deref(), Some("cash"));
        assert_eq!(rows[0].line_number, 2);
    }

    #[test]
    fn test_csv_with_split_debit_credit_columns() {
        let doc = SourceDocument::from_text(
            "doc-2",
            "Txn Date,Particulars,Withdrawal,Deposit\n\
             02/04/2024,NEFT-HDFC0001-ACME,1200.00,\n\
             03/04/2024,Sales receipt,,8000.00\n",
        );

        let rows = CsvExtractionAdapter::new().extract(&doc).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].amount_text, "1200.00");
        assert_eq!(rows[0].type_hint.as_deref(), Some("debit"));
        assert_eq!(rows[1].amount_text, "8000.00");
        assert_eq!(rows[1].type_hint.as_deref(), Some("credit"));
    }

    #[test]
    fn test_csv_invoice_and_tds_columns() {
        let doc = SourceDocument::from_text(
            "doc-4",
            "Date,Particulars,Amount,Bill No,TDS\n\
             05/04/2024,Contractor bill,45000,INV-2024-117,450\n\
             06/04/2024,Tea and snacks,300,,\n",
        );

        let rows = CsvExtractionAdapter::new().extract(&doc).unwrap();
        assert_eq!(rows[0].invoice_text.as_deref(), Some("INV-2024-117"));
        assert_eq!(rows[0].tds_text.as_deref(), Some("450"));
        assert_eq!(rows[1].invoice_text, None);
        assert_eq!(rows[1].tds_text, None);
    }

    #[test]
    fn test_missing_cells_become_empty_text() {
        let doc = SourceDocument::from_text("doc-3", "Date,Description,Amount\n,,\n");
        let rows = CsvExtractionAdapter::new().extract(&doc).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].date_text.is_empty());
        assert!(rows[0].amount_text.is_empty());
    }
}
