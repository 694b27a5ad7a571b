// 💾 SQLite persistence for the ledger store
//
// Rows are append-only: every entity is written with INSERT OR IGNORE, and
// the only UPDATEs touch the pointer fields (superseded_by, resolution).

use crate::model::{
    Applicability, AuditAction, AuditEntry, ClassificationResult, ComplianceFinding, Direction,
    FindingRecord, FlagType, Origin, PaymentMode, RedFlag, RetirementRecord, ReviewMark, Severity,
    SubjectType, Tier, Transaction,
};
use crate::store::{LedgerSnapshot, LedgerStore};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Transactions (immutable facts)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            sheet_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            amount REAL NOT NULL,
            direction TEXT NOT NULL,
            vendor TEXT NOT NULL,
            gstin TEXT,
            payment_mode TEXT,
            tax_amount REAL,
            invoice_number TEXT,
            tds_deducted REAL,
            dedup_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (client_id, sheet_id, dedup_key)
        )",
        [],
    )?;

    // ==========================================================================
    // Classification versions
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS classifications (
            transaction_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            ledger_category TEXT NOT NULL,
            confidence REAL NOT NULL,
            tier TEXT NOT NULL,
            rationale TEXT NOT NULL,
            law_references TEXT NOT NULL,
            needs_review INTEGER NOT NULL,
            rule_table_version TEXT NOT NULL,
            degradations TEXT NOT NULL,
            created_by TEXT NOT NULL,
            created_at TEXT NOT NULL,
            superseded_by INTEGER,
            PRIMARY KEY (transaction_id, version)
        )",
        [],
    )?;

    // ==========================================================================
    // Compliance findings (versioned per transaction + rule)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS findings (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            rule_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            classification_version INTEGER NOT NULL,
            applicable TEXT NOT NULL,
            section_reference TEXT NOT NULL,
            reason TEXT NOT NULL,
            rule_table_version TEXT NOT NULL,
            origin TEXT NOT NULL,
            superseded_by TEXT,
            recorded_at TEXT NOT NULL,
            UNIQUE (transaction_id, rule_id, version)
        )",
        [],
    )?;

    // ==========================================================================
    // Red flags
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS red_flags (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL,
            flag_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            detector TEXT NOT NULL,
            subject_key TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            resolution_note TEXT,
            resolved_by TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Audit trail
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_entries (
            id TEXT PRIMARY KEY,
            subject_type TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            previous_version INTEGER,
            new_version INTEGER,
            reason TEXT,
            timestamp TEXT NOT NULL,
            data TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Review marks & retirements
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS review_marks (
            transaction_id TEXT NOT NULL,
            stage TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (transaction_id, stage, created_at)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS retirements (
            transaction_id TEXT PRIMARY KEY,
            actor TEXT NOT NULL,
            reason TEXT NOT NULL,
            retired_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_client ON transactions(client_id, sheet_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_findings_tx ON findings(transaction_id, rule_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_flags_tx ON red_flags(transaction_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_entries(subject_type, subject_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// SAVE
// ============================================================================

/// Write everything the store holds. Rows already present are left as they
/// are apart from their pointer fields. Returns the number of new rows.
pub fn save_store(conn: &mut Connection, store: &LedgerStore) -> Result<usize> {
    let snapshot = store.snapshot();
    let db = conn.transaction()?;
    let mut inserted = 0;

    for tx in &snapshot.transactions {
        inserted += db.execute(
            "INSERT OR IGNORE INTO transactions (
                id, client_id, sheet_id, document_id, sequence, date, description, amount,
                direction, vendor, gstin, payment_mode, tax_amount, invoice_number, tds_deducted,
                dedup_key, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                tx.id,
                tx.client_id,
                tx.sheet_id,
                tx.document_id,
                tx.sequence as i64,
                tx.date.format(DATE_FORMAT).to_string(),
                tx.description,
                tx.amount,
                tx.direction.as_str(),
                tx.vendor,
                tx.gstin,
                tx.payment_mode.map(|m| m.as_str()),
                tx.tax_amount,
                tx.invoice_number,
                tx.tds_deducted,
                tx.dedup_key,
                tx.created_at.to_rfc3339(),
            ],
        )?;
    }

    for c in &snapshot.classifications {
        inserted += db.execute(
            "INSERT OR IGNORE INTO classifications (
                transaction_id, version, ledger_category, confidence, tier, rationale,
                law_references, needs_review, rule_table_version, degradations,
                created_by, created_at, superseded_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                c.transaction_id,
                c.version,
                c.ledger_category,
                c.confidence,
                c.tier.as_str(),
                c.rationale,
                serde_json::to_string(&c.law_references)?,
                c.needs_review,
                c.rule_table_version,
                serde_json::to_string(&c.degradations)?,
                c.created_by,
                c.created_at.to_rfc3339(),
                c.superseded_by,
            ],
        )?;

        if let Some(next) = c.superseded_by {
            db.execute(
                "UPDATE classifications SET superseded_by = ?1
                 WHERE transaction_id = ?2 AND version = ?3 AND superseded_by IS NULL",
                params![next, c.transaction_id, c.version],
            )?;
        }
    }

    for r in &snapshot.findings {
        let f = &r.finding;
        inserted += db.execute(
            "INSERT OR IGNORE INTO findings (
                id, transaction_id, rule_id, version, classification_version, applicable,
                section_reference, reason, rule_table_version, origin, superseded_by, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                r.id,
                f.transaction_id,
                f.rule_id,
                r.version,
                f.classification_version,
                f.applicable.as_str(),
                f.section_reference,
                f.reason,
                f.rule_table_version,
                f.origin.as_str(),
                r.superseded_by,
                r.recorded_at.to_rfc3339(),
            ],
        )?;

        if let Some(next) = &r.superseded_by {
            db.execute(
                "UPDATE findings SET superseded_by = ?1 WHERE id = ?2 AND superseded_by IS NULL",
                params![next, r.id],
            )?;
        }
    }

    for flag in &snapshot.flags {
        inserted += db.execute(
            "INSERT OR IGNORE INTO red_flags (
                id, transaction_id, flag_type, severity, message, detector, subject_key,
                created_at, resolved, resolution_note, resolved_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                flag.id,
                flag.transaction_id,
                flag.flag_type.as_str(),
                flag.severity.as_str(),
                flag.message,
                flag.detector,
                flag.subject_key,
                flag.created_at.to_rfc3339(),
                flag.resolved,
                flag.resolution_note,
                flag.resolved_by,
            ],
        )?;

        if flag.resolved {
            db.execute(
                "UPDATE red_flags SET resolved = 1, resolution_note = ?1, resolved_by = ?2
                 WHERE id = ?3 AND resolved = 0",
                params![flag.resolution_note, flag.resolved_by, flag.id],
            )?;
        }
    }

    for entry in &snapshot.audit {
        inserted += db.execute(
            "INSERT OR IGNORE INTO audit_entries (
                id, subject_type, subject_id, actor, action, previous_version, new_version,
                reason, timestamp, data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id,
                entry.subject_type.as_str(),
                entry.subject_id,
                entry.actor,
                entry.action.as_str(),
                entry.previous_version,
                entry.new_version,
                entry.reason,
                entry.timestamp.to_rfc3339(),
                serde_json::to_string(&entry.data)?,
            ],
        )?;
    }

    for mark in &snapshot.review_marks {
        inserted += db.execute(
            "INSERT OR IGNORE INTO review_marks (transaction_id, stage, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![mark.transaction_id, mark.stage, mark.reason, mark.created_at.to_rfc3339()],
        )?;
    }

    for r in &snapshot.retirements {
        inserted += db.execute(
            "INSERT OR IGNORE INTO retirements (transaction_id, actor, reason, retired_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![r.transaction_id, r.actor, r.reason, r.retired_at.to_rfc3339()],
        )?;
    }

    db.commit().context("Failed to commit ledger snapshot")?;
    Ok(inserted)
}

// ============================================================================
// LOAD
// ============================================================================

pub fn load_store(conn: &Connection) -> Result<LedgerStore> {
    let snapshot = LedgerSnapshot {
        transactions: load_transactions(conn)?,
        classifications: query_all(
            conn,
            "SELECT transaction_id, version, ledger_category, confidence, tier, rationale,
                    law_references, needs_review, rule_table_version, degradations,
                    created_by, created_at, superseded_by
             FROM classifications ORDER BY rowid",
            classification_from_row,
        )
        .context("Failed to load classifications")?,
        findings: query_all(
            conn,
            "SELECT id, transaction_id, rule_id, version, classification_version, applicable,
                    section_reference, reason, rule_table_version, origin, superseded_by, recorded_at
             FROM findings ORDER BY rowid",
            finding_from_row,
        )
        .context("Failed to load findings")?,
        flags: query_all(
            conn,
            "SELECT id, transaction_id, flag_type, severity, message, detector, subject_key,
                    created_at, resolved, resolution_note, resolved_by
             FROM red_flags ORDER BY rowid",
            flag_from_row,
        )
        .context("Failed to load red flags")?,
        audit: query_all(
            conn,
            "SELECT id, subject_type, subject_id, actor, action, previous_version, new_version,
                    reason, timestamp, data
             FROM audit_entries ORDER BY rowid",
            audit_from_row,
        )
        .context("Failed to load audit trail")?,
        review_marks: query_all(
            conn,
            "SELECT transaction_id, stage, reason, created_at FROM review_marks ORDER BY rowid",
            |row| {
                Ok(ReviewMark {
                    transaction_id: row.get(0)?,
                    stage: row.get(1)?,
                    reason: row.get(2)?,
                    created_at: time_column(row, 3)?,
                })
            },
        )?,
        retirements: query_all(
            conn,
            "SELECT transaction_id, actor, reason, retired_at FROM retirements ORDER BY rowid",
            |row| {
                Ok(RetirementRecord {
                    transaction_id: row.get(0)?,
                    actor: row.get(1)?,
                    reason: row.get(2)?,
                    retired_at: time_column(row, 3)?,
                })
            },
        )?,
    };

    Ok(LedgerStore::from_snapshot(snapshot))
}

fn load_transactions(conn: &Connection) -> Result<Vec<Transaction>> {
    query_all(
        conn,
        "SELECT id, client_id, sheet_id, document_id, sequence, date, description, amount,
                direction, vendor, gstin, payment_mode, tax_amount, invoice_number, tds_deducted,
                dedup_key, created_at
         FROM transactions ORDER BY sequence",
        |row| {
            let sequence: i64 = row.get(4)?;
            let date: String = row.get(5)?;
            let payment_mode: Option<String> = row.get(11)?;

            Ok(Transaction {
                id: row.get(0)?,
                client_id: row.get(1)?,
                sheet_id: row.get(2)?,
                document_id: row.get(3)?,
                sequence: sequence as u64,
                date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
                    .map_err(|e| conversion_error(5, e.to_string()))?,
                description: row.get(6)?,
                amount: row.get(7)?,
                direction: enum_column(row, 8, Direction::parse)?,
                vendor: row.get(9)?,
                gstin: row.get(10)?,
                payment_mode: payment_mode.as_deref().and_then(PaymentMode::parse),
                tax_amount: row.get(12)?,
                invoice_number: row.get(13)?,
                tds_deducted: row.get(14)?,
                dedup_key: row.get(15)?,
                created_at: time_column(row, 16)?,
            })
        },
    )
    .context("Failed to load transactions")
}

fn classification_from_row(row: &Row) -> rusqlite::Result<ClassificationResult> {
    Ok(ClassificationResult {
        transaction_id: row.get(0)?,
        version: row.get(1)?,
        ledger_category: row.get(2)?,
        confidence: row.get(3)?,
        tier: enum_column(row, 4, Tier::parse)?,
        rationale: row.get(5)?,
        law_references: json_column(row, 6)?,
        needs_review: row.get(7)?,
        rule_table_version: row.get(8)?,
        degradations: json_column(row, 9)?,
        created_by: row.get(10)?,
        created_at: time_column(row, 11)?,
        superseded_by: row.get(12)?,
    })
}

fn finding_from_row(row: &Row) -> rusqlite::Result<FindingRecord> {
    Ok(FindingRecord {
        id: row.get(0)?,
        version: row.get(3)?,
        finding: ComplianceFinding {
            transaction_id: row.get(1)?,
            rule_id: row.get(2)?,
            classification_version: row.get(4)?,
            applicable: enum_column(row, 5, Applicability::parse)?,
            section_reference: row.get(6)?,
            reason: row.get(7)?,
            rule_table_version: row.get(8)?,
            origin: enum_column(row, 9, Origin::parse)?,
        },
        superseded_by: row.get(10)?,
        recorded_at: time_column(row, 11)?,
    })
}

fn flag_from_row(row: &Row) -> rusqlite::Result<RedFlag> {
    let message: String = row.get(4)?;
    let subject_key: String = row.get(6)?;

    Ok(RedFlag {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        flag_type: enum_column(row, 2, FlagType::parse)?,
        severity: enum_column(row, 3, Severity::parse)?,
        detector: row.get(5)?,
        // Rows written before subject keys existed keyed on the message
        subject_key: if subject_key.is_empty() { message.clone() } else { subject_key },
        message,
        created_at: time_column(row, 7)?,
        resolved: row.get(8)?,
        resolution_note: row.get(9)?,
        resolved_by: row.get(10)?,
    })
}

fn audit_from_row(row: &Row) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        subject_type: enum_column(row, 1, SubjectType::parse)?,
        subject_id: row.get(2)?,
        actor: row.get(3)?,
        action: enum_column(row, 4, AuditAction::parse)?,
        previous_version: row.get(5)?,
        new_version: row.get(6)?,
        reason: row.get(7)?,
        timestamp: time_column(row, 8)?,
        data: json_column(row, 9)?,
    })
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

fn query_all<T>(
    conn: &Connection,
    sql: &str,
    map: impl FnMut(&Row) -> rusqlite::Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn enum_column<T>(row: &Row, index: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let value: String = row.get(index)?;
    parse(&value).ok_or_else(|| conversion_error(index, format!("unexpected value '{}'", value)))
}

fn time_column(row: &Row, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(index, e.to_string()))
}

fn json_column<T: DeserializeOwned>(row: &Row, index: usize) -> rusqlite::Result<T> {
    let value: String = row.get(index)?;
    serde_json::from_str(&value).map_err(|e| conversion_error(index, e.to_string()))
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(count)
}
