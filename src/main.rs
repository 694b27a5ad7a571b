// 🦅 Eagle Ledger CLI
//
// Every command loads the ledger from SQLite, runs against an in-memory
// pipeline, and writes new rows back before exiting.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eagle_ledger::{
    load_store, open_database, save_store, Applicability, Collaborators, CsvExtractionAdapter,
    OverrideRequest, OverrideResult, OverrideSubject, Pipeline, PipelineConfig, RuleTable,
    SourceDocument, StaticReconciliationFeed, TransactionView,
};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eagle-ledger", version, about = "Ledger ingestion, classification and compliance review")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, env = "EAGLE_LEDGER_DB", default_value = "ledger.db")]
    db: PathBuf,

    /// Pipeline config (TOML); falls back to EAGLE_LEDGER_CONFIG, then defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Rule table (JSON); overrides rules_path from the config
    #[arg(long, global = true)]
    rules: Option<PathBuf>,

    /// GST reconciliation records (JSON array) for the mismatch detector
    #[arg(long, global = true)]
    reconciliation: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a CSV document into a client's sheet and run the pipeline
    Ingest {
        #[arg(long)]
        client: String,
        #[arg(long)]
        sheet: String,
        #[arg(long)]
        csv: PathBuf,
        /// Document id (defaults to the file name)
        #[arg(long)]
        document: Option<String>,
    },

    /// List a client's transactions with classification, findings and flags
    Show {
        #[arg(long)]
        client: String,
        #[arg(long)]
        json: bool,
    },

    /// Replace the active classification of a transaction
    OverrideClassification {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        expected_version: u32,
        #[arg(long)]
        category: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: String,
    },

    /// Replace the active finding of one compliance rule
    OverrideFinding {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        rule: String,
        #[arg(long)]
        expected_version: u32,
        /// applicable | not_applicable | unknown
        #[arg(long)]
        applicable: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: String,
    },

    /// Resolve a red flag with a note
    ResolveFlag {
        #[arg(long)]
        flag: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        note: String,
        #[arg(long, default_value = "resolved by reviewer")]
        reason: String,
    },

    /// Recompute findings and red flags from the active classification
    Reevaluate {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        actor: String,
    },

    /// Re-run the classification cascade (reviewer-confirmed results are kept)
    Reclassify {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        actor: String,
    },

    /// Soft-retire a transaction
    Retire {
        #[arg(long)]
        transaction: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: String,
    },

    /// Classification versions and audit trail of a transaction
    History {
        #[arg(long)]
        transaction: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eagle_ledger=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (mut conn, pipeline) = open_pipeline(&cli)?;

    match cli.command {
        Command::Ingest {
            client,
            sheet,
            csv,
            document,
        } => run_ingest(&pipeline, &client, &sheet, &csv, document).await?,
        Command::Show { client, json } => run_show(&pipeline, &client, json)?,
        Command::OverrideClassification {
            transaction,
            expected_version,
            category,
            actor,
            reason,
        } => run_override(
            &pipeline,
            OverrideRequest {
                subject: OverrideSubject::Classification {
                    transaction_id: transaction,
                    expected_version,
                    category,
                },
                actor,
                reason,
            },
        )?,
        Command::OverrideFinding {
            transaction,
            rule,
            expected_version,
            applicable,
            actor,
            reason,
        } => {
            let Some(applicable) = Applicability::parse(&applicable) else {
                bail!("--applicable must be applicable, not_applicable or unknown");
            };
            run_override(
                &pipeline,
                OverrideRequest {
                    subject: OverrideSubject::ComplianceFinding {
                        transaction_id: transaction,
                        rule_id: rule,
                        expected_version,
                        applicable,
                    },
                    actor,
                    reason,
                },
            )?
        }
        Command::ResolveFlag {
            flag,
            actor,
            note,
            reason,
        } => run_override(
            &pipeline,
            OverrideRequest {
                subject: OverrideSubject::RedFlagResolution { flag_id: flag, note },
                actor,
                reason,
            },
        )?,
        Command::Reevaluate { transaction, actor } => {
            let outcome = pipeline.reevaluate(&transaction, &actor)?;
            println!("🔁 Re-evaluated {}", outcome.transaction_id);
            println!("✓ {} findings recorded", outcome.findings.len());
            println!("✓ {} new red flags", outcome.new_flags.len());
        }
        Command::Reclassify { transaction, actor } => {
            match pipeline.reclassify(&transaction, &actor).await? {
                Some(c) => println!(
                    "🔁 {} → {} (v{}, {} tier, confidence {:.2})",
                    transaction, c.ledger_category, c.version, c.tier, c.confidence
                ),
                None => println!("✓ {} is reviewer-confirmed, kept as is", transaction),
            }
        }
        Command::Retire {
            transaction,
            actor,
            reason,
        } => {
            let record = pipeline.retire(&transaction, &actor, &reason)?;
            println!("🗑️  Retired {} ({})", record.transaction_id, record.reason);
        }
        Command::History { transaction } => run_history(&pipeline, &transaction)?,
    }

    let written = save_store(&mut conn, pipeline.store())?;
    info!(rows = written, db = %cli.db.display(), "ledger saved");
    Ok(())
}

fn open_pipeline(cli: &Cli) -> Result<(Connection, Pipeline)> {
    let config = PipelineConfig::load(cli.config.as_deref())?;

    let rules = match cli.rules.as_ref().or(config.rules_path.as_ref()) {
        Some(path) => RuleTable::from_file(path)?,
        None => RuleTable::builtin(),
    };

    let conn = open_database(&cli.db)?;
    let store = load_store(&conn)?;
    info!(
        transactions = store.transaction_count(),
        rule_table = rules.version(),
        "ledger loaded"
    );

    let mut collaborators = Collaborators::offline_from_store(&store);
    if let Some(path) = &cli.reconciliation {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read reconciliation file {}", path.display()))?;
        collaborators =
            collaborators.with_reconciliation(Arc::new(StaticReconciliationFeed::from_json(&content)?));
    }

    Ok((conn, Pipeline::new(store, config, Arc::new(rules), collaborators)))
}

async fn run_ingest(
    pipeline: &Pipeline,
    client: &str,
    sheet: &str,
    csv_path: &Path,
    document: Option<String>,
) -> Result<()> {
    let document_id = match document {
        Some(id) => id,
        None => csv_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("CSV path has no file name")?,
    };

    println!("📂 Ingesting {} into {}/{}", csv_path.display(), client, sheet);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let source = SourceDocument::from_path(&document_id, csv_path)?;
    let report = pipeline
        .process_document(&CsvExtractionAdapter::new(), client, sheet, &source)
        .await?;

    println!("✓ Rows read:          {}", report.rows_total);
    println!("✓ New transactions:   {}", report.inserted.len());
    println!("✓ Already present:    {}", report.existing.len());
    println!("✓ Classified:         {}", report.classified);
    println!("✓ Findings recorded:  {}", report.findings_recorded);
    println!("✓ Red flags raised:   {}", report.flags_raised);

    if !report.rejected.is_empty() {
        println!("\n⚠️  Rejected rows:");
        for r in &report.rejected {
            println!("   line {}: {}", r.line_number, r.reason);
        }
    }
    if !report.failures.is_empty() {
        println!("\n❌ Failed tasks:");
        for f in &report.failures {
            println!("   {} [{}]: {}", f.transaction_id, f.stage, f.reason);
        }
    }
    if !report.needs_review.is_empty() {
        println!("\n🔍 {} transactions need manual review", report.needs_review.len());
    }
    if report.cancelled {
        println!("\n⏹️  Job {} was cancelled before completion", report.job_id);
    }

    Ok(())
}

fn run_show(pipeline: &Pipeline, client: &str, json: bool) -> Result<()> {
    let views = pipeline.store().client_view(client);

    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    println!("📊 {} transactions for {}", views.len(), client);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for view in &views {
        print_view(view);
    }
    Ok(())
}

fn print_view(view: &TransactionView) {
    let tx = &view.transaction;
    println!(
        "\n{} {} {} ₹{:.2} {} ({})",
        tx.id, tx.date, tx.direction, tx.amount, tx.description, tx.vendor
    );

    match &view.classification {
        Some(c) => println!(
            "   🏷️  {} v{} [{} {:.2}]{}",
            c.ledger_category,
            c.version,
            c.tier,
            c.confidence,
            if c.needs_review { " needs review" } else { "" }
        ),
        None => println!("   🏷️  unclassified"),
    }

    for record in view.findings.iter().filter(|r| r.finding.applicable != Applicability::NotApplicable) {
        println!(
            "   ⚖️  {} {} ({}): {}",
            record.finding.rule_id,
            record.finding.applicable.as_str(),
            record.finding.section_reference,
            record.finding.reason
        );
    }
    if view.findings_stale {
        println!("   ⚖️  findings are stale, run reevaluate");
    }

    for flag in &view.unresolved_flags {
        println!(
            "   🚩 {} [{}] {}: {}",
            flag.id,
            flag.severity.as_str(),
            flag.flag_type,
            flag.message
        );
    }
    if view.needs_manual_review {
        println!("   🔍 marked for manual review");
    }
}

fn run_override(pipeline: &Pipeline, request: OverrideRequest) -> Result<()> {
    let outcome = pipeline.apply_override(request)?;

    match &outcome.result {
        OverrideResult::Classification(c) => println!(
            "✅ {} reclassified as {} (v{})",
            outcome.transaction_id, c.ledger_category, c.version
        ),
        OverrideResult::ComplianceFinding(r) => println!(
            "✅ {} {} set to {} (v{})",
            outcome.transaction_id,
            r.finding.rule_id,
            r.finding.applicable.as_str(),
            r.version
        ),
        OverrideResult::RedFlag(f) => println!("✅ Flag {} resolved on {}", f.id, outcome.transaction_id),
    }
    println!("   audit entry {}", outcome.audit.id);
    Ok(())
}

fn run_history(pipeline: &Pipeline, tx_id: &str) -> Result<()> {
    let store = pipeline.store();
    let tx = store.require_transaction(tx_id)?;

    println!("📜 History of {} ({})", tx.id, tx.description);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    println!("\nClassifications:");
    for c in store.classification_history(tx_id) {
        println!(
            "   v{} {} [{} {:.2}] by {} at {}{}",
            c.version,
            c.ledger_category,
            c.tier,
            c.confidence,
            c.created_by,
            c.created_at.to_rfc3339(),
            match c.superseded_by {
                Some(next) => format!(" → superseded by v{}", next),
                None => " (active)".to_string(),
            }
        );
    }

    println!("\nAudit trail:");
    for entry in store.audit_for(tx_id) {
        println!(
            "   {} {} {} by {}{}",
            entry.timestamp.to_rfc3339(),
            entry.action.as_str(),
            entry.subject_id,
            entry.actor,
            entry.reason.map(|r| format!(": {}", r)).unwrap_or_default()
        );
    }
    Ok(())
}
