// Eagle Ledger - Web Server
// REST API with Axum over the shared pipeline

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use eagle_ledger::{
    load_store, open_database, save_store, AuditEntry, Collaborators, OverrideOutcome,
    OverrideRequest, Pipeline, PipelineConfig, PipelineError, RuleTable, StageOutcome,
    TransactionView,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "eagle-server", version, about = "Eagle Ledger review API")]
struct Args {
    #[arg(long, env = "EAGLE_LEDGER_DB", default_value = "ledger.db")]
    db: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, env = "EAGLE_LEDGER_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    db: Arc<Mutex<Connection>>,
}

impl AppState {
    /// Write whatever the last mutation appended
    fn persist(&self) -> Result<(), Response> {
        let mut conn = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        save_store(&mut conn, self.pipeline.store()).map_err(|e| {
            error!(error = %e, "failed to persist ledger");
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", e.to_string())
        })?;
        Ok(())
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Response {
        (
            StatusCode::OK,
            Json(Self {
                success: true,
                data: Some(data),
                error: None,
                error_kind: None,
            }),
        )
            .into_response()
    }

    fn failure(status: StatusCode, kind: &'static str, message: String) -> Response {
        (
            status,
            Json(Self {
                success: false,
                data: None,
                error: Some(message),
                error_kind: Some(kind),
            }),
        )
            .into_response()
    }
}

/// Map pipeline errors to HTTP status codes
fn error_response(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::Conflict { .. } => StatusCode::CONFLICT,
        PipelineError::UnknownSubject { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(kind = e.kind(), error = %e, "request failed");
    } else {
        warn!(kind = e.kind(), error = %e, "request rejected");
    }
    ApiResponse::<()>::failure(status, e.kind(), e.to_string())
}

#[derive(Deserialize)]
struct ReevaluateRequest {
    actor: String,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> Response {
    ApiResponse::ok("OK")
}

/// GET /api/clients/:client_id/transactions - Tenant-scoped query view
async fn get_client_transactions(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Response {
    let views: Vec<TransactionView> = state.pipeline.store().client_view(&client_id);
    ApiResponse::ok(views)
}

/// GET /api/transactions/:id/audit - Audit trail of one transaction
async fn get_transaction_audit(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if let Err(e) = state.pipeline.store().require_transaction(&id) {
        return error_response(e);
    }
    let entries: Vec<AuditEntry> = state.pipeline.store().audit_for(&id);
    ApiResponse::ok(entries)
}

/// POST /api/overrides - Reviewer override (classification, finding, flag)
async fn post_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Response {
    let outcome: OverrideOutcome = match state.pipeline.apply_override(request) {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };
    if let Err(response) = state.persist() {
        return response;
    }
    ApiResponse::ok(outcome)
}

/// POST /api/transactions/:id/reevaluate - Recompute findings and flags
async fn post_reevaluate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReevaluateRequest>,
) -> Response {
    if request.actor.trim().is_empty() {
        return error_response(PipelineError::validation("actor", &request.actor, "actor is required"));
    }
    let outcome: StageOutcome = match state.pipeline.reevaluate(&id, &request.actor) {
        Ok(outcome) => outcome,
        Err(e) => return error_response(e),
    };
    if let Err(response) = state.persist() {
        return response;
    }
    ApiResponse::ok(outcome)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("eagle_ledger=info")),
        )
        .init();

    let args = Args::parse();

    println!("🌐 Eagle Ledger - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let config = PipelineConfig::load(args.config.as_deref())?;
    let rules = match &config.rules_path {
        Some(path) => RuleTable::from_file(path)?,
        None => RuleTable::builtin(),
    };

    let conn = open_database(&args.db)?;
    let store = load_store(&conn)?;
    println!(
        "✓ Database opened: {:?} ({} transactions)",
        args.db,
        store.transaction_count()
    );

    let collaborators = Collaborators::offline_from_store(&store);
    let state = AppState {
        pipeline: Pipeline::new(store, config, Arc::new(rules), collaborators),
        db: Arc::new(Mutex::new(conn)),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/clients/:client_id/transactions", get(get_client_transactions))
        .route("/transactions/:id/audit", get(get_transaction_audit))
        .route("/transactions/:id/reevaluate", post(post_reevaluate))
        .route("/overrides", post(post_override))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind to {}", args.addr))?;

    info!(addr = %args.addr, "server listening");
    println!("\n🚀 Server running on http://{}", args.addr);
    println!("   API: http://{}/api/health", args.addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
