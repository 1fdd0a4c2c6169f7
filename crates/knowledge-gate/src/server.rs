//! JSON HTTP API over the orchestrator.
//!
//! # Endpoints
//!
//! | Method   | Path                | Description |
//! |----------|---------------------|-------------|
//! | `POST`   | `/query`            | Run a persona-scoped knowledge query |
//! | `POST`   | `/ingest`           | Ingest or re-ingest a document |
//! | `DELETE` | `/documents/{id}`   | Delete a document (owning tenant required) |
//! | `POST`   | `/policies/reload`  | Hot-reload persona policies from config |
//! | `GET`    | `/metrics`          | Store and cache counters |
//! | `GET`    | `/health`           | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `unknown_persona` (404), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so facility dashboards
//! can call the API directly from the browser.

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use knowledge_gate_core::error::GateError;
use knowledge_gate_core::models::{Category, Document, Query, UploaderRole};
use knowledge_gate_core::store::VectorStore;

use crate::ingest::Ingestor;
use crate::orchestrator::Orchestrator;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    ingestor: Arc<Ingestor>,
    store: Arc<dyn VectorStore>,
}

/// Start the HTTP server on `bind`. Runs until the process terminates.
pub async fn run_server(
    bind: &str,
    orchestrator: Arc<Orchestrator>,
    ingestor: Arc<Ingestor>,
    store: Arc<dyn VectorStore>,
) -> anyhow::Result<()> {
    let state = AppState {
        orchestrator,
        ingestor,
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/query", post(handle_query))
        .route("/ingest", post(handle_ingest))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/policies/reload", post(handle_reload_policies))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(%bind, "server listening");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: code.to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ /query ============

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    tenant_id: String,
    persona_id: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    if req.tenant_id.trim().is_empty() {
        return Err(bad_request("tenant_id must not be empty"));
    }

    let query = Query::new(req.query, req.tenant_id, req.persona_id);
    match state.orchestrator.handle(query).await {
        Ok(response) => Ok(Json(response)),
        Err(GateError::UnknownPersona(id)) => Err(not_found(
            "unknown_persona",
            format!("no policy for persona '{}'", id),
        )),
        Err(e) => Err(internal(e.to_string())),
    }
}

// ============ /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    document_id: String,
    tenant_id: String,
    category: String,
    uploader_role: String,
    content: String,
    /// Creation time; defaults to now for fresh uploads.
    created_at: Option<DateTime<Utc>>,
    /// Structured facts for conflict detection, inherited by every chunk.
    metadata: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct IngestResponse {
    document_id: String,
    chunks: usize,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.document_id.trim().is_empty() {
        return Err(bad_request("document_id must not be empty"));
    }
    if req.tenant_id.trim().is_empty() {
        return Err(bad_request("tenant_id must not be empty"));
    }
    let category = Category::from_str(&req.category).map_err(|e| bad_request(e.to_string()))?;
    let uploader_role =
        UploaderRole::from_str(&req.uploader_role).map_err(|e| bad_request(e.to_string()))?;

    // Uploads from roles a category never accepts are refused at the
    // door instead of silently dying in the authority stage later.
    if !category.permitted_uploaders().contains(&uploader_role) {
        return Err(bad_request(format!(
            "role '{}' may not upload '{}' documents",
            uploader_role, category
        )));
    }

    let doc = Document {
        id: req.document_id.clone(),
        tenant_id: req.tenant_id,
        category,
        uploader_role,
        created_at: req.created_at.unwrap_or_else(Utc::now),
        content: req.content,
        metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
    };

    let chunks = state
        .ingestor
        .ingest(&doc)
        .await
        .map_err(|e| internal(e.to_string()))?;

    Ok(Json(IngestResponse {
        document_id: req.document_id,
        chunks,
    }))
}

// ============ /documents/{id} ============

#[derive(Deserialize)]
struct DeleteParams {
    tenant_id: String,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    QueryParams(params): QueryParams<DeleteParams>,
) -> Result<impl IntoResponse, AppError> {
    let removed = state
        .ingestor
        .delete(&document_id, &params.tenant_id)
        .await
        .map_err(|e| internal(e.to_string()))?;

    if !removed {
        return Err(not_found(
            "not_found",
            format!("document '{}' not found", document_id),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============ /policies/reload ============

#[derive(Serialize)]
struct ReloadResponse {
    personas: usize,
}

async fn handle_reload_policies(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let personas = state
        .orchestrator
        .reload_policies()
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(ReloadResponse { personas }))
}

// ============ /metrics ============

#[derive(Serialize)]
struct MetricsResponse {
    store: knowledge_gate_core::store::StoreMetrics,
    cached_verdicts: usize,
}

async fn handle_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let store = state
        .store
        .metrics()
        .await
        .map_err(|e| internal(e.to_string()))?;
    let cached_verdicts = state.orchestrator.cache_entries().await;
    Ok(Json(MetricsResponse {
        store,
        cached_verdicts,
    }))
}

// ============ /health ============

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
