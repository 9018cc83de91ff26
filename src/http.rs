//! Thin `axum` surface demonstrating the Operations HTTP contract.
//!
//! This module is a reference integration, not the production API surface
//! (that's an external collaborator's job); it exists so the contract
//! between the core and its HTTP callers can be exercised end-to-end in
//! integration tests.

use crate::cancellation::CancellationCoordinator;
use crate::data::DataRepository;
use crate::error::KtrdrError;
use crate::manifest;
use crate::operations::orchestrator::{ManagedOperationOrchestrator, WorkerOutcome};
use crate::operations::{ListFilters, OperationKind, OperationStatus, OperationsRegistry};
use crate::pipeline::{self, PipelineOutcome, TrainingRequest};
use crate::storage::ModelStorage;
use axum::extract::{Path, Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: ManagedOperationOrchestrator,
    pub repository: Arc<DataRepository>,
    pub model_storage: Arc<ModelStorage>,
}

impl AppState {
    pub fn new(repository: DataRepository, model_storage: ModelStorage) -> Self {
        Self {
            orchestrator: ManagedOperationOrchestrator::new(
                OperationsRegistry::new(),
                CancellationCoordinator::default(),
            ),
            repository: Arc::new(repository),
            model_storage: Arc::new(model_storage),
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

fn ktrdr_error_response(error: &KtrdrError) -> Response {
    let status = match error.category() {
        "data-not-found" => StatusCode::NOT_FOUND,
        "invalid-input" | "fuzzy-config-invalid" | "indicator-parameter-invalid" => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, error.to_string())
}

// ---------------------------------------------------------------------
// POST /data/load
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DataLoadRequest {
    pub symbol: String,
    pub timeframe: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DataLoadResponse {
    pub operation_id: String,
    pub status: &'static str,
}

/// Starts a data-load operation whose worker reports how many bars are
/// already resident for `(symbol, timeframe)`. Acquiring fresh bars from an
/// external vendor is a collaborator's concern, not this crate's.
pub async fn start_data_load(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<DataLoadRequest>,
) -> Response {
    let repository = state.repository.clone();
    let mut metadata = HashMap::new();
    metadata.insert("symbol".to_string(), request.symbol.clone());
    metadata.insert("timeframe".to_string(), request.timeframe.clone());
    metadata.insert(
        "mode".to_string(),
        request.mode.clone().unwrap_or_else(|| "tail".to_string()),
    );

    let started = state.orchestrator.start_managed_operation(
        OperationKind::DataLoad,
        metadata,
        None,
        move |reporter, _token| async move {
            let symbol = request.symbol.clone();
            let timeframe = request.timeframe.clone();
            let location = repository.describe();
            let outcome = tokio::task::spawn_blocking(move || repository.load(&symbol, &timeframe, None, None))
                .await
                .unwrap_or_else(|e| Err(KtrdrError::storage(e.to_string())));

            match outcome {
                Ok(frame) => {
                    reporter.report(100.0, "loaded", HashMap::new());
                    let range = frame.range();
                    let data_source = location.split(':').next().unwrap_or(&location).to_string();
                    WorkerOutcome::Completed(json!({
                        "bars_loaded": frame.len(),
                        "date_range": range.map(|(start, end)| json!({
                            "start": start.to_rfc3339(),
                            "end": end.to_rfc3339(),
                        })),
                        "gaps_filled": 0,
                        "data_source": data_source,
                        "storage_location": location,
                    }))
                }
                Err(e) => WorkerOutcome::Failed(e),
            }
        },
    );

    Json(DataLoadResponse {
        operation_id: started.operation_id,
        status: started.status,
    })
    .into_response()
}

// ---------------------------------------------------------------------
// POST /trainings/start
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TrainingStartRequest {
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub manifest: String,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TrainingStartResponse {
    pub operation_id: String,
    pub status: &'static str,
    pub message: String,
    pub estimated_duration_minutes: u32,
}

pub async fn start_training(
    AxumState(state): AxumState<AppState>,
    Json(request): Json<TrainingStartRequest>,
) -> Response {
    let manifest = match manifest::parse(&request.manifest) {
        Ok(manifest) => manifest,
        Err(e) => return ktrdr_error_response(&e),
    };

    let repository = state.repository.clone();
    let model_storage = state.model_storage.clone();
    let mut metadata = HashMap::new();
    metadata.insert("strategy".to_string(), request.strategy.clone());
    metadata.insert("symbol".to_string(), request.symbol.clone());
    metadata.insert("timeframe".to_string(), request.timeframe.clone());

    let estimated_duration_minutes = (manifest.training.max_epochs / 20).max(1) as u32;

    let started = state.orchestrator.start_managed_operation(
        OperationKind::Training,
        metadata,
        None,
        move |reporter, token| async move {
            let training_request = TrainingRequest {
                strategy: request.strategy,
                symbol: request.symbol,
                timeframe: request.timeframe,
                start: request.start,
                end: request.end,
                manifest,
            };
            let result = tokio::task::spawn_blocking(move || {
                pipeline::run(&repository, &model_storage, training_request, &token, &reporter)
            })
            .await
            .unwrap_or_else(|e| Err(KtrdrError::storage(e.to_string())));

            match result {
                Ok(PipelineOutcome::Completed { result_summary }) => {
                    WorkerOutcome::Completed(result_summary)
                }
                Ok(PipelineOutcome::Cancelled { .. }) => WorkerOutcome::Cancelled,
                Err(e) => WorkerOutcome::Failed(e),
            }
        },
    );

    Json(TrainingStartResponse {
        operation_id: started.operation_id,
        status: "training_started",
        message: "training started".to_string(),
        estimated_duration_minutes,
    })
    .into_response()
}

// ---------------------------------------------------------------------
// GET /operations
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListOperationsQuery {
    pub operation_type: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub active_only: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn parse_kind(s: &str) -> Option<OperationKind> {
    match s {
        "data-load" => Some(OperationKind::DataLoad),
        "training" => Some(OperationKind::Training),
        "backtesting" => Some(OperationKind::Backtesting),
        "other" => Some(OperationKind::Other),
        _ => None,
    }
}

fn parse_status(s: &str) -> Option<OperationStatus> {
    match s {
        "pending" => Some(OperationStatus::Pending),
        "running" => Some(OperationStatus::Running),
        "cancelling" => Some(OperationStatus::Cancelling),
        "completed" => Some(OperationStatus::Completed),
        "failed" => Some(OperationStatus::Failed),
        "cancelled" => Some(OperationStatus::Cancelled),
        _ => None,
    }
}

pub async fn list_operations(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<ListOperationsQuery>,
) -> Response {
    let filters = ListFilters {
        kind: query.operation_type.as_deref().and_then(parse_kind),
        status: query.status.as_deref().and_then(parse_status),
        active_only: query.active_only,
    };
    let limit = query.limit.unwrap_or(10).min(100);
    let offset = query.offset.unwrap_or(0);
    let (data, total_count, active_count) =
        state.orchestrator.registry().list(&filters, limit, offset);

    Json(json!({
        "data": data,
        "total_count": total_count,
        "active_count": active_count,
    }))
    .into_response()
}

// ---------------------------------------------------------------------
// GET /operations/{id}
// ---------------------------------------------------------------------

pub async fn get_operation(AxumState(state): AxumState<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.registry().get(&id) {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "unknown operation"),
    }
}

// ---------------------------------------------------------------------
// POST /operations/{id}/cancel
// ---------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub status: &'static str,
    pub task_cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training_session_cancelled: Option<bool>,
}

pub async fn cancel_operation(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> Response {
    let Some(record) = state.orchestrator.registry().get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown operation");
    };
    let reason = body.reason.unwrap_or_else(|| "cancel requested".to_string());
    if let Err(e) = state.orchestrator.cancel(&id, reason) {
        return ktrdr_error_response(&e);
    }

    let refreshed = state.orchestrator.registry().get(&id).unwrap_or(record);
    let status = if refreshed.status == OperationStatus::Cancelled {
        "cancelled"
    } else {
        "cancelling"
    };
    let training_session_cancelled = (refreshed.kind == OperationKind::Training).then_some(true);

    Json(CancelResponse {
        success: true,
        status,
        task_cancelled: true,
        training_session_cancelled,
    })
    .into_response()
}

// ---------------------------------------------------------------------
// GET /operations/{id}/results
// ---------------------------------------------------------------------

pub async fn get_operation_results(
    AxumState(state): AxumState<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(record) = state.orchestrator.registry().get(&id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown operation");
    };
    if !record.status.is_terminal() {
        return error_response(StatusCode::BAD_REQUEST, "operation has not reached a terminal state");
    }

    Json(json!({
        "operation_type": record.kind,
        "status": record.status,
        "results": record.result_summary,
    }))
    .into_response()
}

/// Builds the router with CORS and request tracing, the way the teacher
/// layers its own `axum` surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/data/load", post(start_data_load))
        .route("/trainings/start", post(start_training))
        .route("/operations", get(list_operations))
        .route("/operations/:id", get(get_operation))
        .route("/operations/:id/cancel", post(cancel_operation))
        .route("/operations/:id/results", get(get_operation_results))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
