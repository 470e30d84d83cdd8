//! Thin axum JSON controller over the job service.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use comps_core::ScrapeQuery;
use comps_storage::ComparableFilter;
use comps_sync::{JobService, PipelineError};
use serde::Deserialize;
use std::sync::Arc;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "comps-web";

pub struct AppState {
    pub service: JobService,
}

impl AppState {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Sync,
    #[default]
    Background,
    None,
}

#[derive(Debug, Default, Deserialize)]
struct CreateParams {
    #[serde(default)]
    run: RunMode,
}

#[derive(Debug, Default, Deserialize)]
struct ComparablesParams {
    q: Option<String>,
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/jobs", post(create_job_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/jobs/{id}/run", post(run_job_handler))
        .route("/comparables", get(comparables_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: JobService, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: Uuid) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("job {id} not found"),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::JobNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            e if e.is_conflict() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_job_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CreateParams>,
    Json(query): Json<ScrapeQuery>,
) -> Result<Response, ApiError> {
    let service = &state.service;
    let id = service.create(query).await?;
    match params.run {
        RunMode::Sync => {
            let job = service.run(id).await?;
            Ok((StatusCode::OK, Json(job)).into_response())
        }
        RunMode::Background => {
            let job = service.get(id).await?.ok_or_else(|| ApiError::not_found(id))?;
            service.spawn(id);
            Ok((StatusCode::ACCEPTED, Json(job)).into_response())
        }
        RunMode::None => {
            let job = service.get(id).await?.ok_or_else(|| ApiError::not_found(id))?;
            Ok((StatusCode::CREATED, Json(job)).into_response())
        }
    }
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    match state.service.get(id).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Err(ApiError::not_found(id)),
    }
}

async fn run_job_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Response, ApiError> {
    let job = state.service.run(id).await?;
    Ok(Json(job).into_response())
}

async fn comparables_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ComparablesParams>,
) -> Result<Response, ApiError> {
    let filter = ComparableFilter {
        text: params.q,
        limit: params.limit,
    };
    let rows = state.service.search_comparables(&filter).await?;
    Ok(Json(rows).into_response())
}
