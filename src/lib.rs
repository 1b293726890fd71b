pub mod backend;
pub mod config;
pub mod db;
pub mod definitions;
pub mod dialect;
pub mod errors;
pub mod formatter;
pub mod models;
pub mod policy;
pub mod redaction;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod similarity;
pub mod state;

use crate::config::ServiceConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, ControlResponse, HealthResponse, HistoryQuery, MetricRow, OpenResolutionPayload,
    RowHistoryEntry, StartRunPayload, StatusView, TranslatePayload, TranslateResponse,
};
use crate::resolver::ResolutionSession;
use crate::runner::RunnerCore;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::Method;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

#[derive(Clone)]
pub struct AppState {
    runner: Arc<RunnerCore>,
}

impl AppState {
    pub fn new(runner: Arc<RunnerCore>) -> Self {
        Self { runner }
    }
}

async fn start_run(
    State(state): State<AppState>,
    payload: Option<Json<StartRunPayload>>,
) -> AppResult<Json<ControlResponse>> {
    let payload = payload.map(|Json(payload)| payload).unwrap_or_default();
    state.runner.start_run(payload).await.map(Json)
}

async fn run_status(State(state): State<AppState>) -> AppResult<Json<StatusView>> {
    state.runner.status().await.map(Json)
}

async fn stop_run(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(state.runner.stop_run().await)
}

async fn reset_run(State(state): State<AppState>) -> Json<ControlResponse> {
    Json(state.runner.reset_run().await)
}

async fn list_rows(State(state): State<AppState>) -> AppResult<Json<Vec<MetricRow>>> {
    state.runner.list_rows().await.map(Json)
}

async fn row_history(
    State(state): State<AppState>,
    UrlPath(row_id): UrlPath<i64>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Vec<RowHistoryEntry>>> {
    state.runner.row_history(row_id, query.limit).map(Json)
}

async fn translate(
    State(state): State<AppState>,
    Json(payload): Json<TranslatePayload>,
) -> AppResult<Json<TranslateResponse>> {
    state.runner.translate(payload).await.map(Json)
}

async fn open_resolution(
    State(state): State<AppState>,
    Json(payload): Json<OpenResolutionPayload>,
) -> AppResult<Json<ResolutionSession>> {
    state.runner.open_resolution(payload).await.map(Json)
}

async fn get_resolution(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<String>,
) -> AppResult<Json<ResolutionSession>> {
    state.runner.get_resolution(&session_id).await.map(Json)
}

async fn trial_resolution(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<String>,
) -> AppResult<Json<ResolutionSession>> {
    state.runner.trial_resolution(&session_id).await.map(Json)
}

async fn accept_resolution(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<String>,
) -> AppResult<Json<ResolutionSession>> {
    state.runner.accept_resolution(&session_id).await.map(Json)
}

async fn skip_resolution(
    State(state): State<AppState>,
    UrlPath(session_id): UrlPath<String>,
) -> AppResult<Json<ResolutionSession>> {
    state.runner.skip_resolution(&session_id).await.map(Json)
}

async fn get_settings(State(state): State<AppState>) -> AppResult<Json<AppSettings>> {
    state.runner.get_settings().map(Json)
}

async fn update_settings(
    State(state): State<AppState>,
    Json(update): Json<serde_json::Value>,
) -> AppResult<Json<AppSettings>> {
    state.runner.update_settings(update).await.map(Json)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.runner.health().await)
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/run", post(start_run).get(run_status))
        .route("/run/status", get(run_status))
        .route("/run/stop", post(stop_run))
        .route("/run/reset", post(reset_run))
        .route("/rows", get(list_rows))
        .route("/rows/:id/history", get(row_history))
        .route("/translate", post(translate))
        .route("/resolver/sessions", post(open_resolution))
        .route("/resolver/sessions/:id", get(get_resolution))
        .route("/resolver/sessions/:id/trial", post(trial_resolution))
        .route("/resolver/sessions/:id/accept", post(accept_resolution))
        .route("/resolver/sessions/:id/skip", post(skip_resolution))
        .route("/settings", get(get_settings).put(update_settings))
        .with_state(state)
        .layer(cors)
}

/// Boots the service: config, logging, store, optional auto-start, then serves
/// until the process is stopped.
pub async fn run() -> AppResult<()> {
    let config = ServiceConfig::from_env()?;
    std::fs::create_dir_all(&config.data_dir)?;
    init_tracing(&config.log_dir())?;

    let runner = RunnerCore::open(&config)?;
    if let Err(error) = runner.auto_start().await {
        tracing::warn!(error = %error, "auto start failed");
    }

    let app = router(AppState::new(runner));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|error| AppError::Io(format!("bind {}: {}", config.bind_addr, error)))?;
    tracing::info!(addr = %config.bind_addr, "metric-pulse listening");
    axum::serve(listener, app)
        .await
        .map_err(|error| AppError::Io(format!("server error: {}", error)))
}

fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "metric-pulse.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
