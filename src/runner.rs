use crate::backend::{GatewayBackend, QueryBackend};
use crate::config::ServiceConfig;
use crate::db::{Database, RowStore};
use crate::definitions::load_definitions;
use crate::dialect::{adapt_with_report, profile};
use crate::errors::{AppError, AppResult};
use crate::formatter;
use crate::models::{
    AppSettings, ControlResponse, Dialect, HealthResponse, MetricRow, OpenResolutionPayload, RowError,
    RowHistoryEntry, StartRunPayload, StatusView, TableCatalog, TranslatePayload, TranslateResponse,
};
use crate::policy::PolicyEngine;
use crate::redaction::Redactor;
use crate::resolver::{rank, referenced_columns, ResolutionSession, ResolutionSessions};
use crate::scheduler::Scheduler;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{timeout, Duration};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1_000;

/// Composition root: owns the store, the scheduler service and the operator-facing
/// resolver sessions. HTTP handlers only ever talk to this type.
pub struct RunnerCore {
    db: Arc<Database>,
    scheduler: Scheduler,
    backend: Arc<dyn QueryBackend>,
    policy: PolicyEngine,
    redactor: Arc<RwLock<Redactor>>,
    sessions: ResolutionSessions,
}

impl RunnerCore {
    pub fn new(db: Arc<Database>, backend: Arc<dyn QueryBackend>) -> AppResult<Arc<Self>> {
        let settings = db.get_settings()?;
        let redactor = Arc::new(RwLock::new(Redactor::new(settings.redact_aggressive)));
        let store: Arc<dyn RowStore> = db.clone();
        let scheduler = Scheduler::new(backend.clone(), store, redactor.clone());

        Ok(Arc::new(Self {
            db,
            scheduler,
            backend,
            policy: PolicyEngine::new(),
            redactor,
            sessions: ResolutionSessions::new(),
        }))
    }

    /// Builds the production wiring: SQLite under the data dir, HTTP gateways per
    /// dialect, and the definitions file seeded into the store.
    pub fn open(config: &ServiceConfig) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Arc::new(Database::new(&config.database_path())?);
        let backend = GatewayBackend::new(
            config.sql_server_gateway.clone(),
            config.access_gateway.clone(),
        )?;
        for dialect in Dialect::all() {
            if !backend.is_configured(dialect) {
                tracing::warn!(dialect = dialect.as_str(), "no query gateway configured; rows on this backend will fail");
            }
        }
        let this = Self::new(db, Arc::new(backend))?;

        match this.seed_definitions(&config.definitions_path) {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "seeded metric rows from definitions"),
            Err(error) => tracing::warn!(error = %error, "failed to seed metric definitions"),
        }
        Ok(this)
    }

    pub fn seed_definitions(&self, path: &Path) -> AppResult<usize> {
        let rows = load_definitions(path)?;
        if rows.is_empty() {
            return Ok(0);
        }
        self.policy.validate_rows(&rows)?;
        self.db.seed_rows(&rows)
    }

    /// Starts a run when `autoStart` is set. Called once at boot.
    pub async fn auto_start(&self) -> AppResult<Option<ControlResponse>> {
        let settings = self.db.get_settings()?;
        if !settings.auto_start {
            return Ok(None);
        }
        tracing::info!("autoStart enabled; starting run");
        self.start_run(StartRunPayload::default()).await.map(Some)
    }

    // ─── Run control ────────────────────────────────────────────────────────

    pub async fn start_run(&self, payload: StartRunPayload) -> AppResult<ControlResponse> {
        // A request against a live run must not touch the stored rows.
        if let Some(running) = self.scheduler.already_running().await {
            tracing::info!("run start requested while a run is live");
            return Ok(running);
        }
        let rows = match payload.rows {
            Some(rows) => {
                self.policy.validate_rows(&rows)?;
                let inserted = self.db.seed_rows(&rows)?;
                if inserted > 0 {
                    tracing::debug!(count = inserted, "stored new rows from run request");
                }
                rows
            }
            None => self.db.load_all_rows()?,
        };
        let settings = self.db.get_settings()?;
        let response = self.scheduler.start(rows, &settings).await;
        tracing::info!(status = ?response.status, "run start requested");
        Ok(response)
    }

    pub async fn stop_run(&self) -> ControlResponse {
        self.scheduler.stop().await
    }

    pub async fn reset_run(&self) -> ControlResponse {
        self.scheduler.reset().await
    }

    pub async fn status(&self) -> AppResult<StatusView> {
        let settings = self.db.get_settings()?;
        Ok(self.scheduler.status(settings.recent_window_seconds).await)
    }

    /// The live snapshot while one exists, otherwise what the store holds.
    pub async fn list_rows(&self) -> AppResult<Vec<MetricRow>> {
        let state = self.scheduler.state().snapshot().await;
        if !state.snapshot.is_empty() {
            return Ok(state.snapshot);
        }
        self.db.load_all_rows()
    }

    pub fn row_history(&self, row_id: i64, limit: Option<usize>) -> AppResult<Vec<RowHistoryEntry>> {
        if self.db.get_row(row_id)?.is_none() {
            return Err(AppError::NotFound(format!("Row {} not found", row_id)));
        }
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.db.list_history(row_id, limit)
    }

    // ─── Translation ────────────────────────────────────────────────────────

    pub async fn translate(&self, payload: TranslatePayload) -> AppResult<TranslateResponse> {
        if payload.sql.trim().is_empty() {
            return Err(AppError::Validation("sql must not be empty".to_string()));
        }
        let catalog = if payload.use_catalog {
            self.catalog_or_none(payload.target).await
        } else {
            None
        };
        let translation = adapt_with_report(&payload.sql, profile(payload.target), catalog.as_ref());
        Ok(TranslateResponse {
            sql: translation.sql,
            applied_rules: translation
                .applied_rules
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }

    // ─── Resolver ───────────────────────────────────────────────────────────

    pub async fn open_resolution(&self, payload: OpenResolutionPayload) -> AppResult<ResolutionSession> {
        let row = self.require_row(payload.row_id).await?;
        if row.sql_expression.trim().is_empty() {
            return Err(AppError::Validation(format!("Row {} has no SQL to resolve", row.id)));
        }

        let catalog = self.catalog_or_none(row.backend).await.unwrap_or_default();
        let columns = referenced_columns(&row.sql_expression);
        let label = payload
            .label
            .filter(|label| !label.trim().is_empty())
            .unwrap_or_else(|| row.label());
        let candidates = rank(&columns, &label, &catalog);
        tracing::info!(
            row_id = row.id,
            dialect = row.backend.as_str(),
            candidates = candidates.len(),
            "opened resolution session"
        );

        let mut session = ResolutionSession::new(row.id, row.backend, row.sql_expression.clone());
        session.propose(candidates)?;
        Ok(self.sessions.insert(session).await)
    }

    pub async fn get_resolution(&self, session_id: &str) -> AppResult<ResolutionSession> {
        self.sessions.get(session_id).await
    }

    /// Runs the current candidate's query once and records the outcome.
    pub async fn trial_resolution(&self, session_id: &str) -> AppResult<ResolutionSession> {
        let session = self.sessions.get(session_id).await?;
        let sql = session.trial_sql()?;
        let row = self.require_row(session.row_id).await?;
        let outcome = self.trial_query(&row, &sql).await;
        let outcome = match outcome {
            Ok(sample) => Ok(sample),
            Err(error) => {
                let message = self.redactor.read().await.scrub(&error.message);
                Err(RowError::new(error.kind, message))
            }
        };
        let (session, ()) = self
            .sessions
            .update(session_id, |session| session.record_trial(outcome))
            .await?;
        Ok(session)
    }

    /// Commits the matched query onto the row, in the store and the live snapshot.
    pub async fn accept_resolution(&self, session_id: &str) -> AppResult<ResolutionSession> {
        let (session, sql) = self
            .sessions
            .update(session_id, |session| session.accept())
            .await?;

        // The live row is patched and saved under the state lock, so a refresh
        // finishing at the same moment keeps the new query.
        let row_id = session.row_id;
        let db = &self.db;
        let mut saved_live = None;
        self.scheduler
            .state()
            .update(|state| {
                if let Some(live) = state.snapshot.iter_mut().find(|live| live.id == row_id) {
                    live.sql_expression = sql.clone();
                    live.clear_error();
                    saved_live = Some(db.save_row(live));
                }
            })
            .await;
        match saved_live {
            Some(saved) => saved?,
            None => {
                let mut row = self.require_row(row_id).await?;
                row.sql_expression = sql;
                row.clear_error();
                self.db.save_row(&row)?;
            }
        }
        tracing::info!(row_id, table = ?session.current_table(), "accepted resolved query");
        Ok(session)
    }

    pub async fn skip_resolution(&self, session_id: &str) -> AppResult<ResolutionSession> {
        let (session, ()) = self
            .sessions
            .update(session_id, |session| session.skip())
            .await?;
        Ok(session)
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        self.db.get_settings()
    }

    /// Merge-patches the stored settings. Run tunables apply from the next start.
    pub async fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let merged = self.db.merged_settings(update)?;
        self.policy.validate_settings(&merged)?;
        self.db.save_settings(&merged)?;
        self.apply_runtime_settings(&merged).await;
        Ok(merged)
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: self.db.path().display().to_string(),
            worker_running: self.scheduler.is_worker_running().await,
        }
    }

    async fn apply_runtime_settings(&self, settings: &AppSettings) {
        let mut redactor = self.redactor.write().await;
        *redactor = Redactor::new(settings.redact_aggressive);
    }

    async fn require_row(&self, row_id: i64) -> AppResult<MetricRow> {
        if let Some(row) = self.db.get_row(row_id)? {
            return Ok(row);
        }
        self.scheduler
            .state()
            .row(row_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Row {} not found", row_id)))
    }

    async fn catalog_or_none(&self, dialect: Dialect) -> Option<TableCatalog> {
        let limit = self.query_timeout();
        match timeout(limit, self.backend.catalog(dialect)).await {
            Ok(Ok(catalog)) if !catalog.is_empty() => Some(catalog),
            Ok(Ok(_)) => None,
            Ok(Err(error)) => {
                tracing::debug!(dialect = dialect.as_str(), error = %error, "catalog unavailable");
                None
            }
            Err(_) => {
                tracing::debug!(dialect = dialect.as_str(), "catalog fetch timed out");
                None
            }
        }
    }

    async fn trial_query(&self, row: &MetricRow, sql: &str) -> Result<Option<String>, RowError> {
        self.policy.ensure_read_only(sql)?;
        let limit = self.query_timeout();
        let output = match timeout(limit, self.backend.execute(row.backend, sql)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RowError::connection(format!(
                    "Query timed out after {}s",
                    limit.as_secs()
                )))
            }
        };
        let Some(raw) = output.first_value() else {
            return Err(RowError::execution("query returned no rows"));
        };
        let mut sample_row = row.clone();
        sample_row.value = None;
        Ok(Some(formatter::format(raw, &sample_row).display))
    }

    fn query_timeout(&self) -> Duration {
        let seconds = self
            .db
            .get_settings()
            .map(|settings| settings.query_timeout_seconds)
            .unwrap_or_else(|_| AppSettings::default().query_timeout_seconds);
        Duration::from_secs(seconds.max(1))
    }
}
