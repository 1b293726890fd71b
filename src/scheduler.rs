use crate::backend::QueryBackend;
use crate::db::RowStore;
use crate::dialect::{adapt, profile};
use crate::formatter;
use crate::models::{
    AppSettings, ControlResponse, ControlStatus, Dialect, ExecutionState, ExecutionStatus, MetricRow,
    RowError, RowHistoryEntry, StatusView, TableCatalog,
};
use crate::policy::PolicyEngine;
use crate::redaction::Redactor;
use crate::state::{status_view, ExecutionStateHandle};
use chrono::Utc;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

const PRESERVED_ANOMALY: &str = "query returned 0; previous value kept";

/// Per-run copy of the tunables, taken when the run starts.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub query_timeout: Duration,
    pub inter_row_delay: Duration,
    pub inter_cycle_delay: Duration,
    pub failure_threshold: u32,
    pub max_cycles: Option<u64>,
    pub retention_days: u32,
}

impl From<&AppSettings> for RunSettings {
    fn from(settings: &AppSettings) -> Self {
        Self {
            query_timeout: Duration::from_secs(settings.query_timeout_seconds.max(1)),
            inter_row_delay: Duration::from_millis(settings.inter_row_delay_ms),
            inter_cycle_delay: Duration::from_millis(settings.inter_cycle_delay_ms),
            failure_threshold: settings.failure_threshold.max(1),
            max_cycles: settings.max_cycles,
            retention_days: settings.retention_days,
        }
    }
}

#[derive(Default)]
struct CancelSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // A stored permit wakes the next pause even if nobody is waiting yet.
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct WorkerHandle {
    token: u64,
    cancel: Arc<CancelSignal>,
    supervisor: JoinHandle<()>,
}

/// The single refresh worker. At most one cycle task is live at a time.
#[derive(Clone)]
pub struct Scheduler {
    state: ExecutionStateHandle,
    backend: Arc<dyn QueryBackend>,
    store: Arc<dyn RowStore>,
    policy: PolicyEngine,
    redactor: Arc<RwLock<Redactor>>,
    worker: Arc<Mutex<Option<WorkerHandle>>>,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn QueryBackend>,
        store: Arc<dyn RowStore>,
        redactor: Arc<RwLock<Redactor>>,
    ) -> Self {
        Self {
            state: ExecutionStateHandle::new(),
            backend,
            store,
            policy: PolicyEngine::new(),
            redactor,
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> &ExecutionStateHandle {
        &self.state
    }

    /// The `alreadyRunning` reply when a run is live, `None` when a start would launch one.
    pub async fn already_running(&self) -> Option<ControlResponse> {
        let current = self.state.snapshot().await;
        (current.status == ExecutionStatus::Running).then(|| ControlResponse {
            status: ControlStatus::AlreadyRunning,
            execution_state: Some(current),
        })
    }

    /// Starts a run over `rows`, or reports the live one.
    pub async fn start(&self, rows: Vec<MetricRow>, settings: &AppSettings) -> ControlResponse {
        let mut worker = self.worker.lock().await;
        if let Some(running) = self.already_running().await {
            return running;
        }

        let mut rows = rows;
        rows.sort_by_key(|row| row.id);
        let token = self.state.next_token();
        let now = Utc::now();
        let status = if rows.is_empty() {
            ExecutionStatus::Complete
        } else {
            ExecutionStatus::Running
        };
        let snapshot = rows.clone();
        let state = self
            .state
            .update(move |state| {
                *state = ExecutionState {
                    status,
                    snapshot,
                    run_token: token,
                    started_at: Some(now),
                    ..ExecutionState::default()
                };
            })
            .await;

        if rows.is_empty() {
            tracing::info!(run_token = token, "run started with no rows; nothing to refresh");
            *worker = None;
            return ControlResponse {
                status: ControlStatus::Started,
                execution_state: Some(state),
            };
        }

        let cancel = Arc::new(CancelSignal::default());
        let task = CycleTask {
            token,
            state: self.state.clone(),
            backend: self.backend.clone(),
            store: self.store.clone(),
            policy: self.policy.clone(),
            redactor: self.redactor.read().await.clone(),
            settings: RunSettings::from(settings),
            cancel: cancel.clone(),
        };
        tracing::info!(run_token = token, rows = rows.len(), "refresh run started");

        let cycle = tokio::spawn(task.run(rows));
        let supervisor = tokio::spawn(supervise(cycle, self.state.clone(), token));
        *worker = Some(WorkerHandle {
            token,
            cancel,
            supervisor,
        });

        ControlResponse {
            status: ControlStatus::Started,
            execution_state: Some(state),
        }
    }

    /// Cancels the live run. A query already in flight finishes but its result is dropped.
    pub async fn stop(&self) -> ControlResponse {
        let state = self.halt(false).await;
        ControlResponse {
            status: ControlStatus::Stopped,
            execution_state: Some(state),
        }
    }

    /// Stop, then forget the last error. The row snapshot is kept.
    pub async fn reset(&self) -> ControlResponse {
        self.halt(true).await;
        ControlResponse {
            status: ControlStatus::Reset,
            execution_state: None,
        }
    }

    async fn halt(&self, clear_error: bool) -> ExecutionState {
        let mut worker = self.worker.lock().await;
        if let Some(handle) = worker.take() {
            handle.cancel.cancel();
            tracing::info!(run_token = handle.token, "refresh run cancelled");
        }
        self.state.next_token();
        self.state
            .update(|state| {
                state.status = ExecutionStatus::Idle;
                state.active_row_id = None;
                if clear_error {
                    state.last_error = None;
                }
            })
            .await
    }

    pub async fn is_worker_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.supervisor.is_finished())
    }

    pub async fn status(&self, recent_window_seconds: i64) -> StatusView {
        let running = self.is_worker_running().await;
        status_view(self.state.snapshot().await, running, recent_window_seconds, Utc::now())
    }
}

async fn supervise(cycle: JoinHandle<()>, state: ExecutionStateHandle, token: u64) {
    let Err(error) = cycle.await else {
        return;
    };
    if !error.is_panic() {
        return;
    }
    let message = panic_message(error.into_panic());
    tracing::error!(run_token = token, error = %message, "cycle task aborted");
    state
        .update_if_current(token, |state| {
            state.status = ExecutionStatus::Error;
            state.active_row_id = None;
            state.last_error = Some(format!("cycle task aborted: {}", message));
        })
        .await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Copies the refresh result onto the live row. The rewritten SQL is taken only when
/// nobody replaced the query while it was running.
fn merge_refresh(slot: &mut MetricRow, refreshed: &MetricRow, read_sql: &str) {
    slot.value = refreshed.value.clone();
    slot.error = refreshed.error.clone();
    slot.error_kind = refreshed.error_kind;
    slot.last_error_at = refreshed.last_error_at;
    slot.last_updated_at = refreshed.last_updated_at;
    slot.anomaly = refreshed.anomaly.clone();
    if slot.sql_expression == read_sql {
        slot.sql_expression = refreshed.sql_expression.clone();
    }
}

enum RowOutcome {
    Refreshed { preserved: bool },
    Failed(RowError),
}

struct CycleTask {
    token: u64,
    state: ExecutionStateHandle,
    backend: Arc<dyn QueryBackend>,
    store: Arc<dyn RowStore>,
    policy: PolicyEngine,
    redactor: Redactor,
    settings: RunSettings,
    cancel: Arc<CancelSignal>,
}

impl CycleTask {
    async fn run(self, rows: Vec<MetricRow>) {
        let token = self.token;
        let mut consecutive_failures = 0u32;
        let mut cycles = 0u64;

        loop {
            let catalogs = self.load_catalogs(&rows).await;
            if !self
                .state
                .update_if_current(token, |state| state.rows_completed = 0)
                .await
            {
                return;
            }

            for index in 0..rows.len() {
                if self.cancel.is_cancelled() {
                    return;
                }
                // Operator edits to the live snapshot apply from the next visit.
                let row_id = rows[index].id;
                let mut row = self
                    .state
                    .row(row_id)
                    .await
                    .unwrap_or_else(|| rows[index].clone());
                if !self
                    .state
                    .update_if_current(token, |state| state.active_row_id = Some(row_id))
                    .await
                {
                    return;
                }

                let read_sql = row.sql_expression.clone();
                let catalog = catalogs.get(&row.backend);
                let outcome = self.refresh_row(&mut row, catalog).await;
                if self.cancel.is_cancelled() || !self.state.is_current(token) {
                    tracing::info!(run_token = token, row_id, "run cancelled mid-row; result discarded");
                    return;
                }

                match &outcome {
                    RowOutcome::Refreshed { .. } => consecutive_failures = 0,
                    RowOutcome::Failed(_) => consecutive_failures += 1,
                }

                let tripped = match &outcome {
                    RowOutcome::Failed(error) if consecutive_failures >= self.settings.failure_threshold => {
                        Some(format!(
                            "{} consecutive failures, last on row {}: {}",
                            consecutive_failures, row_id, error
                        ))
                    }
                    _ => None,
                };

                let completed = index + 1;
                let breaker_message = tripped.clone();
                // Saved under the state lock so an operator edit to the row cannot interleave.
                let written = self
                    .state
                    .update_if_current(token, |state| {
                        let merged = match state.snapshot.iter_mut().find(|slot| slot.id == row_id) {
                            Some(slot) => {
                                merge_refresh(slot, &row, &read_sql);
                                slot.clone()
                            }
                            None => row.clone(),
                        };
                        self.save_row(&merged);
                        state.rows_completed = completed;
                        if let Some(message) = breaker_message {
                            state.status = ExecutionStatus::Error;
                            state.active_row_id = None;
                            state.last_error = Some(message);
                        }
                    })
                    .await;
                if written {
                    self.record_history(&row, &outcome);
                }

                if let Some(message) = tripped {
                    tracing::warn!(run_token = token, error = %message, "circuit breaker tripped; run aborted");
                    return;
                }
                if self.pause(self.settings.inter_row_delay).await {
                    return;
                }
            }

            cycles += 1;
            let finished = self.settings.max_cycles.is_some_and(|max| cycles >= max);
            self.state
                .update_if_current(token, |state| {
                    state.cycles_completed = cycles;
                    state.active_row_id = None;
                    if finished {
                        state.status = ExecutionStatus::Complete;
                    }
                })
                .await;
            tracing::info!(run_token = token, cycle = cycles, "refresh cycle complete");
            self.prune_history();

            if finished {
                return;
            }
            if self.pause(self.settings.inter_cycle_delay).await {
                return;
            }
        }
    }

    /// One catalog per dialect in use. Failures leave the dialect out, which skips
    /// catalog-based repairs for its rows.
    async fn load_catalogs(&self, rows: &[MetricRow]) -> HashMap<Dialect, TableCatalog> {
        let mut catalogs = HashMap::new();
        for dialect in Dialect::all() {
            if !rows.iter().any(|row| row.backend == dialect) {
                continue;
            }
            match tokio::time::timeout(self.settings.query_timeout, self.backend.catalog(dialect)).await {
                Ok(Ok(catalog)) if !catalog.is_empty() => {
                    catalogs.insert(dialect, catalog);
                }
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    tracing::debug!(dialect = dialect.as_str(), error = %error, "catalog unavailable; assuming compatible");
                }
                Err(_) => {
                    tracing::debug!(dialect = dialect.as_str(), "catalog lookup timed out; assuming compatible");
                }
            }
        }
        catalogs
    }

    async fn refresh_row(&self, row: &mut MetricRow, catalog: Option<&TableCatalog>) -> RowOutcome {
        let result = self.query_row(row, catalog).await;
        let now = Utc::now();
        match result {
            Ok(raw) => {
                let formatted = formatter::format(&raw, row);
                row.value = Some(formatted.display);
                row.last_updated_at = Some(now);
                row.clear_error();
                row.anomaly = formatted.preserved.then(|| PRESERVED_ANOMALY.to_string());
                RowOutcome::Refreshed {
                    preserved: formatted.preserved,
                }
            }
            Err(error) => {
                let error = RowError::new(error.kind, self.redactor.scrub(&error.message));
                tracing::warn!(
                    run_token = self.token,
                    row_id = row.id,
                    dialect = row.backend.as_str(),
                    error = %error,
                    "row refresh failed"
                );
                row.record_failure(&error, now);
                RowOutcome::Failed(error)
            }
        }
    }

    async fn query_row(&self, row: &mut MetricRow, catalog: Option<&TableCatalog>) -> Result<Value, RowError> {
        let sql = row.sql_expression.trim().to_string();
        if sql.is_empty() {
            return Err(RowError::syntax("no SQL defined for row"));
        }
        self.policy.ensure_read_only(&sql)?;

        let adapted = adapt(&sql, profile(row.backend), catalog);
        if adapted != row.sql_expression {
            tracing::debug!(row_id = row.id, dialect = row.backend.as_str(), "row SQL rewritten for backend");
            row.sql_expression = adapted.clone();
        }

        let limit = self.settings.query_timeout;
        let output = match tokio::time::timeout(limit, self.backend.execute(row.backend, &adapted)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RowError::connection(format!(
                    "Query timed out after {}s",
                    limit.as_secs()
                )));
            }
        };
        output
            .first_value()
            .cloned()
            .ok_or_else(|| RowError::execution("query returned no rows"))
    }

    /// Store failures are logged and never abort the cycle.
    fn save_row(&self, row: &MetricRow) {
        if let Err(error) = self.store.save_row(row) {
            tracing::warn!(row_id = row.id, error = %error, "failed to persist row");
        }
    }

    fn record_history(&self, row: &MetricRow, outcome: &RowOutcome) {
        let (error_kind, message, preserved) = match outcome {
            RowOutcome::Refreshed { preserved } => (None, None, *preserved),
            RowOutcome::Failed(error) => (Some(error.kind), Some(error.message.clone()), false),
        };
        let entry = RowHistoryEntry {
            id: Uuid::new_v4().to_string(),
            row_id: row.id,
            value: row.value.clone(),
            error_kind,
            message,
            preserved,
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.record_history(&entry) {
            tracing::warn!(row_id = row.id, error = %error, "failed to record row history");
        }
    }

    fn prune_history(&self) {
        match self.store.prune_history(self.settings.retention_days) {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "pruned row history"),
            Err(error) => tracing::warn!(error = %error, "failed to prune row history"),
        }
    }

    /// Waits `delay`, returning early (with `true`) when the run is cancelled.
    async fn pause(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => self.cancel.is_cancelled(),
            _ = self.cancel.notify.notified() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_refresh, Scheduler};
    use crate::backend::{BackendFuture, InMemoryBackend, QueryBackend};
    use crate::db::{Database, RowStore};
    use crate::errors::AppResult;
    use crate::models::{
        AppSettings, ControlStatus, Dialect, ErrorKind, ExecutionStatus, MetricRow, QueryOutput, RowError,
        TableCatalog,
    };
    use crate::redaction::Redactor;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;

    fn fast_settings(max_cycles: Option<u64>) -> AppSettings {
        AppSettings {
            inter_row_delay_ms: 0,
            inter_cycle_delay_ms: 0,
            max_cycles,
            ..AppSettings::default()
        }
    }

    fn harness(backend: Arc<dyn QueryBackend>) -> (tempfile::TempDir, Arc<Database>, Scheduler) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("scheduler.db")).expect("db"));
        let scheduler = Scheduler::new(backend, db.clone(), Arc::new(RwLock::new(Redactor::new(true))));
        (dir, db, scheduler)
    }

    fn metric(id: i64) -> MetricRow {
        MetricRow::new(
            id,
            Dialect::SqlServer,
            format!("SELECT {} AS value FROM dbo.Metrics WITH (NOLOCK)", id),
        )
    }

    async fn settle(scheduler: &Scheduler) -> ExecutionStatus {
        for _ in 0..400 {
            let status = scheduler.state().snapshot().await.status;
            if status != ExecutionStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ExecutionStatus::Running
    }

    #[test]
    fn refresh_keeps_a_query_replaced_while_it_ran() {
        let read = metric(1);
        let mut refreshed = metric(1);
        refreshed.value = Some("1".to_string());
        refreshed.sql_expression = "SELECT 1 AS value FROM dbo.Metrics WITH (NOLOCK) WHERE 1 = 1".to_string();

        let mut replaced = metric(1);
        replaced.sql_expression = "SELECT 2 AS value FROM dbo.Fixed WITH (NOLOCK)".to_string();
        merge_refresh(&mut replaced, &refreshed, &read.sql_expression);
        assert_eq!(replaced.sql_expression, "SELECT 2 AS value FROM dbo.Fixed WITH (NOLOCK)");
        assert_eq!(replaced.value.as_deref(), Some("1"));

        let mut untouched = metric(1);
        merge_refresh(&mut untouched, &refreshed, &read.sql_expression);
        assert_eq!(untouched.sql_expression, refreshed.sql_expression);
    }

    #[tokio::test]
    async fn rows_run_in_ascending_id_order() {
        let backend = InMemoryBackend::new();
        backend.fallback(Ok(QueryOutput::single(json!(5))));
        let (_dir, db, scheduler) = harness(Arc::new(backend.clone()));

        let response = scheduler
            .start(vec![metric(30), metric(2), metric(15)], &fast_settings(Some(1)))
            .await;
        assert_eq!(response.status, ControlStatus::Started);
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Complete);

        let order: Vec<String> = backend.calls().into_iter().map(|(_, sql)| sql).collect();
        assert_eq!(
            order,
            vec![metric(2).sql_expression, metric(15).sql_expression, metric(30).sql_expression]
        );
        let state = scheduler.state().snapshot().await;
        assert_eq!(state.snapshot.iter().map(|row| row.id).collect::<Vec<_>>(), vec![2, 15, 30]);
        assert_eq!(state.cycles_completed, 1);
        assert_eq!(db.load_all_rows().expect("rows").len(), 3);
    }

    #[tokio::test]
    async fn three_consecutive_failures_trip_the_breaker() {
        let backend = InMemoryBackend::new();
        backend.fallback(Err(RowError::execution("Invalid object name 'Metrics'")));
        let (_dir, db, scheduler) = harness(Arc::new(backend.clone()));

        scheduler
            .start(vec![metric(1), metric(2), metric(3), metric(4)], &fast_settings(None))
            .await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Error);

        let state = scheduler.state().snapshot().await;
        let message = state.last_error.expect("breaker message");
        assert!(message.contains("Invalid object name"), "{}", message);
        assert_eq!(backend.calls().len(), 3);
        assert_eq!(state.snapshot.len(), 4);
        let failed = db.get_row(3).expect("get").expect("row");
        assert_eq!(failed.error_kind, Some(ErrorKind::Execution));
    }

    #[tokio::test]
    async fn success_between_failures_resets_the_breaker() {
        let backend = InMemoryBackend::new();
        backend
            .push_error(RowError::connection("down"))
            .push_value(json!(12))
            .push_error(RowError::connection("down"))
            .push_error(RowError::connection("down"));
        let (_dir, _db, scheduler) = harness(Arc::new(backend));

        scheduler
            .start(vec![metric(1), metric(2), metric(3), metric(4)], &fast_settings(Some(1)))
            .await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Complete);
        let state = scheduler.state().snapshot().await;
        assert!(state.last_error.is_none());
        assert_eq!(state.snapshot[1].value.as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn zero_result_keeps_previous_value() {
        let backend = InMemoryBackend::new();
        backend.push_value(json!(0));
        let (_dir, _db, scheduler) = harness(Arc::new(backend));
        let mut row = metric(9);
        row.value = Some("42".to_string());

        scheduler.start(vec![row], &fast_settings(Some(1))).await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Complete);
        let refreshed = &scheduler.state().snapshot().await.snapshot[0];
        assert_eq!(refreshed.value.as_deref(), Some("42"));
        assert!(refreshed.anomaly.is_some());
        assert!(refreshed.error.is_none());
    }

    #[tokio::test]
    async fn second_start_reports_running_and_stop_discards_in_flight_result() {
        let backend = InMemoryBackend::new();
        backend
            .fallback(Ok(QueryOutput::single(json!(7))))
            .with_latency(Duration::from_millis(80));
        let (_dir, db, scheduler) = harness(Arc::new(backend));

        scheduler.start(vec![metric(1), metric(2)], &fast_settings(None)).await;
        let again = scheduler.start(vec![metric(3)], &fast_settings(None)).await;
        assert_eq!(again.status, ControlStatus::AlreadyRunning);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopped = scheduler.stop().await;
        assert_eq!(stopped.status, ControlStatus::Stopped);
        let state = stopped.execution_state.expect("state");
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert_eq!(state.active_row_id, None);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let state = scheduler.state().snapshot().await;
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.snapshot[0].value.is_none());
        assert!(db.get_row(1).expect("get").is_none());
        assert!(!scheduler.is_worker_running().await);
    }

    #[tokio::test]
    async fn reset_clears_error_but_keeps_snapshot() {
        let backend = InMemoryBackend::new();
        backend.fallback(Err(RowError::connection("unreachable")));
        let (_dir, _db, scheduler) = harness(Arc::new(backend));
        let mut settings = fast_settings(None);
        settings.failure_threshold = 1;

        scheduler.start(vec![metric(5)], &settings).await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Error);
        let response = scheduler.reset().await;
        assert_eq!(response.status, ControlStatus::Reset);
        let state = scheduler.state().snapshot().await;
        assert_eq!(state.status, ExecutionStatus::Idle);
        assert!(state.last_error.is_none());
        assert_eq!(state.snapshot.len(), 1);
    }

    #[tokio::test]
    async fn empty_run_completes_immediately() {
        let (_dir, _db, scheduler) = harness(Arc::new(InMemoryBackend::new()));
        let response = scheduler.start(Vec::new(), &fast_settings(None)).await;
        assert_eq!(response.status, ControlStatus::Started);
        assert_eq!(scheduler.state().snapshot().await.status, ExecutionStatus::Complete);
    }

    #[tokio::test]
    async fn slow_query_times_out_as_connection_failure() {
        let backend = InMemoryBackend::new();
        backend
            .fallback(Ok(QueryOutput::single(json!(1))))
            .with_latency(Duration::from_millis(1_500));
        let (_dir, _db, scheduler) = harness(Arc::new(backend));
        let mut settings = fast_settings(Some(1));
        settings.query_timeout_seconds = 1;

        scheduler.start(vec![metric(1)], &settings).await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Complete);
        let row = &scheduler.state().snapshot().await.snapshot[0];
        assert_eq!(row.error_kind, Some(ErrorKind::Connection));
        assert_eq!(row.error.as_deref(), Some("Query timed out after 1s"));
    }

    #[tokio::test]
    async fn write_statements_never_reach_the_backend() {
        let backend = InMemoryBackend::new();
        backend.fallback(Ok(QueryOutput::single(json!(1))));
        let (_dir, _db, scheduler) = harness(Arc::new(backend.clone()));
        let row = MetricRow::new(1, Dialect::Access, "DELETE FROM Orders");

        scheduler.start(vec![row], &fast_settings(Some(1))).await;
        settle(&scheduler).await;
        assert!(backend.calls().is_empty());
        let row = &scheduler.state().snapshot().await.snapshot[0];
        assert_eq!(row.error_kind, Some(ErrorKind::Other));
    }

    struct PanickingBackend;

    impl QueryBackend for PanickingBackend {
        fn execute<'a>(
            &'a self,
            _dialect: Dialect,
            _sql: &'a str,
        ) -> BackendFuture<'a, Result<QueryOutput, RowError>> {
            Box::pin(explode())
        }

        fn catalog(&self, _dialect: Dialect) -> BackendFuture<'_, AppResult<TableCatalog>> {
            Box::pin(empty_catalog())
        }
    }

    async fn explode() -> Result<QueryOutput, RowError> {
        panic!("driver exploded")
    }

    async fn empty_catalog() -> AppResult<TableCatalog> {
        Ok(TableCatalog::default())
    }

    #[tokio::test]
    async fn panicking_cycle_sets_error() {
        let (_dir, _db, scheduler) = harness(Arc::new(PanickingBackend));
        scheduler.start(vec![metric(1)], &fast_settings(None)).await;
        assert_eq!(settle(&scheduler).await, ExecutionStatus::Error);
        let message = scheduler.state().snapshot().await.last_error.expect("message");
        assert_eq!(message, "cycle task aborted: driver exploded");
    }
}
