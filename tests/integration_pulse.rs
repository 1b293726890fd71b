use metric_pulse::backend::InMemoryBackend;
use metric_pulse::db::{Database, RowStore};
use metric_pulse::models::{
    Dialect, ExecutionStatus, OpenResolutionPayload, QueryOutput, RowError, StartRunPayload,
    TableCatalog,
};
use metric_pulse::resolver::ResolutionState;
use metric_pulse::runner::RunnerCore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEFINITIONS: &str = r#"
rows:
  - id: 20
    chartGroup: Sales
    variableName: Revenue
    backend: sql-server
    sql: SELECT SUM(Total) FROM dbo.Orders WITH (NOLOCK)
  - id: 10
    chartGroup: Warehouse
    variableName: Units Count
    backend: access
    sql: SELECT COUNT(*) AS value FROM Inventory
  - id: 30
    chartGroup: Shipping
    variableName: Late Orders
    backend: sql-server
    sql: SELECT COUNT(*) AS value FROM dbo.Shipmnts WHERE ship_date > due_date
"#;

fn setup(backend: &InMemoryBackend) -> (tempfile::TempDir, Arc<Database>, Arc<RunnerCore>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let definitions = dir.path().join("metrics.yaml");
    std::fs::write(&definitions, DEFINITIONS).expect("write definitions");

    let db = Arc::new(Database::new(&dir.path().join("pulse.db")).expect("db"));
    let runner = RunnerCore::new(db.clone(), Arc::new(backend.clone())).expect("runner");
    assert_eq!(runner.seed_definitions(&definitions).expect("seed"), 3);
    assert_eq!(runner.seed_definitions(&definitions).expect("reseed"), 0);
    (dir, db, runner)
}

async fn wait_until_settled(runner: &RunnerCore) -> ExecutionStatus {
    for _ in 0..400 {
        let status = runner.status().await.expect("status").execution_state.status;
        if status != ExecutionStatus::Running {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ExecutionStatus::Running
}

#[tokio::test]
async fn bounded_run_refreshes_formats_and_records_history() {
    let backend = InMemoryBackend::new();
    backend
        .push_value(json!(48))
        .push_value(json!(1234.5))
        .push_error(RowError::execution("Invalid object name 'dbo.Shipmnts'."))
        .push_value(json!(0))
        .push_value(json!(1300))
        .push_error(RowError::execution("Invalid object name 'dbo.Shipmnts'."));
    let (_dir, db, runner) = setup(&backend);
    runner
        .update_settings(json!({ "interRowDelayMs": 0, "interCycleDelayMs": 0, "maxCycles": 2 }))
        .await
        .expect("settings");

    runner.start_run(StartRunPayload::default()).await.expect("start");
    assert_eq!(wait_until_settled(&runner).await, ExecutionStatus::Complete);

    let calls = backend.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0].0, Dialect::Access);
    assert!(calls[1].1.contains("AS value"), "{}", calls[1].1);

    let view = runner.status().await.expect("status");
    assert_eq!(view.execution_state.cycles_completed, 2);
    assert!(view.cycle_info.is_cycle_complete);
    assert!(view.has_data);
    assert!(!view.is_worker_running);

    let units = db.get_row(10).expect("get").expect("row");
    assert_eq!(units.value.as_deref(), Some("48"));
    assert!(units.anomaly.is_some());
    let revenue = db.get_row(20).expect("get").expect("row");
    assert_eq!(revenue.value.as_deref(), Some("$1,300"));
    let late = db.get_row(30).expect("get").expect("row");
    assert!(late.value.is_none());
    assert!(late.error.as_deref().unwrap_or_default().contains("Shipmnts"));

    let history = runner.row_history(10, None).expect("history");
    assert_eq!(history.len(), 2);
    assert!(history[0].preserved);
}

#[tokio::test]
async fn resolver_repairs_a_broken_table_reference() {
    let backend = InMemoryBackend::new();
    backend.with_catalog(
        Dialect::SqlServer,
        TableCatalog::default()
            .with_table("Shipments", &["ship_date", "due_date", "carrier"])
            .with_table("Customers", &["name", "region"]),
    );
    let (_dir, db, runner) = setup(&backend);

    let session = runner
        .open_resolution(OpenResolutionPayload { row_id: 30, label: None })
        .await
        .expect("open");
    assert_eq!(session.candidates[0].table_name, "Shipments");
    assert_eq!(session.candidates[0].column_score, 1.0);

    backend.answer(
        "SELECT COUNT(*) AS value FROM dbo.Shipments WHERE ship_date > due_date",
        Ok(QueryOutput::single(json!(17))),
    );
    let session = runner.trial_resolution(&session.session_id).await.expect("trial");
    assert!(matches!(session.state, ResolutionState::AwaitingDecision { .. }));

    runner.accept_resolution(&session.session_id).await.expect("accept");
    let repaired = db.get_row(30).expect("get").expect("row");
    assert_eq!(
        repaired.sql_expression,
        "SELECT COUNT(*) AS value FROM dbo.Shipments WHERE ship_date > due_date"
    );
}
