use super::{BackendFuture, QueryBackend};
use crate::errors::{AppError, AppResult};
use crate::models::{Dialect, QueryOutput, RowError, TableCatalog};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Outcome = Result<QueryOutput, RowError>;

#[derive(Default)]
struct Script {
    queued: VecDeque<Outcome>,
    by_sql: HashMap<String, Outcome>,
    fallback: Option<Outcome>,
    catalogs: HashMap<Dialect, TableCatalog>,
    calls: Vec<(Dialect, String)>,
    latency: Duration,
}

/// Scripted backend. Queued outcomes are consumed in call order, then exact-SQL
/// outcomes are looked up, then the fallback answers.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    script: Arc<Mutex<Script>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_value(&self, value: Value) -> &Self {
        self.push(Ok(QueryOutput::single(value)))
    }

    pub fn push_error(&self, error: RowError) -> &Self {
        self.push(Err(error))
    }

    pub fn push(&self, outcome: Outcome) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.queued.push_back(outcome);
        }
        self
    }

    pub fn answer(&self, sql: &str, outcome: Outcome) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.by_sql.insert(sql.to_string(), outcome);
        }
        self
    }

    pub fn fallback(&self, outcome: Outcome) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.fallback = Some(outcome);
        }
        self
    }

    pub fn with_catalog(&self, dialect: Dialect, catalog: TableCatalog) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.catalogs.insert(dialect, catalog);
        }
        self
    }

    pub fn with_latency(&self, latency: Duration) -> &Self {
        if let Ok(mut script) = self.script.lock() {
            script.latency = latency;
        }
        self
    }

    /// Every `(dialect, sql)` pair executed so far.
    pub fn calls(&self) -> Vec<(Dialect, String)> {
        self.script
            .lock()
            .map(|script| script.calls.clone())
            .unwrap_or_default()
    }

    fn next_outcome(&self, dialect: Dialect, sql: &str) -> (Outcome, Duration) {
        let Ok(mut script) = self.script.lock() else {
            return (Err(RowError::other("backend script poisoned")), Duration::ZERO);
        };
        script.calls.push((dialect, sql.to_string()));
        let outcome = script
            .queued
            .pop_front()
            .or_else(|| script.by_sql.get(sql).cloned())
            .or_else(|| script.fallback.clone())
            .unwrap_or_else(|| Err(RowError::execution(format!("no scripted answer for: {}", sql))));
        (outcome, script.latency)
    }
}

impl QueryBackend for InMemoryBackend {
    fn execute<'a>(
        &'a self,
        dialect: Dialect,
        sql: &'a str,
    ) -> BackendFuture<'a, Result<QueryOutput, RowError>> {
        Box::pin(async move {
            let (outcome, latency) = self.next_outcome(dialect, sql);
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            outcome
        })
    }

    fn catalog(&self, dialect: Dialect) -> BackendFuture<'_, AppResult<TableCatalog>> {
        Box::pin(async move {
            self.script
                .lock()
                .ok()
                .and_then(|script| script.catalogs.get(&dialect).cloned())
                .ok_or_else(|| AppError::Backend(format!("no catalog for {}", dialect.as_str())))
        })
    }
}
