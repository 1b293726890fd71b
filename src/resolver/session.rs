use super::CandidateMatch;
use crate::dialect::sqltext::substitute_from_table;
use crate::errors::{AppError, AppResult};
use crate::models::{Dialect, RowError};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ResolutionState {
    Proposing,
    #[serde(rename_all = "camelCase")]
    AwaitingTrial { table: String },
    #[serde(rename_all = "camelCase")]
    AwaitingDecision {
        table: String,
        sql: String,
        sample_value: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Accepted { table: String, sql: String },
    NoResult,
}

impl ResolutionState {
    fn label(&self) -> String {
        match self {
            Self::Proposing => "proposing".to_string(),
            Self::AwaitingTrial { table } => format!("awaitingTrial:{}", table),
            Self::AwaitingDecision { table, .. } => format!("awaitingDecision:{}", table),
            Self::Accepted { table, .. } => format!("accepted:{}", table),
            Self::NoResult => "noResult".to_string(),
        }
    }
}

/// One operator-driven walk through the ranked candidates for a row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionSession {
    pub session_id: String,
    pub row_id: i64,
    pub backend: Dialect,
    pub original_sql: String,
    pub candidates: Vec<CandidateMatch>,
    pub cursor: usize,
    pub state: ResolutionState,
    /// Every state entered, including the transient match and skip events.
    pub transitions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ResolutionSession {
    pub fn new(row_id: i64, backend: Dialect, original_sql: impl Into<String>) -> Self {
        let state = ResolutionState::Proposing;
        Self {
            session_id: Uuid::new_v4().to_string(),
            row_id,
            backend,
            original_sql: original_sql.into(),
            candidates: Vec::new(),
            cursor: 0,
            transitions: vec![state.label()],
            state,
            created_at: Utc::now(),
        }
    }

    pub fn propose(&mut self, candidates: Vec<CandidateMatch>) -> AppResult<()> {
        if self.state != ResolutionState::Proposing {
            return Err(self.invalid_transition("propose"));
        }
        self.candidates = candidates;
        self.cursor = 0;
        self.enter_candidate();
        Ok(())
    }

    pub fn current_table(&self) -> Option<&str> {
        match &self.state {
            ResolutionState::AwaitingTrial { table }
            | ResolutionState::AwaitingDecision { table, .. }
            | ResolutionState::Accepted { table, .. } => Some(table),
            _ => None,
        }
    }

    /// The original query pointed at the candidate awaiting trial.
    pub fn trial_sql(&self) -> AppResult<String> {
        let ResolutionState::AwaitingTrial { table } = &self.state else {
            return Err(self.invalid_transition("trial"));
        };
        substitute_from_table(&self.original_sql, table).ok_or_else(|| {
            AppError::Validation(format!("row {} query has no FROM table", self.row_id))
        })
    }

    /// A successful trial is a match awaiting the operator's decision; a failed one
    /// moves on to the next candidate.
    pub fn record_trial(&mut self, outcome: Result<Option<String>, RowError>) -> AppResult<()> {
        let sql = self.trial_sql()?;
        let table = self.current_table().unwrap_or_default().to_string();
        match outcome {
            Ok(sample_value) => {
                self.transitions.push(format!("matchFound:{}", table));
                self.set_state(ResolutionState::AwaitingDecision {
                    table,
                    sql,
                    sample_value,
                });
            }
            Err(error) => {
                tracing::debug!(row_id = self.row_id, table = %table, error = %error, "candidate trial failed");
                self.transitions.push(format!("trialFailed:{}", table));
                self.advance();
            }
        }
        Ok(())
    }

    /// Commits the tried query. Returns the SQL to store on the row.
    pub fn accept(&mut self) -> AppResult<String> {
        let ResolutionState::AwaitingDecision { table, sql, .. } = &self.state else {
            return Err(self.invalid_transition("accept"));
        };
        let accepted = ResolutionState::Accepted {
            table: table.clone(),
            sql: sql.clone(),
        };
        let sql = sql.clone();
        self.set_state(accepted);
        Ok(sql)
    }

    pub fn skip(&mut self) -> AppResult<()> {
        let table = match &self.state {
            ResolutionState::AwaitingTrial { table }
            | ResolutionState::AwaitingDecision { table, .. } => table.clone(),
            _ => return Err(self.invalid_transition("skip")),
        };
        self.transitions.push(format!("skipped:{}", table));
        self.advance();
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ResolutionState::Accepted { .. } | ResolutionState::NoResult
        )
    }

    fn advance(&mut self) {
        self.cursor += 1;
        self.enter_candidate();
    }

    fn enter_candidate(&mut self) {
        let next = match self.candidates.get(self.cursor) {
            Some(candidate) => ResolutionState::AwaitingTrial {
                table: candidate.table_name.clone(),
            },
            None => ResolutionState::NoResult,
        };
        self.set_state(next);
    }

    fn set_state(&mut self, state: ResolutionState) {
        self.transitions.push(state.label());
        self.state = state;
    }

    fn invalid_transition(&self, action: &str) -> AppError {
        AppError::Policy(format!(
            "cannot {} resolution session {} in state {}",
            action,
            self.session_id,
            self.state.label()
        ))
    }
}

/// Sessions nobody finished are dropped after this long.
const ABANDONED_SESSION_HOURS: i64 = 24;

/// Live sessions only. A session that reaches `accepted` or `noResult` is returned to
/// the caller one last time and then forgotten.
#[derive(Clone, Default)]
pub struct ResolutionSessions {
    sessions: Arc<Mutex<HashMap<String, ResolutionSession>>>,
}

impl ResolutionSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: ResolutionSession) -> ResolutionSession {
        let mut sessions = self.sessions.lock().await;
        let cutoff = Utc::now() - Duration::hours(ABANDONED_SESSION_HOURS);
        sessions.retain(|_, live| live.created_at >= cutoff);
        if !session.is_finished() {
            sessions.insert(session.session_id.clone(), session.clone());
        }
        session
    }

    pub async fn get(&self, session_id: &str) -> AppResult<ResolutionSession> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("No resolution session {}", session_id)))
    }

    /// Applies `change` under the lock and returns the updated session with its result.
    pub async fn update<T, F>(&self, session_id: &str, change: F) -> AppResult<(ResolutionSession, T)>
    where
        F: FnOnce(&mut ResolutionSession) -> AppResult<T>,
    {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Err(AppError::NotFound(format!("No resolution session {}", session_id)));
        };
        let output = change(session)?;
        let view = session.clone();
        if view.is_finished() {
            sessions.remove(session_id);
        }
        Ok((view, output))
    }

    pub async fn live_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
