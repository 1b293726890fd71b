use crate::models::{CycleInfo, ExecutionState, ExecutionStatus, MetricRow, StatusView};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared execution state. The cycle task is the only writer while a run is live and
/// every write it makes carries its run token; writes from a superseded run are dropped.
#[derive(Clone, Default)]
pub struct ExecutionStateHandle {
    inner: Arc<RwLock<ExecutionState>>,
    current_token: Arc<AtomicU64>,
}

impl ExecutionStateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ExecutionState {
        self.inner.read().await.clone()
    }

    pub async fn row(&self, id: i64) -> Option<MetricRow> {
        let state = self.inner.read().await;
        state.snapshot.iter().find(|row| row.id == id).cloned()
    }

    /// Invalidates every outstanding token and returns a fresh one.
    pub fn next_token(&self) -> u64 {
        self.current_token.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current_token.load(Ordering::SeqCst) == token
    }

    /// Applies `change` only if `token` still names the live run.
    pub async fn update_if_current<F>(&self, token: u64, change: F) -> bool
    where
        F: FnOnce(&mut ExecutionState),
    {
        let mut state = self.inner.write().await;
        if !self.is_current(token) {
            tracing::debug!(run_token = token, "dropping state write from superseded run");
            return false;
        }
        change(&mut state);
        state.updated_at = Some(Utc::now());
        true
    }

    /// Unconditional write, for operator actions.
    pub async fn update<F>(&self, change: F) -> ExecutionState
    where
        F: FnOnce(&mut ExecutionState),
    {
        let mut state = self.inner.write().await;
        change(&mut state);
        state.updated_at = Some(Utc::now());
        state.clone()
    }
}

pub fn cycle_info(state: &ExecutionState) -> CycleInfo {
    let total_rows = state.snapshot.len();
    let current_row = state.rows_completed.min(total_rows);
    let percent_complete = if total_rows == 0 {
        0
    } else {
        (current_row * 100 / total_rows) as u8
    };
    CycleInfo {
        current_row,
        total_rows,
        percent_complete,
        is_cycle_complete: total_rows > 0 && current_row == total_rows,
    }
}

pub fn status_view(
    state: ExecutionState,
    is_worker_running: bool,
    recent_window_seconds: i64,
    now: DateTime<Utc>,
) -> StatusView {
    let window_start = now - Duration::seconds(recent_window_seconds.max(0));
    let recently_updated = state
        .snapshot
        .iter()
        .filter_map(|row| row.last_updated_at)
        .any(|updated| updated >= window_start);
    let has_data = state.snapshot.iter().any(|row| row.value.is_some());
    StatusView {
        cycle_info: cycle_info(&state),
        is_worker_running: is_worker_running && state.status == ExecutionStatus::Running,
        has_data,
        recently_updated,
        execution_state: state,
    }
}

#[cfg(test)]
mod tests {
    use super::{cycle_info, status_view, ExecutionStateHandle};
    use crate::models::{Dialect, ExecutionState, ExecutionStatus, MetricRow};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn stale_token_cannot_write() {
        let handle = ExecutionStateHandle::new();
        let first = handle.next_token();
        let second = handle.next_token();
        assert!(!handle.update_if_current(first, |state| state.status = ExecutionStatus::Error).await);
        assert!(handle.update_if_current(second, |state| state.status = ExecutionStatus::Running).await);
        assert_eq!(handle.snapshot().await.status, ExecutionStatus::Running);
    }

    #[test]
    fn progress_counts_completed_rows() {
        let mut state = ExecutionState::default();
        state.snapshot = (1..=4).map(|id| MetricRow::new(id, Dialect::Access, "SELECT 1")).collect();
        state.rows_completed = 1;
        let info = cycle_info(&state);
        assert_eq!((info.current_row, info.total_rows, info.percent_complete), (1, 4, 25));
        assert!(!info.is_cycle_complete);
        state.rows_completed = 4;
        assert!(cycle_info(&state).is_cycle_complete);
        assert!(!cycle_info(&ExecutionState::default()).is_cycle_complete);
    }

    #[test]
    fn recent_updates_use_the_window() {
        let now = Utc::now();
        let mut row = MetricRow::new(1, Dialect::SqlServer, "SELECT 1");
        row.value = Some("5".to_string());
        row.last_updated_at = Some(now - Duration::seconds(4));
        let mut state = ExecutionState::default();
        state.status = ExecutionStatus::Running;
        state.snapshot = vec![row];

        let view = status_view(state.clone(), true, 10, now);
        assert!(view.recently_updated && view.has_data && view.is_worker_running);
        let view = status_view(state, true, 2, now);
        assert!(!view.recently_updated);
    }
}
