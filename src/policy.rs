use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, MetricRow, RowError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

const MIN_TIMEOUT_SECONDS: u64 = 1;
const MAX_TIMEOUT_SECONDS: u64 = 600;
const MAX_INTER_ROW_DELAY_MS: u64 = 60_000;
const MAX_INTER_CYCLE_DELAY_MS: u64 = 86_400_000;
const MIN_FAILURE_THRESHOLD: u32 = 1;
const MAX_FAILURE_THRESHOLD: u32 = 100;
const MAX_RECENT_WINDOW_SECONDS: i64 = 3_600;
const MIN_RETENTION_DAYS: u32 = 1;
const MAX_RETENTION_DAYS: u32 = 3_650;
const MAX_ROWS_PER_RUN: usize = 10_000;

static LEADING_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^(?:\s*(?:--[^\n]*(?:\n|$)|/\*.*?\*/))*\s*").expect("valid comment regex"));
static FIRST_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(*\s*([A-Za-z]+)").expect("valid first word regex"));

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    blocked_statements: BTreeSet<String>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        let blocked_statements = [
            "insert", "update", "delete", "merge", "drop", "create", "alter", "truncate", "exec",
            "execute", "grant", "revoke", "deny", "into", "bulk", "backup", "restore", "use",
        ]
        .into_iter()
        .map(ToString::to_string)
        .collect();
        Self { blocked_statements }
    }

    pub fn validate_settings(&self, settings: &AppSettings) -> AppResult<()> {
        if !(MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&settings.query_timeout_seconds) {
            return Err(AppError::Policy(format!(
                "queryTimeoutSeconds must be between {} and {}",
                MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS
            )));
        }
        if settings.inter_row_delay_ms > MAX_INTER_ROW_DELAY_MS {
            return Err(AppError::Policy(format!(
                "interRowDelayMs must be at most {}",
                MAX_INTER_ROW_DELAY_MS
            )));
        }
        if settings.inter_cycle_delay_ms > MAX_INTER_CYCLE_DELAY_MS {
            return Err(AppError::Policy(format!(
                "interCycleDelayMs must be at most {}",
                MAX_INTER_CYCLE_DELAY_MS
            )));
        }
        if !(MIN_FAILURE_THRESHOLD..=MAX_FAILURE_THRESHOLD).contains(&settings.failure_threshold) {
            return Err(AppError::Policy(format!(
                "failureThreshold must be between {} and {}",
                MIN_FAILURE_THRESHOLD, MAX_FAILURE_THRESHOLD
            )));
        }
        if settings.max_cycles == Some(0) {
            return Err(AppError::Policy("maxCycles must be positive when set".to_string()));
        }
        if !(0..=MAX_RECENT_WINDOW_SECONDS).contains(&settings.recent_window_seconds) {
            return Err(AppError::Policy(format!(
                "recentWindowSeconds must be between 0 and {}",
                MAX_RECENT_WINDOW_SECONDS
            )));
        }
        if !(MIN_RETENTION_DAYS..=MAX_RETENTION_DAYS).contains(&settings.retention_days) {
            return Err(AppError::Policy(format!(
                "retentionDays must be between {} and {}",
                MIN_RETENTION_DAYS, MAX_RETENTION_DAYS
            )));
        }
        Ok(())
    }

    /// Rejects run payloads the worker cannot process sensibly.
    pub fn validate_rows(&self, rows: &[MetricRow]) -> AppResult<()> {
        if rows.len() > MAX_ROWS_PER_RUN {
            return Err(AppError::Policy(format!(
                "a run may contain at most {} rows",
                MAX_ROWS_PER_RUN
            )));
        }
        let mut seen = BTreeSet::new();
        for row in rows {
            if !seen.insert(row.id) {
                return Err(AppError::Validation(format!("duplicate row id {}", row.id)));
            }
        }
        Ok(())
    }

    /// Metric queries are reads. Anything whose leading keyword modifies data or
    /// schema is refused before it reaches a backend.
    pub fn ensure_read_only(&self, sql: &str) -> Result<(), RowError> {
        let body = LEADING_COMMENT_RE
            .find(sql)
            .map(|found| &sql[found.end()..])
            .unwrap_or(sql);
        let Some(word) = FIRST_WORD_RE
            .captures(body)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
        else {
            return Err(RowError::other("query does not start with a statement keyword"));
        };
        if self.blocked_statements.contains(&word) {
            return Err(RowError::other(format!(
                "statement '{}' is not allowed for metric queries",
                word.to_ascii_uppercase()
            )));
        }
        if has_chained_statement(body) {
            return Err(RowError::other("metric queries must be a single statement"));
        }
        Ok(())
    }
}

/// True when a `;` outside literals and comments is followed by more SQL.
fn has_chained_statement(sql: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut index = 0;
    let mut terminated = false;
    while index < bytes.len() {
        match bytes[index] {
            b'\'' | b'"' | b'[' if terminated => return true,
            quote @ (b'\'' | b'"') => {
                index += 1;
                while index < bytes.len() {
                    if bytes[index] == quote {
                        // Doubled quotes escape themselves.
                        if bytes.get(index + 1) == Some(&quote) {
                            index += 1;
                        } else {
                            break;
                        }
                    }
                    index += 1;
                }
            }
            b'[' => {
                while index < bytes.len() && bytes[index] != b']' {
                    index += 1;
                }
            }
            b'-' if bytes.get(index + 1) == Some(&b'-') => {
                while index < bytes.len() && bytes[index] != b'\n' {
                    index += 1;
                }
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index += 2;
                while index + 1 < bytes.len() && !(bytes[index] == b'*' && bytes[index + 1] == b'/') {
                    index += 1;
                }
                index += 1;
            }
            b';' => terminated = true,
            byte if terminated && !byte.is_ascii_whitespace() => return true,
            _ => {}
        }
        index += 1;
    }
    false
}
