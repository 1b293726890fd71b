use crate::errors::{AppError, AppResult};
use crate::models::{AppSettings, Dialect, ErrorKind, MetricRow, RowHistoryEntry};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const ROW_COLUMNS: &str = "id, chart_group, variable_name, backend, sql_expression, value, error, \
     error_kind, last_error_at, last_updated_at, anomaly";

/// Persistence the refresh cycle depends on.
pub trait RowStore: Send + Sync {
    fn load_all_rows(&self) -> AppResult<Vec<MetricRow>>;
    fn get_row(&self, id: i64) -> AppResult<Option<MetricRow>>;
    fn save_row(&self, row: &MetricRow) -> AppResult<()>;
    /// Inserts rows whose id is not stored yet; existing rows are left alone.
    fn seed_rows(&self, rows: &[MetricRow]) -> AppResult<usize>;
    fn record_history(&self, entry: &RowHistoryEntry) -> AppResult<()>;
    fn list_history(&self, row_id: i64, limit: usize) -> AppResult<Vec<RowHistoryEntry>>;
    fn prune_history(&self, retention_days: u32) -> AppResult<usize>;
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(serde_json::from_str::<AppSettings>(&raw).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    /// Merges `update` over the stored settings. The merged value is returned
    /// without being written so callers can validate it first.
    pub fn merged_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid settings: {}", error)))
    }

    pub fn save_settings(&self, settings: &AppSettings) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(settings)?, stamp(Utc::now())],
        )?;
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![serde_json::to_string(&AppSettings::default())?, stamp(Utc::now())],
            )?;
        }
        Ok(())
    }
}

impl RowStore for Database {
    fn load_all_rows(&self) -> AppResult<Vec<MetricRow>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM metric_rows ORDER BY id ASC", ROW_COLUMNS))?;
        let rows = stmt.query_map([], parse_metric_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn get_row(&self, id: i64) -> AppResult<Option<MetricRow>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM metric_rows WHERE id = ?1", ROW_COLUMNS),
                [id],
                parse_metric_row,
            )
            .optional()?;
        Ok(row)
    }

    fn save_row(&self, row: &MetricRow) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metric_rows (
               id, chart_group, variable_name, backend, sql_expression, value, error,
               error_kind, last_error_at, last_updated_at, anomaly
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               chart_group = excluded.chart_group,
               variable_name = excluded.variable_name,
               backend = excluded.backend,
               sql_expression = excluded.sql_expression,
               value = excluded.value,
               error = excluded.error,
               error_kind = excluded.error_kind,
               last_error_at = excluded.last_error_at,
               last_updated_at = excluded.last_updated_at,
               anomaly = excluded.anomaly",
            params![
                row.id,
                row.chart_group,
                row.variable_name,
                row.backend.as_str(),
                row.sql_expression,
                row.value,
                row.error,
                row.error_kind.map(ErrorKind::as_str),
                row.last_error_at.map(stamp),
                row.last_updated_at.map(stamp),
                row.anomaly,
            ],
        )?;
        Ok(())
    }

    fn seed_rows(&self, rows: &[MetricRow]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0usize;
        for row in rows {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO metric_rows (id, chart_group, variable_name, backend, sql_expression)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id,
                    row.chart_group,
                    row.variable_name,
                    row.backend.as_str(),
                    row.sql_expression,
                ],
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn record_history(&self, entry: &RowHistoryEntry) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO row_history (id, row_id, value, error_kind, message, preserved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.row_id,
                entry.value,
                entry.error_kind.map(ErrorKind::as_str),
                entry.message,
                entry.preserved,
                stamp(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn list_history(&self, row_id: i64, limit: usize) -> AppResult<Vec<RowHistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, row_id, value, error_kind, message, preserved, created_at
             FROM row_history
             WHERE row_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![row_id, limit as i64], |row| {
            Ok(RowHistoryEntry {
                id: row.get(0)?,
                row_id: row.get(1)?,
                value: row.get(2)?,
                error_kind: parse_error_kind(row.get::<_, Option<String>>(3)?),
                message: row.get(4)?,
                preserved: row.get(5)?,
                created_at: parse_time(&row.get::<_, String>(6)?)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn prune_history(&self, retention_days: u32) -> AppResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM row_history WHERE created_at < ?1", [stamp(cutoff)])?;
        Ok(removed)
    }
}

fn parse_metric_row(row: &Row<'_>) -> rusqlite::Result<MetricRow> {
    let backend_raw: String = row.get(3)?;
    let backend = backend_raw.parse::<Dialect>().map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error)),
        )
    })?;
    Ok(MetricRow {
        id: row.get(0)?,
        chart_group: row.get(1)?,
        variable_name: row.get(2)?,
        backend,
        sql_expression: row.get(4)?,
        value: row.get(5)?,
        error: row.get(6)?,
        error_kind: parse_error_kind(row.get::<_, Option<String>>(7)?),
        last_error_at: parse_optional_time(row.get(8)?)?,
        last_updated_at: parse_optional_time(row.get(9)?)?,
        anomaly: row.get(10)?,
    })
}

fn parse_error_kind(raw: Option<String>) -> Option<ErrorKind> {
    raw.and_then(|raw| raw.parse::<ErrorKind>().ok())
}

/// Fixed-width UTC timestamps so text comparison orders them.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_optional_time(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Database, RowStore};
    use crate::models::{Dialect, ErrorKind, MetricRow, RowError, RowHistoryEntry};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("metric-pulse.db")).expect("db");
        (dir, db)
    }

    #[test]
    fn save_and_reload_row() {
        let (_dir, db) = open();
        let mut row = MetricRow::new(15, Dialect::Access, "SELECT COUNT(*) AS value FROM Orders");
        row.chart_group = "Sales".to_string();
        row.value = Some("12".to_string());
        row.record_failure(&RowError::connection("timed out"), Utc::now());
        db.save_row(&row).expect("save");

        let loaded = db.get_row(15).expect("get").expect("row");
        assert_eq!(loaded.backend, Dialect::Access);
        assert_eq!(loaded.value.as_deref(), Some("12"));
        assert_eq!(loaded.error_kind, Some(ErrorKind::Connection));
        assert!(loaded.last_error_at.is_some());
        assert!(db.get_row(99).expect("get").is_none());
    }

    #[test]
    fn seeding_never_clobbers_existing_rows() {
        let (_dir, db) = open();
        let mut existing = MetricRow::new(2, Dialect::SqlServer, "SELECT 1");
        existing.value = Some("$40".to_string());
        db.save_row(&existing).expect("save");

        let inserted = db
            .seed_rows(&[
                MetricRow::new(2, Dialect::SqlServer, "SELECT 2"),
                MetricRow::new(30, Dialect::Access, "SELECT 3"),
            ])
            .expect("seed");
        assert_eq!(inserted, 1);

        let rows = db.load_all_rows().expect("rows");
        assert_eq!(rows.iter().map(|row| row.id).collect::<Vec<_>>(), vec![2, 30]);
        assert_eq!(rows[0].sql_expression, "SELECT 1");
        assert_eq!(rows[0].value.as_deref(), Some("$40"));
    }

    #[test]
    fn history_lists_newest_first_and_prunes() {
        let (_dir, db) = open();
        let now = Utc::now();
        for (index, age_days) in [40i64, 1, 0].into_iter().enumerate() {
            db.record_history(&RowHistoryEntry {
                id: format!("h{}", index),
                row_id: 7,
                value: Some(index.to_string()),
                error_kind: None,
                message: None,
                preserved: false,
                created_at: now - Duration::days(age_days),
            })
            .expect("record");
        }

        let history = db.list_history(7, 10).expect("history");
        assert_eq!(history.first().map(|entry| entry.id.as_str()), Some("h2"));
        assert_eq!(db.prune_history(30).expect("prune"), 1);
        assert_eq!(db.list_history(7, 10).expect("history").len(), 2);
    }

    #[test]
    fn settings_merge_over_defaults() {
        let (_dir, db) = open();
        assert_eq!(db.get_settings().expect("settings").failure_threshold, 3);
        let updated = db
            .merged_settings(json!({ "interRowDelayMs": 0, "maxCycles": 2 }))
            .expect("merge");
        assert_eq!(db.get_settings().expect("settings").inter_row_delay_ms, 500);
        db.save_settings(&updated).expect("save");
        assert_eq!(updated.inter_row_delay_ms, 0);
        assert_eq!(updated.max_cycles, Some(2));
        assert_eq!(updated.query_timeout_seconds, 30);
        assert_eq!(db.get_settings().expect("settings"), updated);
        assert!(db.merged_settings(json!({ "failureThreshold": "three" })).is_err());
    }
}
