//! Metric row definitions shipped as YAML and seeded into the store at startup.

use crate::errors::{AppError, AppResult};
use crate::models::{Dialect, MetricRow};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RowDefinition {
    id: i64,
    #[serde(default)]
    chart_group: String,
    #[serde(default)]
    variable_name: String,
    backend: Dialect,
    #[serde(alias = "sqlExpression")]
    sql: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    Wrapped { rows: Vec<RowDefinition> },
    List(Vec<RowDefinition>),
}

pub fn parse_definitions(raw: &str) -> AppResult<Vec<MetricRow>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let file: DefinitionFile = serde_yaml::from_str(raw)?;
    let definitions = match file {
        DefinitionFile::Wrapped { rows } | DefinitionFile::List(rows) => rows,
    };
    Ok(definitions
        .into_iter()
        .map(|definition| {
            let mut row = MetricRow::new(definition.id, definition.backend, definition.sql.trim());
            row.chart_group = definition.chart_group;
            row.variable_name = definition.variable_name;
            row
        })
        .collect())
}

/// A missing file means "no definitions"; an unreadable or malformed one is an error.
pub fn load_definitions(path: &Path) -> AppResult<Vec<MetricRow>> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no metric definitions file; skipping seed");
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|error| AppError::Io(format!("{}: {}", path.display(), error)))?;
    parse_definitions(&raw)
        .map_err(|error| AppError::Validation(format!("{}: {}", path.display(), error)))
}

#[cfg(test)]
mod tests {
    use super::{load_definitions, parse_definitions};
    use crate::models::Dialect;

    const SAMPLE: &str = r#"
rows:
  - id: 30
    chartGroup: Inventory
    variableName: Units On Hand
    backend: access
    sql: SELECT COUNT(*) FROM Inventory
  - id: 2
    chartGroup: Sales
    variableName: Revenue
    backend: sql-server
    sql: |
      SELECT SUM(Total) FROM dbo.Orders
"#;

    #[test]
    fn parses_wrapped_rows() {
        let rows = parse_definitions(SAMPLE).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].backend, Dialect::Access);
        assert_eq!(rows[1].sql_expression, "SELECT SUM(Total) FROM dbo.Orders");
        assert_eq!(rows[1].label(), "Sales Revenue");
        assert!(rows[1].value.is_none());
    }

    #[test]
    fn parses_bare_list_and_rejects_unknown_backend() {
        let rows = parse_definitions("- {id: 1, backend: mssql, sql: SELECT 1}").expect("rows");
        assert_eq!(rows[0].backend, Dialect::SqlServer);
        assert!(parse_definitions("- {id: 1, backend: oracle, sql: SELECT 1}").is_err());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rows = load_definitions(&dir.path().join("absent.yaml")).expect("rows");
        assert!(rows.is_empty());
    }
}
