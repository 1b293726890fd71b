use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Which backend serves a row. `SqlServer` is the T-SQL family, `Access` the Jet family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    #[serde(alias = "sqlserver", alias = "mssql")]
    SqlServer,
    #[serde(alias = "jet")]
    Access,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SqlServer => "sql-server",
            Self::Access => "access",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::SqlServer => Self::Access,
            Self::Access => Self::SqlServer,
        }
    }

    pub fn all() -> [Dialect; 2] {
        [Self::SqlServer, Self::Access]
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sql-server" | "sqlserver" | "mssql" => Ok(Self::SqlServer),
            "access" | "jet" => Ok(Self::Access),
            other => Err(format!("unknown dialect: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Connection,
    Execution,
    Syntax,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Execution => "execution",
            Self::Syntax => "syntax",
            Self::Other => "other",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "connection" => Ok(Self::Connection),
            "execution" => Ok(Self::Execution),
            "syntax" => Ok(Self::Syntax),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// A row-level failure. Backends report errors in the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RowError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RowError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    pub id: i64,
    #[serde(default)]
    pub chart_group: String,
    #[serde(default)]
    pub variable_name: String,
    pub backend: Dialect,
    #[serde(default, alias = "sql")]
    pub sql_expression: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub anomaly: Option<String>,
}

impl MetricRow {
    pub fn new(id: i64, backend: Dialect, sql_expression: impl Into<String>) -> Self {
        Self {
            id,
            chart_group: String::new(),
            variable_name: String::new(),
            backend,
            sql_expression: sql_expression.into(),
            value: None,
            error: None,
            error_kind: None,
            last_error_at: None,
            last_updated_at: None,
            anomaly: None,
        }
    }

    /// Human label used by the resolver's name score.
    pub fn label(&self) -> String {
        format!("{} {}", self.chart_group, self.variable_name)
            .trim()
            .to_string()
    }

    pub fn record_failure(&mut self, error: &RowError, at: DateTime<Utc>) {
        self.error = Some(error.message.clone());
        self.error_kind = Some(error.kind);
        self.last_error_at = Some(at);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
        self.error_kind = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

impl QueryOutput {
    pub fn single(value: Value) -> Self {
        let mut row = Map::new();
        row.insert("value".to_string(), value);
        Self { rows: vec![row] }
    }

    /// The `value` column of the first row, falling back to its first column.
    pub fn first_value(&self) -> Option<&Value> {
        let row = self.rows.first()?;
        row.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("value"))
            .map(|(_, value)| value)
            .or_else(|| row.values().next())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogTable {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCatalog {
    #[serde(default)]
    pub tables: Vec<CatalogTable>,
}

impl TableCatalog {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: names
                .into_iter()
                .map(|name| CatalogTable {
                    name: name.into(),
                    columns: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn with_table(mut self, name: &str, columns: &[&str]) -> Self {
        self.tables.push(CatalogTable {
            name: name.to_string(),
            columns: columns.iter().map(|column| (*column).to_string()).collect(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables
            .iter()
            .any(|table| table.name.eq_ignore_ascii_case(name))
    }

    pub fn first(&self) -> Option<&CatalogTable> {
        self.tables.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Complete,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub active_row_id: Option<i64>,
    pub snapshot: Vec<MetricRow>,
    pub last_error: Option<String>,
    pub run_token: u64,
    pub rows_completed: usize,
    pub cycles_completed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInfo {
    pub current_row: usize,
    pub total_rows: usize,
    pub percent_complete: u8,
    pub is_cycle_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub execution_state: ExecutionState,
    pub is_worker_running: bool,
    pub cycle_info: CycleInfo,
    pub has_data: bool,
    pub recently_updated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlStatus {
    Started,
    AlreadyRunning,
    Stopped,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub status: ControlStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<ExecutionState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunPayload {
    #[serde(default)]
    pub rows: Option<Vec<MetricRow>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslatePayload {
    pub sql: String,
    pub target: Dialect,
    #[serde(default)]
    pub use_catalog: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    pub sql: String,
    pub applied_rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenResolutionPayload {
    pub row_id: i64,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowHistoryEntry {
    pub id: String,
    pub row_id: i64,
    pub value: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub preserved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub worker_running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub query_timeout_seconds: u64,
    pub inter_row_delay_ms: u64,
    pub inter_cycle_delay_ms: u64,
    pub failure_threshold: u32,
    pub max_cycles: Option<u64>,
    pub recent_window_seconds: i64,
    pub retention_days: u32,
    pub redact_aggressive: bool,
    pub auto_start: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            query_timeout_seconds: 30,
            inter_row_delay_ms: 500,
            inter_cycle_delay_ms: 30_000,
            failure_threshold: 3,
            max_cycles: None,
            recent_window_seconds: 10,
            retention_days: 30,
            redact_aggressive: true,
            auto_start: false,
        }
    }
}
