use super::{BackendFuture, QueryBackend};
use crate::errors::{AppError, AppResult};
use crate::models::{Dialect, QueryOutput, RowError, TableCatalog};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    sql: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct QueryReply {
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
    #[serde(default)]
    error: Option<RowError>,
}

/// Talks to one HTTP query gateway per dialect:
/// `POST {base}/query {sql}` and `GET {base}/catalog`.
#[derive(Clone)]
pub struct GatewayBackend {
    client: Client,
    endpoints: HashMap<Dialect, String>,
}

impl GatewayBackend {
    pub fn new(sql_server: Option<String>, access: Option<String>) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|error| AppError::Internal(format!("Failed to create gateway client: {}", error)))?;

        let mut endpoints = HashMap::new();
        for (dialect, base) in [(Dialect::SqlServer, sql_server), (Dialect::Access, access)] {
            if let Some(base) = base.filter(|base| !base.trim().is_empty()) {
                endpoints.insert(dialect, base.trim().trim_end_matches('/').to_string());
            }
        }
        Ok(Self { client, endpoints })
    }

    pub fn is_configured(&self, dialect: Dialect) -> bool {
        self.endpoints.contains_key(&dialect)
    }

    fn endpoint(&self, dialect: Dialect) -> Option<&str> {
        self.endpoints.get(&dialect).map(String::as_str)
    }

    async fn run_query(&self, dialect: Dialect, sql: &str) -> Result<QueryOutput, RowError> {
        let Some(base) = self.endpoint(dialect) else {
            return Err(RowError::connection(format!(
                "no query gateway configured for {}",
                dialect.as_str()
            )));
        };

        let response = self
            .client
            .post(format!("{}/query", base))
            .json(&QueryRequest { sql })
            .send()
            .await
            .map_err(|error| RowError::connection(format!("gateway unreachable: {}", error)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| RowError::connection(format!("gateway reply interrupted: {}", error)))?;
        let reply: QueryReply = match serde_json::from_str(&body) {
            Ok(reply) => reply,
            Err(_) if !status.is_success() => {
                return Err(RowError::execution(format!(
                    "gateway returned {}: {}",
                    status,
                    body.trim()
                )));
            }
            Err(error) => {
                return Err(RowError::execution(format!("invalid gateway reply: {}", error)));
            }
        };

        if let Some(error) = reply.error {
            return Err(error);
        }
        if !status.is_success() {
            return Err(RowError::execution(format!("gateway returned {}", status)));
        }
        Ok(QueryOutput { rows: reply.rows })
    }

    async fn fetch_catalog(&self, dialect: Dialect) -> AppResult<TableCatalog> {
        let Some(base) = self.endpoint(dialect) else {
            return Err(AppError::Backend(format!(
                "no query gateway configured for {}",
                dialect.as_str()
            )));
        };
        let catalog = self
            .client
            .get(format!("{}/catalog", base))
            .send()
            .await?
            .error_for_status()?
            .json::<TableCatalog>()
            .await?;
        Ok(catalog)
    }
}

impl QueryBackend for GatewayBackend {
    fn execute<'a>(
        &'a self,
        dialect: Dialect,
        sql: &'a str,
    ) -> BackendFuture<'a, Result<QueryOutput, RowError>> {
        Box::pin(self.run_query(dialect, sql))
    }

    fn catalog(&self, dialect: Dialect) -> BackendFuture<'_, AppResult<TableCatalog>> {
        Box::pin(self.fetch_catalog(dialect))
    }
}

#[cfg(test)]
mod tests {
    use super::{GatewayBackend, QueryBackend, QueryReply};
    use crate::models::{Dialect, ErrorKind};

    #[test]
    fn endpoints_are_trimmed_and_optional() {
        let backend =
            GatewayBackend::new(Some("http://gw:9000/".to_string()), Some("  ".to_string())).expect("backend");
        assert!(backend.is_configured(Dialect::SqlServer));
        assert!(!backend.is_configured(Dialect::Access));
        assert_eq!(backend.endpoint(Dialect::SqlServer), Some("http://gw:9000"));
    }

    #[tokio::test]
    async fn missing_gateway_is_a_connection_failure() {
        let backend = GatewayBackend::new(None, None).expect("backend");
        let error = backend
            .execute(Dialect::Access, "SELECT 1")
            .await
            .expect_err("no gateway");
        assert_eq!(error.kind, ErrorKind::Connection);
        assert!(backend.catalog(Dialect::Access).await.is_err());
    }

    #[test]
    fn reply_carries_backend_error_shape() {
        let reply: QueryReply = serde_json::from_str(
            r#"{"error":{"kind":"execution","message":"Invalid object name 'Ordrs'"}}"#,
        )
        .expect("reply");
        let error = reply.error.expect("error");
        assert_eq!(error.kind, ErrorKind::Execution);
        assert!(reply.rows.is_empty());
    }
}
