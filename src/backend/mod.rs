pub mod gateway;
pub mod memory;

use crate::errors::AppResult;
use crate::models::{Dialect, QueryOutput, RowError, TableCatalog};
use std::future::Future;
use std::pin::Pin;

pub use gateway::GatewayBackend;
pub use memory::InMemoryBackend;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes metric queries against one of the two backends.
pub trait QueryBackend: Send + Sync {
    fn execute<'a>(
        &'a self,
        dialect: Dialect,
        sql: &'a str,
    ) -> BackendFuture<'a, Result<QueryOutput, RowError>>;

    /// Tables (and their columns) known to `dialect`. Callers treat a failure as
    /// "assume compatible".
    fn catalog(&self, dialect: Dialect) -> BackendFuture<'_, AppResult<TableCatalog>>;
}
