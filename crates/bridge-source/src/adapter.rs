use std::fmt;

use bridge_core::error::{ConnError, ExtractError};
use bridge_core::model::Row;
use futures_util::stream::BoxStream;

#[derive(Debug, Clone)]
pub enum SourceError {
    Conn(ConnError),
    Extract(ExtractError),
    /// `delete_by_pk` on an adapter that has no notion of primary keys (laravel_log).
    Unsupported(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Conn(e) => write!(f, "{e}"),
            SourceError::Extract(e) => write!(f, "{e}"),
            SourceError::Unsupported(msg) => write!(f, "unsupported operation: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// A single primary-key value, carried untyped across the wire to `DELETE ... WHERE pk IN (...)`.
#[derive(Debug, Clone)]
pub enum PkValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for PkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkValue::Int(v) => write!(f, "{v}"),
            PkValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Uniform interface over `{mysql, postgresql, sqlserver, sqlite, laravel_log}` (§4.3).
#[async_trait::async_trait]
pub trait SourceAdapter: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;
    async fn test_connection(&mut self) -> Result<(), SourceError>;

    /// Lazy, finite, not restartable. Batches arrive in source order.
    fn extract<'a>(&'a mut self, query: &'a str, batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>>;

    async fn delete_by_pk(&mut self, table: &str, pk_column: &str, values: &[PkValue]) -> Result<u64, SourceError>;

    async fn disconnect(&mut self);
}
