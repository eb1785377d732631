//! Backend-neutral connection seams

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("statement failed: {0}")]
    Statement(String),

    #[error("connection closed")]
    Closed,
}

/// A single database session able to run the broker's transaction protocol.
#[async_trait]
pub trait SessionConnection: Send + fmt::Debug + 'static {
    /// Run statements without parameters (`BEGIN`, `COMMIT`, procedures).
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Run a statement with one text parameter bound as `$1`.
    async fn call(&mut self, sql: &str, arg: &str) -> Result<(), DbError>;

    fn is_closed(&self) -> bool;
}

/// Opens new sessions for the pool.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    type Connection: SessionConnection;

    async fn connect(&self) -> Result<Self::Connection, DbError>;
}
