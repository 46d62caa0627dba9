//! Backend-neutral connection interface.
//!
//! The pool is generic over [`Connection`]; [`PgConnection`](crate::pg::PgConnection)
//! is the PostgreSQL implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::result::ResultSet;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    /// PostgreSQL's default.
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// The full `BEGIN` command for this level.
    pub fn begin_statement(&self) -> String {
        format!("BEGIN ISOLATION LEVEL {}", self.as_sql())
    }
}

/// A single physical database connection.
///
/// Implementations allow at most one operation in flight; every method
/// takes `&mut self`.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Create a disconnected connection for `connection_string`.
    fn open(connection_string: &str) -> Self
    where
        Self: Sized;

    fn connection_string(&self) -> &str;

    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. An open transaction is rolled back first,
    /// best-effort.
    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Run `sql` with `?` placeholders bound to `params` (sent as text).
    async fn execute_raw(&mut self, sql: &str, params: &[String]) -> Result<ResultSet>;

    async fn begin_transaction(&mut self, level: IsolationLevel) -> Result<()>;

    async fn commit_transaction(&mut self) -> Result<()>;

    async fn rollback_transaction(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    /// Cheap round-trip used by the pool to confirm the connection works.
    async fn validate(&mut self) -> Result<()> {
        self.execute_raw("SELECT 1", &[]).await.map(|_| ())
    }

    /// Bring a checked-in connection back to a clean idle state. An error
    /// means the connection should be discarded.
    async fn reset(&mut self) -> Result<()> {
        if self.in_transaction() {
            self.rollback_transaction().await?;
        }
        Ok(())
    }

    /// Whether the connection can be handed back out without further work.
    fn is_reusable(&self) -> bool {
        self.is_connected() && !self.in_transaction()
    }
}
