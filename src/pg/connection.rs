//! PostgreSQL connection engine.
//!
//! [`PgConnection`] drives one [`RawConnection`] through connect, query,
//! transaction and prepared-statement operations. It suspends only while
//! waiting for the socket to become writable (flushing) or readable
//! (collecting results).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::Interest;
use tracing::{debug, info, warn};

use crate::connection::{Connection, IsolationLevel};
use crate::error::{code, Error, Result};
use crate::placeholder;
use crate::result::ResultSet;

use super::conninfo::ConnInfo;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::TransactionStatus;
use super::raw::{RawConnection, Wait};
use super::result::ResultHandle;
use super::statement::{Lookup, PreparedStatement, StatementRegistry};
use super::stream::{StreamOptions, StreamingSource};

/// Upper bound on draining frames left behind by an abandoned stream.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Chunks read by a non-blocking drain before giving up for now.
const NONBLOCKING_DRAIN_CHUNKS: usize = 64;

// ============================================================================
// Suspension points
// ============================================================================

/// Suspend until every queued byte has been written.
pub(crate) async fn flush_all(raw: &mut RawConnection) -> PgResult<()> {
    loop {
        match raw.flush()? {
            Wait::NeedWrite => raw.wait(Interest::WRITABLE).await?,
            _ => return Ok(()),
        }
    }
}

/// Next frame of the in-flight command, or `None` once it is complete.
pub(crate) async fn next_result(raw: &mut RawConnection) -> PgResult<Option<ResultHandle>> {
    loop {
        if !raw.is_busy() {
            return Ok(raw.get_result());
        }
        raw.wait(Interest::READABLE).await?;
        raw.consume_input()?;
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    connection_string: String,
    raw: Option<RawConnection>,
    in_transaction: bool,
    statements: StatementRegistry,
}

impl PgConnection {
    /// Create a disconnected connection. Nothing is parsed until `connect`.
    pub fn new(connection_string: &str) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            raw: None,
            in_transaction: false,
            statements: StatementRegistry::new(),
        }
    }

    /// Create and connect in one step.
    pub async fn connect_to(connection_string: &str) -> Result<Self> {
        let mut conn = Self::new(connection_string);
        conn.connect().await?;
        Ok(conn)
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn is_connected(&self) -> bool {
        self.raw.as_ref().is_some_and(RawConnection::is_ready)
    }

    /// Run the startup handshake. A failed attempt releases the socket.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.raw = None;

        let info = ConnInfo::parse(&self.connection_string)?;
        let address = info.address();
        let timeout = info.connect_timeout;

        let handshake = Self::establish(info);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| {
                    Error::connection(
                        code::TIMEOUT,
                        format!("timed out after {:?} connecting to {}", limit, address),
                    )
                })?,
            None => handshake.await,
        };

        let raw = result.map_err(|e| match e {
            PgError::Io(io) => Error::connection(
                code::CONNECT_FAILED,
                format!("could not connect to {}: {}", address, io),
            ),
            other => other.into(),
        })?;

        info!(address = %address, backend_pid = raw.backend_pid(), "Connected to PostgreSQL");
        self.raw = Some(raw);
        self.in_transaction = false;
        self.statements.invalidate_all();
        Ok(())
    }

    async fn establish(info: ConnInfo) -> PgResult<RawConnection> {
        let mut raw = RawConnection::connect_start(info).await?;
        loop {
            let wait = raw.connect_poll();
            match wait {
                Wait::Done => return Ok(raw),
                Wait::Failed(e) => return Err(e),
                Wait::NeedRead | Wait::NeedWrite => {
                    if let Some(interest) = wait.interest() {
                        raw.wait(interest).await?;
                    }
                }
            }
        }
    }

    /// Close the connection, rolling back an open transaction first.
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.raw.is_none() {
            return Ok(());
        }
        if self.in_transaction && self.is_connected() {
            if let Err(e) = self.rollback_transaction().await {
                warn!(error = %e, "Rollback during disconnect failed");
            }
        }
        if let Some(mut raw) = self.raw.take() {
            raw.terminate();
            info!(backend_pid = raw.backend_pid(), "Disconnected from PostgreSQL");
        }
        self.in_transaction = false;
        self.statements.invalidate_all();
        Ok(())
    }

    pub(crate) fn raw_mut(&mut self) -> Result<&mut RawConnection> {
        match self.raw.as_mut() {
            Some(raw) if raw.is_ready() => Ok(raw),
            _ => Err(Error::not_connected()),
        }
    }

    // ------------------------------------------------------------------
    // Query execution
    // ------------------------------------------------------------------

    /// Execute `sql`, binding `params` to its `?` placeholders as text.
    ///
    /// Without parameters the simple protocol is used, so `sql` may hold
    /// several statements; the result of the last one is returned.
    pub async fn execute(&mut self, sql: &str, params: &[String]) -> Result<ResultSet> {
        if params.is_empty() {
            return self.run(|raw| raw.send_query(sql)).await;
        }
        let sql = positional_sql(sql, params)?;
        let params = text_params(params);
        self.run(|raw| raw.send_query_params(&sql, &params)).await
    }

    /// Send one command and collect every frame it produces.
    async fn run<F>(&mut self, send: F) -> Result<ResultSet>
    where
        F: FnOnce(&mut RawConnection) -> PgResult<()>,
    {
        self.ensure_idle().await?;
        let raw = self.raw_mut()?;
        send(raw)?;
        flush_all(raw).await?;

        let mut last: Option<ResultHandle> = None;
        let mut error: Option<ServerError> = None;
        while let Some(frame) = next_result(raw).await? {
            if frame.status().is_error() {
                if error.is_none() {
                    error = frame.into_error();
                }
            } else {
                last = Some(frame);
            }
        }

        if let Some(e) = error {
            debug!(sqlstate = %e.code, message = %e.message, "Command failed");
            return Err(e.into());
        }
        Ok(last.map(ResultSet::from).unwrap_or_else(ResultSet::empty))
    }

    /// Make sure no frames from an earlier command are still pending.
    async fn ensure_idle(&mut self) -> Result<()> {
        let Some(raw) = self.raw.as_mut() else {
            return Err(Error::not_connected());
        };
        if raw.is_idle() {
            return Ok(());
        }

        debug!("Draining frames left by an earlier command");
        let drain = async {
            while next_result(raw).await?.is_some() {}
            PgResult::Ok(())
        };
        let outcome = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!(timeout = ?DRAIN_TIMEOUT, "Drain timed out; closing connection");
                if let Some(mut raw) = self.raw.take() {
                    raw.terminate();
                }
                Err(Error::connection(
                    code::TIMEOUT,
                    "timed out draining a previous command",
                ))
            }
        }
    }

    /// Discard whatever frames are already available without waiting.
    /// Returns true when the connection ended up idle.
    pub(crate) fn drain_nonblocking(&mut self) -> bool {
        let Some(raw) = self.raw.as_mut() else {
            return true;
        };
        for _ in 0..NONBLOCKING_DRAIN_CHUNKS {
            while !raw.is_busy() {
                if raw.get_result().is_none() {
                    return true;
                }
            }
            if raw.consume_input().is_err() || raw.is_busy() {
                return raw.is_idle();
            }
        }
        raw.is_idle()
    }

    /// Best-effort bounded drain used when a stream is cleaned up.
    pub(crate) async fn drain(&mut self) -> Result<()> {
        if self.raw.is_none() {
            return Ok(());
        }
        self.ensure_idle().await
    }

    /// Start a row-by-row stream of `sql`. Rows are read as the returned
    /// source is polled; the connection is borrowed until it is dropped.
    pub async fn stream(&mut self, sql: &str, params: &[String]) -> Result<StreamingSource<'_>> {
        self.stream_with(sql, params, StreamOptions::default()).await
    }

    pub async fn stream_with(
        &mut self,
        sql: &str,
        params: &[String],
        options: StreamOptions,
    ) -> Result<StreamingSource<'_>> {
        let mut source = StreamingSource::new(self, sql, params, options);
        source.initialize().await?;
        Ok(source)
    }

    /// Queue a streaming command. Used by [`StreamingSource::initialize`].
    pub(crate) async fn send_streaming(&mut self, sql: &str, params: &[String]) -> Result<()> {
        self.ensure_idle().await?;
        let sql = if params.is_empty() {
            sql.to_string()
        } else {
            positional_sql(sql, params)?
        };
        let params = text_params(params);
        let raw = self.raw_mut()?;
        raw.send_query_params(&sql, &params)?;
        if !raw.set_single_row_mode() {
            return Err(PgError::Protocol("could not enter single-row mode".to_string()).into());
        }
        flush_all(raw).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub async fn begin_transaction(&mut self, level: IsolationLevel) -> Result<()> {
        if self.in_transaction {
            return Err(Error::Transaction("a transaction is already active".to_string()));
        }
        self.execute(&level.begin_statement(), &[]).await?;
        self.in_transaction = true;
        debug!(isolation = level.as_sql(), "Transaction started");
        Ok(())
    }

    pub async fn commit_transaction(&mut self) -> Result<()> {
        self.end_transaction("COMMIT").await
    }

    pub async fn rollback_transaction(&mut self) -> Result<()> {
        self.end_transaction("ROLLBACK").await
    }

    async fn end_transaction(&mut self, command: &str) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Transaction(format!(
                "{} without an active transaction",
                command
            )));
        }
        // The server leaves the block whether or not the command succeeds.
        let result = self.execute(command, &[]).await;
        self.in_transaction = false;
        result.map(|_| ())
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    // ------------------------------------------------------------------
    // Prepared statements
    // ------------------------------------------------------------------

    /// Prepare `sql` under `name`. Re-preparing a name with the same SQL is
    /// a no-op; with different SQL the old statement is deallocated first.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> Result<PreparedStatement> {
        let sql = placeholder::to_positional(sql);
        match self.statements.lookup(name, &sql) {
            Lookup::Cached => {
                if let Some(stmt) = self.statements.get(name) {
                    return Ok(stmt.clone());
                }
            }
            Lookup::Stale => {
                let was_prepared = self.statements.get(name).is_some_and(|s| s.prepared);
                if was_prepared {
                    debug!(name, "Replacing prepared statement with new SQL");
                    self.execute(&deallocate_sql(name), &[]).await?;
                }
                self.statements.remove(name);
            }
            Lookup::Unprepared | Lookup::Missing => {}
        }

        self.prepare_on_server(name, &sql).await?;
        Ok(self.statements.mark_prepared(name, &sql).clone())
    }

    async fn prepare_on_server(&mut self, name: &str, sql: &str) -> Result<()> {
        self.run(|raw| raw.send_prepare(name, sql)).await?;
        debug!(name, "Prepared statement");
        Ok(())
    }

    /// Execute a statement created by [`prepare`](Self::prepare),
    /// preparing it again first if the server no longer has it.
    pub async fn execute_prepared(&mut self, name: &str, params: &[String]) -> Result<ResultSet> {
        let stmt = self
            .statements
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Statement(format!("unknown prepared statement {:?}", name)))?;

        if !stmt.prepared {
            self.prepare_on_server(&stmt.name, &stmt.sql).await?;
            self.statements.mark_prepared(&stmt.name, &stmt.sql);
        }

        let params = text_params(params);
        self.run(|raw| raw.send_query_prepared(name, &params)).await
    }

    pub async fn deallocate(&mut self, name: &str) -> Result<()> {
        let stmt = self
            .statements
            .get(name)
            .ok_or_else(|| Error::Statement(format!("unknown prepared statement {:?}", name)))?;
        if stmt.prepared {
            self.execute(&deallocate_sql(name), &[]).await?;
        }
        self.statements.remove(name);
        Ok(())
    }

    pub async fn deallocate_all(&mut self) -> Result<()> {
        if self.is_connected() {
            self.execute("DEALLOCATE ALL", &[]).await?;
        }
        self.statements.clear();
        Ok(())
    }

    pub fn prepared_statement(&self, name: &str) -> Option<&PreparedStatement> {
        self.statements.get(name)
    }

    // ------------------------------------------------------------------
    // Server status
    // ------------------------------------------------------------------

    /// A parameter reported by the server (e.g. `server_version`).
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.raw.as_ref()?.parameter_status(name)
    }

    pub fn backend_pid(&self) -> Option<i32> {
        self.raw.as_ref().map(RawConnection::backend_pid)
    }

    /// Transaction state from the last ReadyForQuery.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.raw.as_ref().map(RawConnection::transaction_status)
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("raw", &self.raw)
            .field("in_transaction", &self.in_transaction)
            .field("statements", &self.statements.len())
            .finish()
    }
}

/// Rewrite `?` markers to `$n`, rejecting a marker/parameter mismatch.
/// SQL without markers passes through, so `$n` text can be bound directly.
fn positional_sql(sql: &str, params: &[String]) -> Result<String> {
    let markers = placeholder::count(sql);
    if markers > 0 && markers != params.len() {
        return Err(Error::Statement(format!(
            "query has {} placeholders but {} parameters were given",
            markers,
            params.len()
        )));
    }
    Ok(placeholder::to_positional(sql))
}

fn text_params(params: &[String]) -> Vec<Option<String>> {
    params.iter().cloned().map(Some).collect()
}

fn deallocate_sql(name: &str) -> String {
    format!("DEALLOCATE \"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl Connection for PgConnection {
    fn open(connection_string: &str) -> Self {
        Self::new(connection_string)
    }

    fn connection_string(&self) -> &str {
        &self.connection_string
    }

    async fn connect(&mut self) -> Result<()> {
        PgConnection::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        PgConnection::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        PgConnection::is_connected(self)
    }

    async fn execute_raw(&mut self, sql: &str, params: &[String]) -> Result<ResultSet> {
        self.execute(sql, params).await
    }

    async fn begin_transaction(&mut self, level: IsolationLevel) -> Result<()> {
        PgConnection::begin_transaction(self, level).await
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        PgConnection::commit_transaction(self).await
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        PgConnection::rollback_transaction(self).await
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Drain an abandoned stream, then leave any transaction block,
    /// including one opened with a raw `BEGIN`.
    async fn reset(&mut self) -> Result<()> {
        self.ensure_idle().await?;
        if self.in_transaction {
            self.rollback_transaction().await?;
        } else if self.transaction_status() != Some(TransactionStatus::Idle) {
            self.execute("ROLLBACK", &[]).await?;
        }
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        !self.in_transaction
            && self.raw.as_ref().is_some_and(|raw| {
                raw.is_ready()
                    && raw.is_idle()
                    && raw.transaction_status() == TransactionStatus::Idle
            })
    }
}
