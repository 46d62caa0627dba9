//! Row-by-row result streaming.
//!
//! A [`StreamingSource`] runs its query in single-row mode and hands rows
//! out as [`LazyRow`]s, so a result never has to fit in memory. It borrows
//! the connection mutably for its whole life; dropping it early leaves the
//! connection in a state the next command drains automatically.

use std::borrow::Cow;

use futures::stream::{self, Stream};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::lazy::{format_row, LazyRow};
use crate::result::SharedColumns;

use super::connection::{next_result, PgConnection};
use super::result::{ExecStatus, ResultHandle};
use super::types::decode_bytea_hex;

/// Per-stream options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Turn BYTEA `\x..` text into raw bytes inside each row.
    ///
    /// Raw bytes are written into the `|`-delimited row unescaped, so a
    /// value holding `|` shifts the cells after it and one spelling `NULL`
    /// reads back as NULL. Turn this off when BYTEA cells may hold
    /// arbitrary binary; `Vec<u8>` conversion still decodes the hex text.
    pub decode_bytea: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { decode_bytea: true }
    }
}

impl StreamOptions {
    pub fn decode_bytea(mut self, enabled: bool) -> Self {
        self.decode_bytea = enabled;
        self
    }
}

pub struct StreamingSource<'c> {
    conn: &'c mut PgConnection,
    sql: String,
    params: Vec<String>,
    options: StreamOptions,
    columns: SharedColumns,
    bytea: Vec<bool>,
    /// Read while extracting metadata; returned by the first `get_next_row`.
    first_row: Option<LazyRow>,
    active: bool,
    finished: bool,
    last_error: Option<Error>,
}

impl<'c> StreamingSource<'c> {
    /// Prepare a stream. Nothing is sent until [`initialize`](Self::initialize).
    pub fn new(
        conn: &'c mut PgConnection,
        sql: &str,
        params: &[String],
        options: StreamOptions,
    ) -> Self {
        Self {
            conn,
            sql: sql.to_string(),
            params: params.to_vec(),
            options,
            columns: SharedColumns::from(Vec::new()),
            bytea: Vec::new(),
            first_row: None,
            active: false,
            finished: false,
            last_error: None,
        }
    }

    /// Send the query and read its first frame to learn the columns.
    ///
    /// A server error on the first frame is returned here; later errors end
    /// the stream and are kept in [`last_error`](Self::last_error).
    pub async fn initialize(&mut self) -> Result<()> {
        if self.active || self.finished {
            return Ok(());
        }
        self.conn.send_streaming(&self.sql, &self.params).await?;
        self.active = true;

        let frame = match self.next_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                self.active = false;
                self.finished = true;
                return Err(e);
            }
        };

        match frame {
            None => self.mark_finished(),
            Some(frame) => match frame.status() {
                ExecStatus::SingleTuple => {
                    self.record_metadata(&frame);
                    self.first_row = Some(self.format(&frame));
                }
                status if status.is_error() => {
                    self.finish().await;
                    let err = frame.into_error().map(Error::from).unwrap_or_else(|| {
                        Error::Protocol {
                            message: "streaming query failed".to_string(),
                            status,
                            sqlstate: None,
                        }
                    });
                    return Err(err);
                }
                _ => {
                    // No rows at all; the terminal frame still carries columns.
                    self.record_metadata(&frame);
                    self.finish().await;
                }
            },
        }

        debug!(columns = self.columns.len(), finished = self.finished, "Stream initialized");
        Ok(())
    }

    /// Next row, or `None` when the stream is exhausted or failed.
    pub async fn get_next_row(&mut self) -> Option<LazyRow> {
        if let Some(row) = self.first_row.take() {
            return Some(row);
        }
        if self.finished || !self.active {
            return None;
        }

        match self.next_frame().await {
            Ok(Some(frame)) if frame.status() == ExecStatus::SingleTuple => {
                Some(self.format(&frame))
            }
            Ok(Some(frame)) if frame.status().is_error() => {
                if let Some(e) = frame.into_error() {
                    debug!(sqlstate = %e.code, message = %e.message, "Stream ended with an error");
                    self.last_error = Some(e.into());
                }
                self.finish().await;
                None
            }
            Ok(Some(_)) => {
                self.finish().await;
                None
            }
            Ok(None) => {
                self.mark_finished();
                None
            }
            Err(e) => {
                self.last_error = Some(e);
                self.mark_finished();
                None
            }
        }
    }

    /// Collect the remaining rows, failing if the stream ended in error.
    pub async fn collect_rows(mut self) -> Result<Vec<LazyRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.get_next_row().await {
            rows.push(row);
        }
        match self.last_error.take() {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    /// Adapt into a `futures` stream. Dropping it early behaves like
    /// dropping the source.
    pub fn into_stream(self) -> impl Stream<Item = LazyRow> + 'c {
        stream::unfold(self, |mut source| async move {
            let row = source.get_next_row().await?;
            Some((row, source))
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn shared_columns(&self) -> SharedColumns {
        SharedColumns::clone(&self.columns)
    }

    /// Which columns are BYTEA, by position.
    pub fn bytea_columns(&self) -> &[bool] {
        &self.bytea
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.first_row.is_none()
    }

    /// The error that ended the stream, if any.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Drain whatever the server still has queued for this stream. Failures
    /// are logged and otherwise ignored.
    pub async fn cleanup(&mut self) {
        self.first_row = None;
        if self.active && !self.finished {
            if let Err(e) = self.conn.drain().await {
                warn!(error = %e, "Failed to drain abandoned stream");
            }
        }
        self.mark_finished();
    }

    async fn next_frame(&mut self) -> Result<Option<ResultHandle>> {
        let raw = self.conn.raw_mut()?;
        Ok(next_result(raw).await?)
    }

    /// Consume frames up to the end of the command.
    async fn finish(&mut self) {
        loop {
            match self.next_frame().await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    if self.last_error.is_none() {
                        self.last_error = Some(e);
                    }
                    break;
                }
            }
        }
        self.mark_finished();
    }

    fn mark_finished(&mut self) {
        self.finished = true;
        self.active = false;
    }

    fn record_metadata(&mut self, frame: &ResultHandle) {
        if frame.nfields() == 0 && !self.columns.is_empty() {
            return;
        }
        self.columns = frame.fields().iter().map(|f| f.name.clone()).collect();
        self.bytea = frame.fields().iter().map(|f| f.type_oid.is_bytea()).collect();
    }

    fn format(&self, frame: &ResultHandle) -> LazyRow {
        let values = frame.row(0).unwrap_or_default();
        let cells: Vec<Option<Cow<'_, [u8]>>> = values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                value.as_deref().map(|raw| {
                    if self.options.decode_bytea && self.bytea.get(i).copied().unwrap_or(false) {
                        if let Some(bytes) = decode_bytea_hex(raw) {
                            return Cow::Owned(bytes);
                        }
                    }
                    Cow::Borrowed(raw)
                })
            })
            .collect();
        LazyRow::new(
            format_row(cells.iter().map(|c| c.as_deref())),
            self.shared_columns(),
        )
    }
}

impl std::fmt::Debug for StreamingSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingSource")
            .field("sql", &self.sql)
            .field("columns", &self.columns)
            .field("active", &self.active)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for StreamingSource<'_> {
    fn drop(&mut self) {
        if self.active && !self.finished && !self.conn.drain_nonblocking() {
            debug!("Stream dropped mid-result; the next command will drain it");
        }
    }
}
