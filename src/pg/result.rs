//! Owned result frames produced by [`RawConnection`](super::raw::RawConnection).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::result::{Cell, ResultSet, Row, SharedColumns};

use super::error::ServerError;
use super::protocol::FieldDescription;
use super::types::Oid;

/// Outcome of one result frame. Discriminants follow libpq's `ExecStatusType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExecStatus {
    EmptyQuery = 0,
    CommandOk = 1,
    TuplesOk = 2,
    BadResponse = 5,
    NonfatalError = 6,
    FatalError = 7,
    /// One row delivered in single-row mode.
    SingleTuple = 9,
}

impl ExecStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        matches!(self, ExecStatus::BadResponse | ExecStatus::FatalError)
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecStatus::EmptyQuery => "PGRES_EMPTY_QUERY",
            ExecStatus::CommandOk => "PGRES_COMMAND_OK",
            ExecStatus::TuplesOk => "PGRES_TUPLES_OK",
            ExecStatus::BadResponse => "PGRES_BAD_RESPONSE",
            ExecStatus::NonfatalError => "PGRES_NONFATAL_ERROR",
            ExecStatus::FatalError => "PGRES_FATAL_ERROR",
            ExecStatus::SingleTuple => "PGRES_SINGLE_TUPLE",
        };
        f.write_str(name)
    }
}

/// Column metadata shared by every frame of one statement.
pub type SharedFields = Arc<Vec<FieldDescription>>;

/// One result frame. Owned by whoever took it from the connection and
/// released when dropped.
#[derive(Debug, Clone)]
pub struct ResultHandle {
    status: ExecStatus,
    fields: SharedFields,
    rows: Vec<Vec<Option<Bytes>>>,
    command_tag: String,
    error: Option<ServerError>,
}

impl ResultHandle {
    pub(crate) fn new(status: ExecStatus, fields: SharedFields) -> Self {
        Self {
            status,
            fields,
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
        }
    }

    pub(crate) fn failed(error: ServerError) -> Self {
        let mut result = Self::new(ExecStatus::FatalError, Arc::new(Vec::new()));
        result.error = Some(error);
        result
    }

    pub(crate) fn push_row(&mut self, row: Vec<Option<Bytes>>) {
        self.rows.push(row);
    }

    pub(crate) fn set_command_tag(&mut self, tag: String) {
        self.command_tag = tag;
    }

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &SharedFields {
        &self.fields
    }

    pub fn field_name(&self, col: usize) -> Option<&str> {
        self.fields.get(col).map(|f| f.name.as_str())
    }

    pub fn field_type(&self, col: usize) -> Option<Oid> {
        self.fields.get(col).map(|f| f.type_oid)
    }

    /// Raw text of a cell; `None` for NULL or out-of-range.
    pub fn get_value(&self, row: usize, col: usize) -> Option<&[u8]> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        matches!(self.rows.get(row).and_then(|r| r.get(col)), Some(None))
    }

    pub fn row(&self, row: usize) -> Option<&[Option<Bytes>]> {
        self.rows.get(row).map(Vec::as_slice)
    }

    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    pub fn error(&self) -> Option<&ServerError> {
        self.error.as_ref()
    }

    /// Message of the server error carried by a failed frame.
    pub fn error_message(&self) -> &str {
        self.error.as_ref().map(|e| e.message.as_str()).unwrap_or("")
    }

    pub(crate) fn into_error(self) -> Option<ServerError> {
        self.error
    }
}

impl From<ResultHandle> for ResultSet {
    /// Materialize a frame. Cells keep the server's text form; invalid
    /// UTF-8 is replaced rather than rejected.
    fn from(frame: ResultHandle) -> Self {
        let columns: SharedColumns = frame.fields.iter().map(|f| f.name.clone()).collect();
        let rows = frame
            .rows
            .into_iter()
            .map(|values| {
                let cells = values
                    .into_iter()
                    .map(|v| Cell::new(v.map(|b| String::from_utf8_lossy(&b).into_owned())))
                    .collect();
                Row::new(cells, Arc::clone(&columns))
            })
            .collect();
        ResultSet::new(columns, rows, frame.command_tag)
    }
}
