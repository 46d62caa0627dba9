//! Eager result model.
//!
//! A [`ResultSet`] is fully materialized: every row is read off the socket
//! before the query returns. Cells keep the server's text representation
//! and parse on each typed access.

use std::ops::Index;
use std::sync::Arc;

use crate::convert::{ConvertOptions, FromCell};
use crate::error::ResultError;

/// Text written in place of SQL NULL by the raw-row and lazy-row formats.
pub const NULL_SENTINEL: &str = "NULL";

/// Column names shared by every row of one result.
pub type SharedColumns = Arc<[String]>;

/// One cell: a raw text value or NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    value: Option<String>,
}

impl Cell {
    pub fn new(value: Option<String>) -> Self {
        Self { value }
    }

    pub fn null() -> Self {
        Self { value: None }
    }

    /// Build a cell from the mapper-facing text form, where `"NULL"` means NULL.
    pub fn from_raw(raw: &str) -> Self {
        if raw == NULL_SENTINEL {
            Self::null()
        } else {
            Self {
                value: Some(raw.to_string()),
            }
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Raw text, with NULL rendered as `"NULL"`.
    pub fn raw(&self) -> &str {
        self.value.as_deref().unwrap_or(NULL_SENTINEL)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Convert with the default (strict) rules.
    pub fn get<T: FromCell>(&self) -> Result<T, ResultError> {
        self.get_with(&ConvertOptions::default())
    }

    pub fn get_with<T: FromCell>(&self, opts: &ConvertOptions) -> Result<T, ResultError> {
        T::from_cell(self.value.as_deref().map(str::as_bytes), opts)
    }
}

/// A row of cells plus the column names of its result.
#[derive(Debug, Clone)]
pub struct Row {
    cells: Vec<Cell>,
    columns: SharedColumns,
}

impl Row {
    pub fn new(cells: Vec<Cell>, columns: SharedColumns) -> Self {
        Self { cells, columns }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> Result<&Cell, ResultError> {
        self.cells.get(index).ok_or(ResultError::OutOfRange {
            index,
            len: self.cells.len(),
        })
    }

    /// Position of a column by name (first match).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get<T: FromCell>(&self, index: usize) -> Result<T, ResultError> {
        self.cell(index)?.get()
    }

    pub fn get_by_name<T: FromCell>(&self, name: &str) -> Result<T, ResultError> {
        let index = self
            .column_index(name)
            .ok_or_else(|| ResultError::UnknownColumn(name.to_string()))?;
        self.get(index)
    }

    /// Cell values as text, NULL rendered as `"NULL"`.
    pub fn raw_values(&self) -> Vec<String> {
        self.cells.iter().map(|c| c.raw().to_string()).collect()
    }
}

impl Index<usize> for Row {
    type Output = Cell;

    fn index(&self, index: usize) -> &Cell {
        &self.cells[index]
    }
}

/// A fully materialized query result.
#[derive(Debug, Clone)]
pub struct ResultSet {
    columns: SharedColumns,
    rows: Vec<Row>,
    command_tag: String,
}

impl ResultSet {
    pub fn new(columns: SharedColumns, rows: Vec<Row>, command_tag: String) -> Self {
        Self {
            columns,
            rows,
            command_tag,
        }
    }

    /// A result with no columns and no rows.
    pub fn empty() -> Self {
        Self::new(Arc::from(Vec::new()), Vec::new(), String::new())
    }

    /// Build a result from raw text rows (NULL as `"NULL"`).
    pub fn from_raw_rows(columns: Vec<String>, raw_rows: Vec<Vec<String>>) -> Self {
        let columns: SharedColumns = Arc::from(columns);
        let rows = raw_rows
            .into_iter()
            .map(|values| {
                let cells = values.iter().map(|v| Cell::from_raw(v)).collect();
                Row::new(cells, Arc::clone(&columns))
            })
            .collect();
        Self::new(columns, rows, String::new())
    }

    pub fn with_command_tag(mut self, tag: impl Into<String>) -> Self {
        self.command_tag = tag.into();
        self
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn shared_columns(&self) -> SharedColumns {
        Arc::clone(&self.columns)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Result<&Row, ResultError> {
        self.rows.get(index).ok_or(ResultError::OutOfRange {
            index,
            len: self.rows.len(),
        })
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Command tag reported by the server (e.g. `INSERT 0 5`).
    pub fn command_tag(&self) -> &str {
        &self.command_tag
    }

    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// Map every row, silently dropping rows whose mapper fails.
    pub fn transform<T, E, F>(&self, mapper: F) -> Vec<T>
    where
        F: FnMut(&Row) -> Result<T, E>,
    {
        self.transform_counted(mapper).0
    }

    /// Like [`transform`](Self::transform) but also reports how many rows were dropped.
    pub fn transform_counted<T, E, F>(&self, mut mapper: F) -> (Vec<T>, usize)
    where
        F: FnMut(&Row) -> Result<T, E>,
    {
        let mut out = Vec::with_capacity(self.rows.len());
        let mut dropped = 0;
        for row in &self.rows {
            match mapper(row) {
                Ok(v) => out.push(v),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, total = self.rows.len(), "transform dropped rows");
        }
        (out, dropped)
    }

    /// Rows as ordered raw text values, NULL as `"NULL"`.
    pub fn into_raw_rows(self) -> Vec<Vec<String>> {
        self.rows.iter().map(Row::raw_values).collect()
    }
}

impl Index<usize> for ResultSet {
    type Output = Row;

    fn index(&self, index: usize) -> &Row {
        &self.rows[index]
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

/// Parse rows affected from a PostgreSQL command tag.
pub(crate) fn parse_rows_affected(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["FETCH", n]
        | ["MOVE", n]
        | ["COPY", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}
