//! Lazy rows.
//!
//! A [`LazyRow`] keeps one delimited buffer, `v1|v2|...|vn`, exactly as it
//! came off a stream. Cell boundaries are found on first access and cached;
//! typed conversion happens only when a [`LazyCell`] is asked for a value.
//!
//! Values containing `|` are not escaped, so such a value splits into extra
//! cells, and a value spelling `NULL` reads back as NULL. Callers streaming
//! free-form text should keep that in mind.
//!
//! Binary data is the common way to hit this: decoded BYTEA can hold any
//! byte, including `|` (0x7c). Streams that carry BYTEA and need exact
//! cell boundaries should use `StreamOptions::decode_bytea(false)`, which
//! keeps the `\x..` hex text. Hex never contains `|`, and `Vec<u8>`
//! conversion decodes it on access.

use std::borrow::Cow;
use std::fmt;

use once_cell::unsync::OnceCell;
use smallvec::SmallVec;

use crate::convert::{ConvertOptions, FromCell};
use crate::error::ResultError;
use crate::result::{Cell, Row, SharedColumns, NULL_SENTINEL};

/// Separator between cells in the lazy-row format.
pub const DELIMITER: u8 = b'|';

/// Cell byte ranges; rows up to 16 columns stay inline.
type Bounds = SmallVec<[(usize, usize); 16]>;

/// Encode cells into the lazy-row format, NULL as `"NULL"`.
pub fn format_row<'a, I>(cells: I) -> Vec<u8>
where
    I: IntoIterator<Item = Option<&'a [u8]>>,
{
    let mut buf = Vec::new();
    for (i, cell) in cells.into_iter().enumerate() {
        if i > 0 {
            buf.push(DELIMITER);
        }
        buf.extend_from_slice(cell.unwrap_or(NULL_SENTINEL.as_bytes()));
    }
    buf
}

pub struct LazyRow {
    data: Vec<u8>,
    columns: SharedColumns,
    bounds: OnceCell<Bounds>,
}

impl LazyRow {
    pub fn new(data: impl Into<Vec<u8>>, columns: SharedColumns) -> Self {
        Self {
            data: data.into(),
            columns,
            bounds: OnceCell::new(),
        }
    }

    fn bounds(&self) -> &Bounds {
        self.bounds.get_or_init(|| {
            let mut bounds = Bounds::new();
            if self.data.is_empty() && self.columns.is_empty() {
                return bounds;
            }
            let mut start = 0;
            for (i, b) in self.data.iter().enumerate() {
                if *b == DELIMITER {
                    bounds.push((start, i));
                    start = i + 1;
                }
            }
            bounds.push((start, self.data.len()));
            bounds
        })
    }

    /// The backing buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.bounds().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell(&self, index: usize) -> Result<LazyCell<'_>, ResultError> {
        let bounds = self.bounds();
        let (start, end) = *bounds.get(index).ok_or(ResultError::OutOfRange {
            index,
            len: bounds.len(),
        })?;
        Ok(LazyCell {
            bytes: &self.data[start..end],
        })
    }

    pub fn cells(&self) -> impl Iterator<Item = LazyCell<'_>> {
        self.bounds().iter().map(move |&(start, end)| LazyCell {
            bytes: &self.data[start..end],
        })
    }

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

    /// Materialize into an eager [`Row`].
    pub fn to_row(&self) -> Row {
        let cells = self
            .cells()
            .map(|cell| match cell.value() {
                None => Cell::null(),
                Some(bytes) => Cell::new(Some(String::from_utf8_lossy(bytes).into_owned())),
            })
            .collect();
        Row::new(cells, SharedColumns::clone(&self.columns))
    }

    pub fn raw_values(&self) -> Vec<String> {
        self.cells().map(|c| c.raw().into_owned()).collect()
    }
}

impl fmt::Debug for LazyRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRow")
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("columns", &self.columns)
            .finish()
    }
}

impl Clone for LazyRow {
    fn clone(&self) -> Self {
        Self::new(self.data.clone(), SharedColumns::clone(&self.columns))
    }
}

/// A borrowed slice of a [`LazyRow`]'s buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyCell<'a> {
    bytes: &'a [u8],
}

impl<'a> LazyCell<'a> {
    pub fn is_null(&self) -> bool {
        self.bytes == NULL_SENTINEL.as_bytes()
    }

    /// Bytes of the cell, `None` for NULL.
    pub fn value(&self) -> Option<&'a [u8]> {
        if self.is_null() {
            None
        } else {
            Some(self.bytes)
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn as_str(&self) -> Result<&'a str, ResultError> {
        std::str::from_utf8(self.bytes).map_err(|_| ResultError::InvalidUtf8)
    }

    pub fn raw(&self) -> Cow<'a, str> {
        String::from_utf8_lossy(self.bytes)
    }

    pub fn get<T: FromCell>(&self) -> Result<T, ResultError> {
        self.get_with(&ConvertOptions::default())
    }

    pub fn get_with<T: FromCell>(&self, opts: &ConvertOptions) -> Result<T, ResultError> {
        T::from_cell(self.value(), opts)
    }
}
