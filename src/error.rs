//! Error types for rowpipe.
//!
//! Every fallible public operation returns [`Result`]. Lower layers never
//! retry; the caller decides whether to retry, discard a pooled connection,
//! or propagate.

use std::time::Duration;

use thiserror::Error;

use crate::pg::ExecStatus;

/// Numeric codes carried by [`Error::Connection`].
pub mod code {
    /// TCP connect or startup handshake failed.
    pub const CONNECT_FAILED: i32 = 1;
    /// The operation requires an open connection.
    pub const NOT_CONNECTED: i32 = 2;
    /// Socket read/write failure while waiting on readiness.
    pub const IO: i32 = 3;
    /// Authentication was rejected or could not be performed.
    pub const AUTH: i32 = 4;
    /// The server sent something the client could not interpret.
    pub const PROTOCOL: i32 = 5;
    /// The peer closed the socket.
    pub const CLOSED: i32 = 6;
    /// The connect handshake exceeded `connect_timeout`.
    pub const TIMEOUT: i32 = 7;
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error ({code}): {message}")]
    Connection { message: String, code: i32 },

    #[error("protocol error [{status}]: {message}")]
    Protocol {
        message: String,
        status: ExecStatus,
        sqlstate: Option<String>,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("prepared statement error: {0}")]
    Statement(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn connection(code: i32, message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            code,
        }
    }

    pub(crate) fn not_connected() -> Self {
        Error::connection(code::NOT_CONNECTED, "connection is not open")
    }

    /// True for transport-level failures that leave the connection unusable.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// SQLSTATE reported by the server, if this is a server-side error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Protocol { sqlstate, .. } => sqlstate.as_deref(),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    #[error("failed to open a pooled connection: {0}")]
    Creation(String),

    #[error("pool is closed")]
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResultError {
    #[error("unexpected NULL for a non-optional {target}")]
    UnexpectedNull { target: &'static str },

    #[error("cannot convert {value:?} to {target}")]
    Conversion { value: String, target: &'static str },

    #[error("column index {index} out of range for row with {len} columns")]
    OutOfRange { index: usize, len: usize },

    #[error("no column named {0:?}")]
    UnknownColumn(String),

    #[error("cell is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, Error>;
