//! Wire-level errors for the PostgreSQL backend.
//!
//! [`PgError`] is what the protocol primitives report; the engine turns it
//! into the crate-wide [`Error`] at its boundary.

use std::collections::HashMap;
use std::fmt;
use std::io;

use crate::error::{code, Error};

use super::result::ExecStatus;

/// Result type for the protocol layer.
pub type PgResult<T> = Result<T, PgError>;

/// Fields of an ErrorResponse, keyed by their one-byte field code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

/// Errors raised while driving the wire protocol.
#[derive(Debug)]
pub enum PgError {
    /// I/O error on the socket.
    Io(io::Error),

    /// Unexpected or malformed message.
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// The server rejected the startup handshake.
    Server(ServerError),

    /// The peer closed the socket, or the handle was already released.
    ConnectionClosed,

    /// An operation was started while another is still in flight.
    Busy,
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server(e) => write!(f, "{}", e),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
            PgError::Busy => write!(f, "Another command is already in progress"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}

impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        let code = match &e {
            PgError::Io(_) => code::IO,
            PgError::Protocol(_) | PgError::Busy => code::PROTOCOL,
            PgError::Auth(_) => code::AUTH,
            PgError::Server(_) => code::CONNECT_FAILED,
            PgError::ConnectionClosed => code::CLOSED,
        };
        Error::connection(code, e.to_string())
    }
}

impl From<ServerError> for Error {
    /// A failed result frame.
    fn from(e: ServerError) -> Self {
        Error::Protocol {
            message: e.message.clone(),
            status: ExecStatus::FatalError,
            sqlstate: if e.code.is_empty() { None } else { Some(e.code) },
        }
    }
}
