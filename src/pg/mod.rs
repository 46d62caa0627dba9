//! PostgreSQL backend over a hand-written v3 wire protocol.
//!
//! Layers, bottom up:
//! - `protocol`: message encoding and decoding
//! - `raw`: non-blocking connection handle that queues output, consumes
//!   input and hands out result frames
//! - `connection`: the async engine driving a `RawConnection`
//! - `stream`: single-row streaming on top of the engine
//! - `statement`: per-connection prepared statement registry

pub mod conninfo;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod raw;
pub mod result;
pub mod scram;
pub mod statement;
pub mod stream;
pub mod types;

#[cfg(test)]
mod tests;

pub use connection::PgConnection;
pub use conninfo::ConnInfo;
pub use error::{PgError, PgResult, ServerError};
pub use protocol::TransactionStatus;
pub use raw::{RawConnection, Wait};
pub use result::{ExecStatus, ResultHandle};
pub use statement::PreparedStatement;
pub use stream::{StreamOptions, StreamingSource};
pub use types::Oid;
