//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages the client
//! needs. All parameters and results use the text format.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Largest backend message accepted (1 GiB, the server's own limit).
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode_into(&self, buf: &mut BytesMut);

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// Write a tagged message: tag byte, then length-prefixed body.
fn framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_pos = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_pos) as i32;
    buf[len_pos..len_pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(buf, "user");
        put_cstr(buf, &self.user);
        if let Some(db) = &self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }
        for (key, value) in &self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);

        let len = (buf.len() - start) as i32;
        buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Password message (cleartext or MD5)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |b| put_cstr(b, &self.password));
    }
}

/// SASL Initial Response message ('p')
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        });
    }
}

/// SASL Response message ('p')
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'p', |b| b.put_slice(&self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - text parameters, text results
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Option<String>],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);
            // Zero format codes: every parameter is text.
            b.put_i16(0);
            b.put_i16(self.params.len() as i16);
            for param in self.params {
                match param {
                    Some(value) => {
                        b.put_i32(value.len() as i32);
                        b.put_slice(value.as_bytes());
                    }
                    None => b.put_i32(-1),
                }
            }
            // Zero result format codes: every column is text.
            b.put_i16(0);
        });
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'S', |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        framed(buf, b'X', |_| {});
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Split one complete message off the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a whole message.
    pub fn try_decode(buf: &mut BytesMut) -> PgResult<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(PgError::Protocol(format!("Invalid message length: {}", len)));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut msg = buf.split_to(total).freeze();
        Self::decode(&mut msg).map(Some)
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        if buf.remaining() < 5 {
            return Err(PgError::Protocol("Incomplete message header".to_string()));
        }

        let msg_type = buf.get_u8();
        let len = buf.get_i32();
        if len < 4 || buf.remaining() < len as usize - 4 {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut body = buf.split_to(len as usize - 4);
        let body = &mut body;

        match msg_type {
            b'R' => Self::decode_auth(body),
            b'T' => Self::decode_row_description(body),
            b'D' => Self::decode_data_row(body),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: read_cstring(body)?,
            }),
            b'Z' => {
                need(body, 1)?;
                Ok(BackendMessage::ReadyForQuery {
                    status: TransactionStatus::from(body.get_u8()),
                })
            }
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(body)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(body)?,
            }),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: read_cstring(body)?,
                value: read_cstring(body)?,
            }),
            b'K' => {
                need(body, 8)?;
                Ok(BackendMessage::BackendKeyData {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                })
            }
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'n' => Ok(BackendMessage::NoData),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => Self::decode_parameter_description(body),
            b'A' => {
                need(body, 4)?;
                Ok(BackendMessage::NotificationResponse {
                    process_id: body.get_i32(),
                    channel: read_cstring(body)?,
                    payload: read_cstring(body)?,
                })
            }
            _ => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                msg_type as char
            ))),
        }
    }

    fn decode_auth(body: &mut Bytes) -> PgResult<Self> {
        need(body, 4)?;
        let auth_type = body.get_i32();

        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                need(body, 4)?;
                let mut salt = [0u8; 4];
                body.copy_to_slice(&mut salt);
                Ok(BackendMessage::AuthenticationMD5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while body.has_remaining() {
                    let mech = read_cstring(body)?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Ok(BackendMessage::AuthenticationSASL { mechanisms })
            }
            11 => Ok(BackendMessage::AuthenticationSASLContinue {
                data: body.split_off(0),
            }),
            12 => Ok(BackendMessage::AuthenticationSASLFinal {
                data: body.split_off(0),
            }),
            _ => Err(PgError::Auth(format!(
                "Unsupported authentication type: {}",
                auth_type
            ))),
        }
    }

    fn decode_row_description(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_fields = body.get_i16().max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(body)?;
            need(body, 18)?;
            fields.push(FieldDescription {
                name,
                table_oid: body.get_i32(),
                column_attr: body.get_i16(),
                type_oid: Oid::from_i32(body.get_i32()),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: body.get_i16(),
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_cols = body.get_i16().max(0) as usize;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            need(body, 4)?;
            let len = body.get_i32();
            if len < 0 {
                values.push(None);
            } else {
                need(body, len as usize)?;
                values.push(Some(body.split_to(len as usize)));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut Bytes) -> PgResult<Self> {
        need(body, 2)?;
        let num_params = body.get_i16().max(0) as usize;
        need(body, num_params * 4)?;
        let type_oids = (0..num_params)
            .map(|_| Oid::from_i32(body.get_i32()))
            .collect();
        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn need(buf: &Bytes, n: usize) -> PgResult<()> {
    if buf.remaining() < n {
        return Err(PgError::Protocol("Truncated message body".to_string()));
    }
    Ok(())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = match std::str::from_utf8(&buf[..end]) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(&buf[..end]).into_owned(),
    };

    buf.advance(end + 1);
    Ok(s)
}

/// Read error/notice response fields
fn read_error_fields(body: &mut Bytes) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while body.has_remaining() {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(body)?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// MD5 password response: `md5` + hex(md5(hex(md5(password + user)) + salt)).
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
