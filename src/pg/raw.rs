//! Non-blocking connection handle.
//!
//! [`RawConnection`] never awaits anything except [`RawConnection::wait`].
//! Every other method performs at most one non-blocking socket call and
//! reports what it needs next, so the engine above can drive it as an
//! explicit state machine:
//!
//! ```text
//! connect_start -> connect_poll* -> Ready
//! send_* -> flush* -> (consume_input, is_busy, get_result)* -> None
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::conninfo::ConnInfo;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::*;
use super::result::{ExecStatus, ResultHandle, SharedFields};
use super::scram::{self, ScramSha256};

/// Bytes requested from the socket per `consume_input` call.
const READ_CHUNK: usize = 16 * 1024;

/// What the handle needs before it can make progress.
#[derive(Debug)]
pub enum Wait {
    NeedRead,
    NeedWrite,
    Done,
    Failed(PgError),
}

impl Wait {
    /// Socket readiness to suspend on, if any.
    pub fn interest(&self) -> Option<Interest> {
        match self {
            Wait::NeedRead => Some(Interest::READABLE),
            Wait::NeedWrite => Some(Interest::WRITABLE),
            Wait::Done | Wait::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Ready,
    Closed,
}

/// One server connection, owned by exactly one engine.
pub struct RawConnection {
    stream: TcpStream,
    info: ConnInfo,
    phase: Phase,
    outbox: BytesMut,
    inbox: BytesMut,
    scram: Option<ScramSha256>,

    /// Completed frames not yet taken by `get_result`.
    results: VecDeque<ResultHandle>,
    /// Frame being assembled from DataRow messages.
    current: Option<ResultHandle>,
    fields: SharedFields,
    /// A command was sent and its ReadyForQuery has not arrived.
    in_flight: bool,
    single_row: bool,
    /// The in-flight command is a bare Parse.
    preparing: bool,

    transaction_status: TransactionStatus,
    parameters: HashMap<String, String>,
    backend_pid: i32,
}

impl RawConnection {
    /// Open the TCP socket and queue the startup packet. The handshake
    /// itself runs through [`connect_poll`](Self::connect_poll).
    pub async fn connect_start(info: ConnInfo) -> PgResult<Self> {
        let stream = TcpStream::connect(info.address()).await?;
        stream.set_nodelay(true)?;

        let mut options = Vec::new();
        if let Some(name) = &info.application_name {
            options.push(("application_name".to_string(), name.clone()));
        }
        options.push(("client_encoding".to_string(), "UTF8".to_string()));

        let mut outbox = BytesMut::with_capacity(1024);
        StartupMessage {
            user: info.user.clone(),
            database: Some(info.database.clone()),
            options,
        }
        .encode_into(&mut outbox);

        debug!(host = %info.host, port = info.port, database = %info.database, "Starting PostgreSQL handshake");

        Ok(Self {
            stream,
            info,
            phase: Phase::Startup,
            outbox,
            inbox: BytesMut::with_capacity(READ_CHUNK),
            scram: None,
            results: VecDeque::new(),
            current: None,
            fields: Arc::new(Vec::new()),
            in_flight: false,
            single_row: false,
            preparing: false,
            transaction_status: TransactionStatus::Idle,
            parameters: HashMap::new(),
            backend_pid: 0,
        })
    }

    /// Advance the startup handshake by one step.
    pub fn connect_poll(&mut self) -> Wait {
        match self.phase {
            Phase::Ready => return Wait::Done,
            Phase::Closed => return Wait::Failed(PgError::ConnectionClosed),
            Phase::Startup => {}
        }

        match self.flush() {
            Ok(Wait::NeedWrite) => return Wait::NeedWrite,
            Ok(_) => {}
            Err(e) => return self.fail(e),
        }
        if let Err(e) = self.consume_input() {
            return self.fail(e);
        }

        match self.phase {
            Phase::Ready => Wait::Done,
            Phase::Closed => Wait::Failed(PgError::ConnectionClosed),
            Phase::Startup if !self.outbox.is_empty() => Wait::NeedWrite,
            Phase::Startup => Wait::NeedRead,
        }
    }

    fn fail(&mut self, e: PgError) -> Wait {
        self.phase = Phase::Closed;
        Wait::Failed(e)
    }

    /// Suspend until the socket is ready for `interest`.
    pub async fn wait(&self, interest: Interest) -> PgResult<()> {
        self.stream.ready(interest).await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn begin_command(&mut self) -> PgResult<()> {
        match self.phase {
            Phase::Ready => {}
            _ => return Err(PgError::ConnectionClosed),
        }
        if self.in_flight || !self.results.is_empty() {
            return Err(PgError::Busy);
        }
        self.in_flight = true;
        self.single_row = false;
        self.preparing = false;
        self.current = None;
        self.fields = Arc::new(Vec::new());
        Ok(())
    }

    /// Queue a simple-protocol query (may contain several statements).
    pub fn send_query(&mut self, sql: &str) -> PgResult<()> {
        self.begin_command()?;
        trace!(sql, "send_query");
        QueryMessage { query: sql }.encode_into(&mut self.outbox);
        Ok(())
    }

    /// Queue a one-shot extended-protocol query with text parameters.
    pub fn send_query_params(&mut self, sql: &str, params: &[Option<String>]) -> PgResult<()> {
        check_param_count(params)?;
        self.begin_command()?;
        trace!(sql, params = params.len(), "send_query_params");
        ParseMessage {
            name: "",
            query: sql,
            param_types: &[],
        }
        .encode_into(&mut self.outbox);
        self.queue_bind_execute("", params);
        Ok(())
    }

    /// Queue creation of a named prepared statement. Completes with a
    /// single `CommandOk` frame.
    pub fn send_prepare(&mut self, name: &str, sql: &str) -> PgResult<()> {
        self.begin_command()?;
        self.preparing = true;
        trace!(name, sql, "send_prepare");
        ParseMessage {
            name,
            query: sql,
            param_types: &[],
        }
        .encode_into(&mut self.outbox);
        SyncMessage.encode_into(&mut self.outbox);
        Ok(())
    }

    /// Queue execution of a previously prepared statement.
    pub fn send_query_prepared(&mut self, name: &str, params: &[Option<String>]) -> PgResult<()> {
        check_param_count(params)?;
        self.begin_command()?;
        trace!(name, params = params.len(), "send_query_prepared");
        self.queue_bind_execute(name, params);
        Ok(())
    }

    fn queue_bind_execute(&mut self, statement: &str, params: &[Option<String>]) {
        BindMessage {
            portal: "",
            statement,
            params,
        }
        .encode_into(&mut self.outbox);
        DescribeMessage { kind: b'P', name: "" }.encode_into(&mut self.outbox);
        ExecuteMessage {
            portal: "",
            max_rows: 0,
        }
        .encode_into(&mut self.outbox);
        SyncMessage.encode_into(&mut self.outbox);
    }

    /// Deliver each row of the in-flight command as its own `SingleTuple`
    /// frame. Only valid straight after a `send_*` call.
    pub fn set_single_row_mode(&mut self) -> bool {
        if !self.in_flight || self.preparing || !self.results.is_empty() || self.current.is_some()
        {
            return false;
        }
        self.single_row = true;
        true
    }

    /// Write as much of the outbox as the socket accepts.
    pub fn flush(&mut self) -> PgResult<Wait> {
        while !self.outbox.is_empty() {
            match self.stream.try_write(&self.outbox) {
                Ok(0) => return Err(self.close_with(PgError::ConnectionClosed)),
                Ok(n) => {
                    let _ = self.outbox.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Wait::NeedWrite),
                Err(e) => return Err(self.close_with(e.into())),
            }
        }
        Ok(Wait::Done)
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Read whatever the socket has and turn complete messages into frames.
    pub fn consume_input(&mut self) -> PgResult<()> {
        if self.phase == Phase::Closed {
            return Err(PgError::ConnectionClosed);
        }
        self.inbox.reserve(READ_CHUNK);
        match self.stream.try_read_buf(&mut self.inbox) {
            Ok(0) => return Err(self.close_with(PgError::ConnectionClosed)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(self.close_with(e.into())),
        }

        loop {
            let msg = match BackendMessage::try_decode(&mut self.inbox) {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.close_with(e)),
            };
            let handled = match self.phase {
                Phase::Startup => self.handle_startup(msg),
                _ => self.handle_query(msg),
            };
            if let Err(e) = handled {
                return Err(self.close_with(e));
            }
        }
    }

    fn close_with(&mut self, e: PgError) -> PgError {
        self.phase = Phase::Closed;
        self.in_flight = false;
        e
    }

    /// True while the in-flight command has no frame ready to hand out.
    pub fn is_busy(&self) -> bool {
        self.in_flight && self.results.is_empty()
    }

    /// Next completed frame. `None` once the command is finished (only
    /// meaningful when [`is_busy`](Self::is_busy) is false).
    pub fn get_result(&mut self) -> Option<ResultHandle> {
        self.results.pop_front()
    }

    /// No command in flight and no frames left to collect.
    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.results.is_empty()
    }

    fn handle_startup(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::AuthenticationOk => {
                debug!("Authentication succeeded");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                let password = self.password()?.to_string();
                PasswordMessage { password }.encode_into(&mut self.outbox);
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                let hash = md5_password(&self.info.user, self.password()?, &salt);
                PasswordMessage { password: hash }.encode_into(&mut self.outbox);
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                let client = ScramSha256::new(&self.info.user, self.password()?);
                SaslInitialResponseMessage {
                    mechanism: scram::MECHANISM.to_string(),
                    data: client.client_first(),
                }
                .encode_into(&mut self.outbox);
                self.scram = Some(client);
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let client = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| PgError::Auth("Unexpected SASL continue".to_string()))?;
                let response = client
                    .client_final(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
                SaslResponseMessage { data: response }.encode_into(&mut self.outbox);
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let client = self
                    .scram
                    .as_mut()
                    .ok_or_else(|| PgError::Auth("Unexpected SASL final".to_string()))?;
                client
                    .verify(&data)
                    .map_err(|e| PgError::Auth(e.to_string()))?;
                self.scram = None;
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData { process_id, .. } => {
                self.backend_pid = process_id;
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.phase = Phase::Ready;
            }
            BackendMessage::ErrorResponse { fields } => {
                return Err(PgError::Server(ServerError::from_fields(&fields)));
            }
            BackendMessage::NoticeResponse { fields } => {
                debug!(notice = ?fields.get(&b'M'), "Notice during startup");
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message during startup: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    fn password(&self) -> PgResult<&str> {
        self.info
            .password
            .as_deref()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    fn handle_query(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::RowDescription { fields } => {
                self.fields = Arc::new(fields);
                self.current = Some(ResultHandle::new(ExecStatus::TuplesOk, self.fields.clone()));
            }
            BackendMessage::DataRow { values } => {
                if self.single_row {
                    let mut frame = ResultHandle::new(ExecStatus::SingleTuple, self.fields.clone());
                    frame.push_row(values);
                    self.results.push_back(frame);
                } else {
                    let fields = self.fields.clone();
                    self.current
                        .get_or_insert_with(|| ResultHandle::new(ExecStatus::TuplesOk, fields))
                        .push_row(values);
                }
            }
            BackendMessage::CommandComplete { tag } => {
                let mut frame = self
                    .current
                    .take()
                    .unwrap_or_else(|| ResultHandle::new(ExecStatus::CommandOk, Arc::new(Vec::new())));
                frame.set_command_tag(tag);
                self.results.push_back(frame);
                self.fields = Arc::new(Vec::new());
            }
            BackendMessage::EmptyQueryResponse => {
                self.current = None;
                self.results
                    .push_back(ResultHandle::new(ExecStatus::EmptyQuery, Arc::new(Vec::new())));
            }
            BackendMessage::ParseComplete => {
                if self.preparing {
                    self.results
                        .push_back(ResultHandle::new(ExecStatus::CommandOk, Arc::new(Vec::new())));
                }
            }
            BackendMessage::ErrorResponse { fields } => {
                // The server skips to Sync; rows gathered so far are void.
                self.current = None;
                self.results
                    .push_back(ResultHandle::failed(ServerError::from_fields(&fields)));
            }
            BackendMessage::ReadyForQuery { status } => {
                self.transaction_status = status;
                self.in_flight = false;
                self.single_row = false;
                self.preparing = false;
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            }
            BackendMessage::NoticeResponse { fields } => {
                debug!(
                    severity = ?fields.get(&b'S'),
                    message = ?fields.get(&b'M'),
                    "Server notice"
                );
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(process_id, %channel, %payload, "Asynchronous notification");
            }
            BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::ParameterDescription { .. } => {}
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message: {:?}",
                    other
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn info(&self) -> &ConnInfo {
        &self.info
    }

    /// Send Terminate without waiting and mark the handle closed.
    pub fn terminate(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.outbox.clear();
        TerminateMessage.encode_into(&mut self.outbox);
        let _ = self.flush();
        self.phase = Phase::Closed;
        self.in_flight = false;
        self.results.clear();
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConnection")
            .field("host", &self.info.host)
            .field("port", &self.info.port)
            .field("phase", &self.phase)
            .field("in_flight", &self.in_flight)
            .field("backend_pid", &self.backend_pid)
            .finish()
    }
}

/// Bind carries its parameter count as an Int16.
fn check_param_count(params: &[Option<String>]) -> PgResult<()> {
    if params.len() > i16::MAX as usize {
        return Err(PgError::Protocol(format!(
            "too many parameters: {} (at most {})",
            params.len(),
            i16::MAX
        )));
    }
    Ok(())
}
