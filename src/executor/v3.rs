//! Protocol version 3 implementation of the query executor.

// Standard library imports
use std::time::Duration;

// External crate imports
use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Instant};

// Internal crate imports
use crate::config::{PreferQueryMode, ProtocolOptions};
use crate::constants::PROTOCOL_MAJOR_VERSION;
use crate::encoding::Encoding;
use crate::errors::Error;
use crate::executor::base::{ExecutorBase, Notification, TransactionState};
use crate::executor::QueryExecutor;
use crate::messages::{bind, close, describe, execute, parse, simple_query, sync, BytesMutReader};
use crate::query::CachedQuery;
use crate::transport::PgStream;

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

/// Receives the results of one request as they are decoded.
pub trait ResultHandler {
    fn handle_row_description(&mut self, _fields: Vec<FieldDescription>) {}

    /// Raw column values, `None` for SQL NULL.
    fn handle_data_row(&mut self, _row: Vec<Option<Bytes>>) {}

    fn handle_command_status(&mut self, _status: &str) {}

    fn handle_portal_suspended(&mut self) {}

    fn handle_error(&mut self, _error: &Error) {}

    fn handle_completion(&mut self) {}
}

/// Keeps everything it is handed.
#[derive(Debug, Default)]
pub struct RowCollector {
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<Vec<Option<Bytes>>>,
    pub statuses: Vec<String>,
    pub errors: Vec<Error>,
    pub suspended: bool,
    pub completed: bool,
}

impl ResultHandler for RowCollector {
    fn handle_row_description(&mut self, fields: Vec<FieldDescription>) {
        self.fields = fields;
    }

    fn handle_data_row(&mut self, row: Vec<Option<Bytes>>) {
        self.rows.push(row);
    }

    fn handle_command_status(&mut self, status: &str) {
        self.statuses.push(status.to_string());
    }

    fn handle_portal_suspended(&mut self) {
        self.suspended = true;
    }

    fn handle_error(&mut self, error: &Error) {
        self.errors.push(error.clone());
    }

    fn handle_completion(&mut self) {
        self.completed = true;
    }
}

/// Query executor speaking protocol 3.0.
#[derive(Debug)]
pub struct QueryExecutorImpl<S> {
    base: ExecutorBase<S>,
    next_statement_id: u64,
}

impl<S> QueryExecutorImpl<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Take over an authenticated stream and read the startup messages.
    pub async fn new(
        stream: PgStream<S>,
        user: &str,
        database: &str,
        options: ProtocolOptions,
    ) -> Result<QueryExecutorImpl<S>, Error> {
        let mut executor = QueryExecutorImpl {
            base: ExecutorBase::new(stream, user, database, options),
            next_statement_id: 1,
        };

        let result = executor.base.read_startup_messages().await;
        if result.is_err() {
            executor.base.abort().await;
        }
        result?;

        debug!(
            "Server {} ready, backend pid {}",
            executor.base,
            executor.base.backend_pid()
        );
        Ok(executor)
    }

    fn next_statement_name(&mut self) -> String {
        let name = format!("S_{}", self.next_statement_id);
        self.next_statement_id += 1;
        name
    }

    /// Whether this execution should create a named server-side statement.
    fn use_named_statement(&self, query: &CachedQuery) -> bool {
        let options = self.base.options();
        match options.prefer_query_mode {
            PreferQueryMode::Simple => false,
            PreferQueryMode::ExtendedCacheEverything => true,
            _ => {
                options.prepare_threshold > 0
                    && query.execute_count() >= options.prepare_threshold
            }
        }
    }

    /// Queue Close messages for statements evicted from the cache.
    fn send_pending_closes(&mut self) -> Result<(), Error> {
        let names: Vec<String> = self.base.pending_close.lock().drain(..).collect();
        for name in names {
            trace!(" FE=> CloseStatement({name})");
            let message = close(b'S', &name, self.base.stream.encoding())?;
            self.base.stream.send(&message);
        }
        Ok(())
    }

    async fn receive_row_description(&mut self) -> Result<Vec<FieldDescription>, Error> {
        let len = self.base.stream.receive_integer4().await?;
        let body = self.base.stream.receive_bytes(message_body_len(len)?).await?;
        let encoding = self.base.stream.encoding().clone();

        let fields = decode_row_description(body, &encoding).map_err(malformed("RowDescription"))?;
        trace!(" <=BE RowDescription({})", fields.len());
        Ok(fields)
    }

    async fn receive_data_row(&mut self) -> Result<Vec<Option<Bytes>>, Error> {
        let len = self.base.stream.receive_integer4().await?;
        let body = self.base.stream.receive_bytes(message_body_len(len)?).await?;

        let row = decode_data_row(body).map_err(malformed("DataRow"))?;
        trace!(" <=BE DataRow(len={len})");
        Ok(row)
    }

    async fn receive_notification(&mut self) -> Result<Notification, Error> {
        // message size
        self.base.stream.receive_integer4().await?;
        let pid = self.base.stream.receive_integer4().await?;
        let name = self.base.stream.receive_cstring().await?;
        let parameter = self.base.stream.receive_cstring().await?;

        trace!(" <=BE AsyncNotify({pid},{name},{parameter})");
        Ok(Notification {
            name,
            parameter,
            pid,
        })
    }

    /// Read an empty-bodied message (ParseComplete, BindComplete, ...).
    async fn receive_empty(&mut self, what: &str) -> Result<(), Error> {
        let len = self.base.stream.receive_integer4().await?;
        if len != 4 {
            return Err(Error::ProtocolViolation(format!(
                "Unexpected length of {what} message: {len}"
            )));
        }
        trace!(" <=BE {what}");
        Ok(())
    }

    /// Dispatch backend messages until ReadyForQuery. The first server error
    /// is returned once the server is ready again.
    async fn process_results(
        &mut self,
        handler: &mut dyn ResultHandler,
        mut query: Option<&mut CachedQuery>,
        parse_name: Option<String>,
    ) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;

        loop {
            let code = self.base.stream.receive_char().await?;
            match code {
                // ParseComplete
                b'1' => {
                    self.receive_empty("ParseComplete").await?;
                    if let (Some(query), Some(name)) = (query.as_deref_mut(), &parse_name) {
                        query.set_prepared(name.clone(), self.base.deallocate_epoch);
                    }
                }

                // BindComplete
                b'2' => self.receive_empty("BindComplete").await?,

                // CloseComplete
                b'3' => self.receive_empty("CloseComplete").await?,

                // NoData
                b'n' => self.receive_empty("NoData").await?,

                // PortalSuspended
                b's' => {
                    self.receive_empty("PortalSuspended").await?;
                    if let Some(query) = query.as_deref_mut() {
                        query.portal_suspended = true;
                    }
                    handler.handle_portal_suspended();
                }

                // ParameterDescription
                b't' => {
                    let len = self.base.stream.receive_integer4().await?;
                    self.base.stream.skip(message_body_len(len)?).await?;
                    trace!(" <=BE ParameterDescription");
                }

                b'T' => {
                    let fields = self.receive_row_description().await?;
                    handler.handle_row_description(fields);
                }

                b'D' => {
                    let row = self.receive_data_row().await?;
                    handler.handle_data_row(row);
                }

                // CommandComplete
                b'C' => {
                    let status = self.base.receive_command_status().await?;
                    if status.starts_with("DEALLOCATE ALL") || status.starts_with("DISCARD ALL") {
                        self.base.on_deallocate_all();
                    }
                    handler.handle_command_status(&status);
                }

                // EmptyQueryResponse
                b'I' => self.receive_empty("EmptyQuery").await?,

                b'E' => {
                    let server_error = self.base.receive_error_response().await?;
                    if server_error.is_stale_cached_plan() {
                        if let Some(query) = query.as_deref_mut() {
                            if let Some(name) = query.unprepare() {
                                self.base.pending_close.lock().push_back(name);
                            }
                        }
                    }
                    let err = Error::Server(server_error);
                    handler.handle_error(&err);
                    first_error.get_or_insert(err);
                }

                b'N' => {
                    let warning = self.base.receive_notice_response().await?;
                    self.base.add_warning(warning);
                }

                b'A' => {
                    let notification = self.receive_notification().await?;
                    self.base.add_notification(notification);
                }

                b'S' => self.base.receive_parameter_status().await?,

                b'Z' => {
                    self.base.receive_rfq().await?;
                    break;
                }

                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "Unknown Response Type {}",
                        other as char
                    )))
                }
            }
        }

        handler.handle_completion();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_prepared(
        &mut self,
        query: &mut CachedQuery,
        params: &[Option<Bytes>],
    ) -> Result<Option<String>, Error> {
        let epoch = self.base.deallocate_epoch;
        if query.is_prepared() && !query.is_prepared_in(epoch) {
            // The server already dropped it.
            query.unprepare();
        }

        self.send_pending_closes()?;
        query.increase_execute_count();

        let (statement, parse_name) = match query.statement_name() {
            Some(name) => (name.to_string(), None),
            None if self.use_named_statement(query) => {
                let name = self.next_statement_name();
                (name.clone(), Some(name))
            }
            None => (String::new(), Some(String::new())),
        };

        let encoding = self.base.stream.encoding().clone();
        let mut messages = BytesMut::new();

        if let Some(name) = &parse_name {
            trace!(" FE=> Parse(stmt={name},query=\"{}\")", query.query.sql);
            messages.extend_from_slice(&parse(name, &query.query.sql, &[], &encoding)?);
        }

        trace!(" FE=> Bind(stmt={statement},portal=)");
        messages.extend_from_slice(&bind("", &statement, params, &encoding)?);
        trace!(" FE=> Describe(portal=)");
        messages.extend_from_slice(&describe(b'P', "", &encoding)?);
        trace!(" FE=> Execute(portal=,limit={})", query.fetch_size);
        messages.extend_from_slice(&execute("", query.fetch_size, &encoding)?);
        trace!(" FE=> Sync");
        messages.extend_from_slice(&sync());

        self.base.stream.send(&messages);
        self.base.stream.flush().await?;

        // An unnamed statement is not remembered.
        Ok(parse_name.filter(|name| !name.is_empty()))
    }
}

impl<S> QueryExecutor for QueryExecutorImpl<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Stream = S;

    fn base(&self) -> &ExecutorBase<S> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ExecutorBase<S> {
        &mut self.base
    }

    fn protocol_version(&self) -> i32 {
        PROTOCOL_MAJOR_VERSION
    }

    async fn execute_simple(
        &mut self,
        sql: &str,
        handler: &mut dyn ResultHandler,
    ) -> Result<(), Error> {
        self.base.ensure_open()?;

        let message = simple_query(sql, self.base.stream.encoding())?;
        trace!(" FE=> SimpleQuery(\"{sql}\")");
        self.base.stream.send(&message);

        let result = match self.base.stream.flush().await {
            Ok(()) => self.process_results(handler, None, None).await,
            Err(err) => Err(err),
        };
        self.base.check_fatal(result).await
    }

    async fn execute_prepared(
        &mut self,
        query: &mut CachedQuery,
        params: &[Option<Bytes>],
        handler: &mut dyn ResultHandler,
    ) -> Result<(), Error> {
        self.base.ensure_open()?;
        query.portal_suspended = false;

        let result = match self.send_prepared(query, params).await {
            Ok(parse_name) => self.process_results(handler, Some(query), parse_name).await,
            Err(err) => Err(err),
        };
        self.base.check_fatal(result).await
    }

    async fn process_notifies(&mut self, wait: Option<Duration>) -> Result<(), Error> {
        self.base.ensure_open()?;
        // Asynchronous messages are only read between requests.
        if self.base.transaction_state() != TransactionState::Idle {
            return Ok(());
        }

        let deadline = wait.map(|wait| Instant::now() + wait);
        let result: Result<(), Error> = async {
            loop {
                let remaining = match deadline {
                    Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                    // Only what is already available.
                    None => Duration::ZERO,
                };
                let code = match timeout(remaining, self.base.stream.receive_char()).await {
                    Ok(code) => code?,
                    Err(_) => return Ok(()),
                };

                match code {
                    b'A' => {
                        let notification = self.receive_notification().await?;
                        self.base.add_notification(notification);
                    }
                    b'E' => return Err(Error::Server(self.base.receive_error_response().await?)),
                    b'N' => {
                        let warning = self.base.receive_notice_response().await?;
                        self.base.add_warning(warning);
                    }
                    b'S' => self.base.receive_parameter_status().await?,
                    other => {
                        return Err(Error::ProtocolViolation(format!(
                            "Unknown Response Type {}",
                            other as char
                        )))
                    }
                }
            }
        }
        .await;
        self.base.check_fatal(result).await
    }
}

fn message_body_len(len: i32) -> Result<usize, Error> {
    if len < 4 {
        return Err(Error::ProtocolViolation(format!(
            "Invalid message length: {len}"
        )));
    }
    Ok(len as usize - 4)
}

/// Body decoding failures mean the stream is out of step with the server.
fn malformed(what: &'static str) -> impl Fn(Error) -> Error {
    move |err| match err {
        Error::ParseBytesError(msg) => {
            Error::ProtocolViolation(format!("Malformed {what} message: {msg}"))
        }
        other => other,
    }
}

fn decode_row_description(
    mut body: BytesMut,
    encoding: &Encoding,
) -> Result<Vec<FieldDescription>, Error> {
    let count = body.read_i16_checked()?;
    let mut fields = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        fields.push(FieldDescription {
            name: body.read_string(encoding)?,
            table_oid: body.read_i32_checked()?,
            column_attr: body.read_i16_checked()?,
            type_oid: body.read_i32_checked()?,
            type_size: body.read_i16_checked()?,
            type_modifier: body.read_i32_checked()?,
            format: body.read_i16_checked()?,
        });
    }
    Ok(fields)
}

fn decode_data_row(mut body: BytesMut) -> Result<Vec<Option<Bytes>>, Error> {
    let count = body.read_i16_checked()?;
    let mut row = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count {
        let size = body.read_i32_checked()?;
        if size < 0 {
            row.push(None);
            continue;
        }
        let size = size as usize;
        if body.len() < size {
            return Err(Error::ProtocolViolation(format!(
                "DataRow column of {size} bytes exceeds message"
            )));
        }
        row.push(Some(body.split_to(size).freeze()));
    }
    Ok(row)
}
