//! State and message decoding shared by every protocol version: startup,
//! transaction status, ParameterStatus side effects, warnings, notifications
//! and the statement cache.

// Standard library imports
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// External crate imports
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

// Internal crate imports
use crate::cache::LruCache;
use crate::cancel::CancelToken;
use crate::config::{AutoSave, EscapeSyntaxCallMode, PreferQueryMode, ProtocolOptions};
use crate::constants::*;
use crate::encoding::Encoding;
use crate::errors::{Error, ServerError};
use crate::messages::{terminate, ServerErrorMessage};
use crate::query::{create_action, CachedQuery, QueryKey, Returning};
use crate::transport::{HostSpec, PgStream, StreamInner};

/// Transaction status as last reported by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    #[default]
    Idle,
    Open,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Idle => write!(f, "IDLE"),
            TransactionState::Open => write!(f, "OPEN"),
            TransactionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Asynchronous NotificationResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub name: String,
    pub parameter: String,
    pub pid: i32,
}

/// Backend process id and secret key, as sent in BackendKeyData.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKey {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Parameter name compared without regard to ASCII case, stored as received.
#[derive(Debug, Clone)]
pub struct ParameterName(String);

impl ParameterName {
    pub fn new(name: &str) -> ParameterName {
        ParameterName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for ParameterName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ParameterName {}

impl PartialOrd for ParameterName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParameterName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .bytes()
            .map(|b| b.to_ascii_lowercase())
            .cmp(other.0.bytes().map(|b| b.to_ascii_lowercase()))
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ParameterStatuses = BTreeMap<ParameterName, String>;

#[derive(Debug, Default)]
struct SharedInner {
    warnings: Vec<ServerErrorMessage>,
    notifications: Vec<Notification>,
    transaction_state: TransactionState,
    standard_conforming_strings: bool,
    backend_key: Option<BackendKey>,
}

/// Connection state that a listener, a canceller or a closer may touch while
/// the main path is busy on the socket. The lock is never held across I/O.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<SharedInner>,
}

impl SharedState {
    pub fn add_warning(&self, warning: ServerErrorMessage) {
        self.inner.lock().warnings.push(warning);
    }

    /// Drain the warning chain, oldest first.
    pub fn take_warnings(&self) -> Vec<ServerErrorMessage> {
        std::mem::take(&mut self.inner.lock().warnings)
    }

    pub fn add_notification(&self, notification: Notification) {
        self.inner.lock().notifications.push(notification);
    }

    pub fn take_notifications(&self) -> Vec<Notification> {
        std::mem::take(&mut self.inner.lock().notifications)
    }

    pub fn has_notifications(&self) -> bool {
        !self.inner.lock().notifications.is_empty()
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.lock().transaction_state
    }

    pub fn set_transaction_state(&self, state: TransactionState) {
        self.inner.lock().transaction_state = state;
    }

    pub fn standard_conforming_strings(&self) -> bool {
        self.inner.lock().standard_conforming_strings
    }

    pub fn set_standard_conforming_strings(&self, value: bool) {
        self.inner.lock().standard_conforming_strings = value;
    }

    pub fn backend_key(&self) -> Option<BackendKey> {
        self.inner.lock().backend_key
    }

    pub fn set_backend_key(&self, key: BackendKey) {
        self.inner.lock().backend_key = Some(key);
    }
}

/// Parse a `server_version` string into the `server_version_num` form:
/// "15.2" -> 150002, "9.6.3" -> 90603. Returns 0 when nothing can be read.
pub fn parse_server_version(version: &str) -> i32 {
    let version = version.split_whitespace().next().unwrap_or("");
    let mut parts = version.split('.').map(|part| {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<i32>().ok()
    });

    let major = match parts.next().flatten() {
        Some(major) => major,
        None => return 0,
    };
    let minor = parts.next().flatten().unwrap_or(0);

    if major >= 10 {
        major * 10000 + minor
    } else {
        let patch = parts.next().flatten().unwrap_or(0);
        major * 10000 + minor * 100 + patch
    }
}

/// The protocol engine state every wire version shares.
pub struct ExecutorBase<S> {
    pub(super) stream: PgStream<S>,
    user: String,
    database: String,
    options: ProtocolOptions,
    shared: Arc<SharedState>,
    transaction_fail_cause: Option<Arc<ServerError>>,
    parameter_statuses: ParameterStatuses,
    server_version: String,
    server_version_num: i32,
    time_zone: Option<String>,
    application_name: Option<String>,
    integer_datetimes: bool,
    flush_cache_on_deallocate: bool,
    statement_cache: LruCache<QueryKey, CachedQuery>,
    /// Server-side statements to Close before the next extended query.
    pub(super) pending_close: Arc<Mutex<VecDeque<String>>>,
    /// Bumped whenever the server drops all prepared statements at once.
    pub(super) deallocate_epoch: u64,
    closed: bool,
    connected_at: chrono::naive::NaiveDateTime,
}

impl<S> fmt::Debug for ExecutorBase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorBase")
            .field("host", self.stream.host_spec())
            .field("user", &self.user)
            .field("database", &self.database)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S> fmt::Display for ExecutorBase<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}@{}]",
            self.stream.host_spec(),
            self.user,
            self.database
        )
    }
}

impl<S> ExecutorBase<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: PgStream<S>,
        user: &str,
        database: &str,
        options: ProtocolOptions,
    ) -> ExecutorBase<S> {
        let pending_close = Arc::new(Mutex::new(VecDeque::new()));
        let evicted = pending_close.clone();
        let statement_cache = LruCache::new(
            options.prepared_statement_cache_queries,
            options.cache_max_bytes(),
            create_action(),
            Box::new(move |mut query: CachedQuery| {
                if let Some(name) = query.unprepare() {
                    debug!("Statement {name} evicted from cache, scheduling close");
                    evicted.lock().push_back(name);
                }
                Ok(())
            }),
        );

        ExecutorBase {
            stream,
            user: user.to_string(),
            database: database.to_string(),
            options,
            shared: Arc::new(SharedState::default()),
            transaction_fail_cause: None,
            parameter_statuses: ParameterStatuses::new(),
            server_version: String::new(),
            server_version_num: 0,
            time_zone: None,
            application_name: None,
            integer_datetimes: true,
            flush_cache_on_deallocate: true,
            statement_cache,
            pending_close,
            deallocate_epoch: 0,
            closed: false,
            connected_at: chrono::offset::Utc::now().naive_utc(),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn host_spec(&self) -> &HostSpec {
        self.stream.host_spec()
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn backend_pid(&self) -> i32 {
        self.shared
            .backend_key()
            .map(|key| key.process_id)
            .unwrap_or(0)
    }

    pub fn set_backend_key_data(&self, process_id: i32, secret_key: i32) {
        self.shared.set_backend_key(BackendKey {
            process_id,
            secret_key,
        });
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken::new(
            self.stream.host_spec().clone(),
            self.options.cancel_signal_timeout(),
            self.shared.clone(),
        )
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.shared.transaction_state()
    }

    /// The first error of the current failed transaction, if any.
    pub fn transaction_fail_cause(&self) -> Option<&ServerError> {
        self.transaction_fail_cause.as_deref()
    }

    pub fn standard_conforming_strings(&self) -> bool {
        self.shared.standard_conforming_strings()
    }

    pub fn encoding(&self) -> &Encoding {
        self.stream.encoding()
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Numeric server version, derived from `server_version` when the server
    /// did not report `server_version_num`.
    pub fn server_version_num(&self) -> i32 {
        if self.server_version_num != 0 {
            return self.server_version_num;
        }
        parse_server_version(&self.server_version)
    }

    pub fn time_zone(&self) -> Option<&str> {
        self.time_zone.as_deref()
    }

    pub fn application_name(&self) -> &str {
        self.application_name.as_deref().unwrap_or("")
    }

    pub fn integer_datetimes(&self) -> bool {
        self.integer_datetimes
    }

    pub fn is_rewrite_batched_inserts_enabled(&self) -> bool {
        self.options.rewrite_batched_inserts
    }

    pub fn is_column_sanitiser_disabled(&self) -> bool {
        self.options.disable_column_sanitiser
    }

    pub fn escape_syntax_call_mode(&self) -> EscapeSyntaxCallMode {
        self.options.escape_syntax_call_mode
    }

    pub fn prefer_query_mode(&self) -> PreferQueryMode {
        self.options.prefer_query_mode
    }

    pub fn autosave(&self) -> AutoSave {
        self.options.autosave
    }

    pub fn set_autosave(&mut self, autosave: AutoSave) {
        self.options.autosave = autosave;
    }

    pub fn is_flush_cache_on_deallocate(&self) -> bool {
        self.flush_cache_on_deallocate
    }

    pub fn set_flush_cache_on_deallocate(&mut self, flush: bool) {
        self.flush_cache_on_deallocate = flush;
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.stream.network_timeout()
    }

    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.stream.set_network_timeout(timeout);
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    pub fn add_warning(&self, warning: ServerErrorMessage) {
        self.shared.add_warning(warning);
    }

    pub fn take_warnings(&self) -> Vec<ServerErrorMessage> {
        self.shared.take_warnings()
    }

    pub fn add_notification(&self, notification: Notification) {
        self.shared.add_notification(notification);
    }

    pub fn take_notifications(&self) -> Vec<Notification> {
        self.shared.take_notifications()
    }

    pub fn parameter_statuses(&self) -> ParameterStatuses {
        self.parameter_statuses.clone()
    }

    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameter_statuses
            .get(&ParameterName::new(name))
            .map(String::as_str)
    }

    fn on_parameter_status(&mut self, name: &str, value: &str) {
        self.parameter_statuses
            .insert(ParameterName::new(name), value.to_string());
    }

    pub fn create_query_key(
        &self,
        sql: &str,
        escape_processing: bool,
        is_parameterized: bool,
        returning: Returning,
    ) -> QueryKey {
        QueryKey::new(sql, escape_processing, is_parameterized, returning)
    }

    pub fn borrow_query(&mut self, sql: &str) -> Result<CachedQuery, Error> {
        self.statement_cache.borrow(QueryKey::Sql(sql.to_string()))
    }

    pub fn borrow_callable_query(&mut self, sql: &str) -> Result<CachedQuery, Error> {
        self.statement_cache.borrow(QueryKey::callable(sql))
    }

    pub fn borrow_returning_query(
        &mut self,
        sql: &str,
        columns: Option<Vec<String>>,
    ) -> Result<CachedQuery, Error> {
        self.statement_cache.borrow(QueryKey::WithReturningColumns {
            sql: sql.to_string(),
            is_parameterized: true,
            escape_processing: true,
            columns,
        })
    }

    pub fn borrow_query_by_key(&mut self, key: QueryKey) -> Result<CachedQuery, Error> {
        self.statement_cache.borrow(key)
    }

    pub fn release_query(&mut self, query: CachedQuery) {
        self.statement_cache.put(query.key.clone(), query);
    }

    pub fn create_query_by_key(&self, key: &QueryKey) -> Result<CachedQuery, Error> {
        self.statement_cache.create(key)
    }

    pub fn create_query(
        &self,
        sql: &str,
        escape_processing: bool,
        is_parameterized: bool,
        returning: Returning,
    ) -> Result<CachedQuery, Error> {
        let key = self.create_query_key(sql, escape_processing, is_parameterized, returning);
        self.create_query_by_key(&key)
    }

    pub fn statement_cache(&self) -> &LruCache<QueryKey, CachedQuery> {
        &self.statement_cache
    }

    /// The server dropped every prepared statement (DEALLOCATE ALL / DISCARD ALL).
    pub(super) fn on_deallocate_all(&mut self) {
        if !self.flush_cache_on_deallocate {
            return;
        }
        warn!("Cleanup server {self} prepared statements cache");
        self.deallocate_epoch += 1;
        self.pending_close.lock().clear();
        self.statement_cache.clear();
    }

    /// Statement errors that a re-parse of the statement fixes.
    pub fn will_heal_via_reparse(&self, err: &Error) -> bool {
        match err.as_server_error() {
            Some(server_error) => server_error.is_stale_cached_plan(),
            None => false,
        }
    }

    /// Whether resubmitting the failed statement can succeed.
    pub fn will_heal_on_retry(&self, err: &Error) -> bool {
        if self.options.autosave == AutoSave::Never
            && self.transaction_state() == TransactionState::Failed
        {
            // Every statement fails until the transaction is rolled back.
            return false;
        }
        self.will_heal_via_reparse(err)
    }

    pub async fn receive_rfq(&mut self) -> Result<(), Error> {
        let len = self.stream.receive_integer4().await?;
        if len != READY_FOR_QUERY_LEN {
            return Err(Error::ProtocolViolation(format!(
                "Unexpected length of ReadyForQuery message: {len}"
            )));
        }

        let status = self.stream.receive_char().await?;
        trace!(" <=BE ReadyForQuery({})", status as char);

        match status {
            b'I' => {
                self.transaction_fail_cause = None;
                self.shared.set_transaction_state(TransactionState::Idle);
            }
            b'T' => {
                self.transaction_fail_cause = None;
                self.shared.set_transaction_state(TransactionState::Open);
            }
            b'E' => self.shared.set_transaction_state(TransactionState::Failed),
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "Unexpected transaction state in ReadyForQuery message: {other}"
                )))
            }
        }
        Ok(())
    }

    /// Decode an ErrorResponse. The first error of a transaction is kept as
    /// the cause of every later one until the transaction ends.
    pub async fn receive_error_response(&mut self) -> Result<ServerError, Error> {
        let len = self.stream.receive_integer4().await?;
        if len <= 4 {
            return Err(Error::ProtocolViolation(format!(
                "Error response length must be greater than 4, got {len}"
            )));
        }

        let body = self.stream.receive_error_string(len as usize - 4).await?;
        let message = ServerErrorMessage::parse(&body);
        trace!(
            " <=BE ErrorMessage({})",
            message.render(self.options.log_server_error_detail)
        );

        let error = ServerError::new(message, self.options.log_server_error_detail);
        let error = match &self.transaction_fail_cause {
            None => {
                self.transaction_fail_cause = Some(Arc::new(error.clone()));
                error
            }
            Some(cause) => error.with_cause(cause.clone()),
        };
        Ok(error)
    }

    pub async fn receive_notice_response(&mut self) -> Result<ServerErrorMessage, Error> {
        let len = self.stream.receive_integer4().await?;
        if len <= 4 {
            return Err(Error::ProtocolViolation(format!(
                "Notice response length must be greater than 4, got {len}"
            )));
        }

        let body = self.stream.receive_string(len as usize - 4).await?;
        let message = ServerErrorMessage::parse(&body);
        trace!(
            " <=BE NoticeResponse({})",
            message.render(self.options.log_server_error_detail)
        );
        Ok(message)
    }

    /// Decode a CommandComplete tag.
    pub async fn receive_command_status(&mut self) -> Result<String, Error> {
        let len = self.stream.receive_integer4().await?;
        if len < 5 {
            return Err(Error::ProtocolViolation(format!(
                "Unexpected length of CommandComplete message: {len}"
            )));
        }
        // -4 for the length, -1 for the trailing terminator
        let status = self.stream.receive_string(len as usize - 5).await?;
        self.stream.receive_char().await?;

        trace!(" <=BE CommandStatus({status})");
        Ok(status)
    }

    pub async fn receive_parameter_status(&mut self) -> Result<(), Error> {
        // message size
        self.stream.receive_integer4().await?;
        let name = self.stream.receive_cstring().await?;
        let value = self.stream.receive_cstring().await?;

        trace!(" <=BE ParameterStatus({name} = {value})");

        if !name.is_empty() {
            self.on_parameter_status(&name, &value);
        }

        match name.as_str() {
            "client_encoding" => {
                let is_utf8 = value.eq_ignore_ascii_case("UTF8") || value.eq_ignore_ascii_case("UTF-8");
                if self.options.allow_encoding_changes {
                    if !is_utf8 {
                        debug!("Expected client_encoding to be UTF8 for proper operation, actual encoding is {value}");
                    }
                    self.stream.set_encoding(Encoding::for_database_name(&value));
                } else if !is_utf8 {
                    // Subsequent strings cannot be trusted.
                    self.close().await;
                    return Err(Error::ConnectionFailure(format!(
                        "The server's client_encoding parameter was changed to {value}. \
                         The driver requires client_encoding to be UTF8 for correct operation."
                    )));
                }
            }
            "DateStyle" => {
                if !value.to_ascii_uppercase().starts_with("ISO") {
                    self.close().await;
                    return Err(Error::ConnectionFailure(format!(
                        "The server's DateStyle parameter was changed to {value}. \
                         The driver requires DateStyle to begin with ISO for correct operation."
                    )));
                }
            }
            "standard_conforming_strings" => match value.as_str() {
                "on" => self.shared.set_standard_conforming_strings(true),
                "off" => self.shared.set_standard_conforming_strings(false),
                _ => {
                    self.close().await;
                    return Err(Error::ConnectionFailure(format!(
                        "The server's standard_conforming_strings parameter was reported as {value}. \
                         The driver expected on or off."
                    )));
                }
            },
            "TimeZone" => self.time_zone = Some(value),
            "application_name" => self.application_name = Some(value),
            "server_version_num" => {
                self.server_version_num = value.parse::<i32>().map_err(|_| {
                    Error::ProtocolViolation(format!(
                        "Invalid server_version_num reported by the server: {value}"
                    ))
                })?;
            }
            "server_version" => self.server_version = value,
            "integer_datetimes" => match value.as_str() {
                "on" => self.integer_datetimes = true,
                "off" => self.integer_datetimes = false,
                _ => {
                    return Err(Error::ProtocolViolation(
                        "Protocol error. Session setup failed.".to_string(),
                    ))
                }
            },
            _ => (),
        }
        Ok(())
    }

    /// Consume everything the server sends after authentication, up to and
    /// including the first ReadyForQuery.
    pub async fn read_startup_messages(&mut self) -> Result<(), Error> {
        for _ in 0..MAX_STARTUP_MESSAGES {
            let code = self.stream.receive_char().await?;
            match code {
                // Ready For Query; we're done.
                b'Z' => return self.receive_rfq().await,

                // BackendKeyData
                b'K' => {
                    let len = self.stream.receive_integer4().await?;
                    if len != BACKEND_KEY_DATA_LEN {
                        return Err(Error::ProtocolViolation(
                            "Protocol error. Session setup failed.".to_string(),
                        ));
                    }
                    let process_id = self.stream.receive_integer4().await?;
                    let secret_key = self.stream.receive_integer4().await?;
                    trace!(" <=BE BackendKeyData(pid={process_id},ckey={secret_key})");
                    self.set_backend_key_data(process_id, secret_key);
                }

                // Startup errors are never retried.
                b'E' => return Err(Error::Server(self.receive_error_response().await?)),

                b'N' => {
                    let warning = self.receive_notice_response().await?;
                    self.add_warning(warning);
                }

                b'S' => self.receive_parameter_status().await?,

                other => {
                    trace!("  invalid message type={}", other as char);
                    return Err(Error::ProtocolViolation(
                        "Protocol error. Session setup failed.".to_string(),
                    ));
                }
            }
        }

        Err(Error::ProtocolViolation(
            "Protocol error. Session setup failed.".to_string(),
        ))
    }

    /// Abort the connection when `result` carries an error it cannot survive.
    pub async fn check_fatal<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(err) = &result {
            if err.is_fatal() && !self.closed {
                warn!("Server {self} connection is unusable: {err}");
                self.abort().await;
            }
        }
        result
    }

    /// Graceful shutdown: Terminate, then close the socket. Errors are
    /// discarded and a second call does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }

        trace!(" FE=> Terminate");
        self.stream.send(&terminate());
        if let Err(err) = self.stream.flush().await {
            debug!("Discarding error on close: {err}");
        }
        if let Err(err) = self.stream.close().await {
            debug!("Discarding error on close: {err}");
        }

        self.closed = true;
        self.log_disconnect("closed");
    }

    /// Close the socket without saying goodbye.
    pub async fn abort(&mut self) {
        if let Err(err) = self.stream.close().await {
            debug!("Ignoring error on abort: {err}");
        }
        if !self.closed {
            self.closed = true;
            self.log_disconnect("terminated");
        }
    }

    fn log_disconnect(&self, how: &str) {
        let now = chrono::offset::Utc::now().naive_utc();
        let duration = now - self.connected_at;
        info!(
            "Server connection {how} {self}, session duration: {}",
            crate::format_duration(&duration)
        );
    }
}

impl ExecutorBase<StreamInner> {
    /// Whether the session runs over SSL.
    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }
}
