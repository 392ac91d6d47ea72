//! Errors.

// Standard library imports
use std::sync::Arc;

// Internal crate imports
use crate::constants::{
    CONNECTION_FAILURE_STATE, INVALID_SQL_STATEMENT_NAME, NOT_IMPLEMENTED,
    PROTOCOL_VIOLATION_STATE,
};
use crate::messages::ServerErrorMessage;

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    /// Malformed or unexpected message framing. Always fatal to the connection.
    ProtocolViolation(String),
    /// I/O failure or a server report the client cannot live with. Always fatal.
    ConnectionFailure(String),
    /// Decoded ErrorResponse. Fatal to the statement, not necessarily to the connection.
    Server(ServerError),
    /// The cache create action failed.
    StatementCreation(String),
    SocketError(String),
    TlsError(String),
    AuthError(String),
    BadConfig(String),
    ParseBytesError(String),
    ConnectionClosed,
}

impl Error {
    /// Errors after which the physical connection must not be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::ParseBytesError(_)
                | Error::ConnectionFailure(_)
                | Error::SocketError(_)
                | Error::TlsError(_)
                | Error::ConnectionClosed
        )
    }

    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.sql_state()),
            Error::ProtocolViolation(_) | Error::ParseBytesError(_) => {
                Some(PROTOCOL_VIOLATION_STATE)
            }
            Error::ConnectionFailure(_)
            | Error::SocketError(_)
            | Error::TlsError(_)
            | Error::ConnectionClosed => Some(CONNECTION_FAILURE_STATE),
            _ => None,
        }
    }

    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(err) => Some(err),
            _ => None,
        }
    }
}

/// An ErrorResponse turned into a value, chained to the error that
/// first failed the current transaction.
#[derive(Debug, PartialEq, Clone)]
pub struct ServerError {
    message: Arc<ServerErrorMessage>,
    log_detail: bool,
    cause: Option<Arc<ServerError>>,
}

impl ServerError {
    pub fn new(message: ServerErrorMessage, log_detail: bool) -> ServerError {
        ServerError {
            message: Arc::new(message),
            log_detail,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: Arc<ServerError>) -> ServerError {
        self.cause = Some(cause);
        self
    }

    pub fn server_message(&self) -> &ServerErrorMessage {
        &self.message
    }

    pub fn sql_state(&self) -> &str {
        &self.message.code
    }

    pub fn message(&self) -> &str {
        &self.message.message
    }

    pub fn routine(&self) -> Option<&str> {
        self.message.routine.as_deref()
    }

    pub fn cause(&self) -> Option<&ServerError> {
        self.cause.as_deref()
    }

    /// The error that started the chain.
    pub fn root_cause(&self) -> &ServerError {
        let mut current = self;
        while let Some(cause) = current.cause() {
            current = cause;
        }
        current
    }

    /// A statement the server no longer recognises, or whose cached plan
    /// changed shape. Re-parsing the statement fixes both.
    pub fn is_stale_cached_plan(&self) -> bool {
        // "prepared statement \"S_2\" does not exist"
        if self.sql_state() == INVALID_SQL_STATEMENT_NAME {
            return true;
        }
        if self.sql_state() != NOT_IMPLEMENTED {
            return false;
        }
        // "cached plan must not change result type"
        matches!(
            self.routine(),
            Some("RevalidateCachedQuery") | Some("RevalidateCachedPlan")
        )
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message.render(self.log_detail))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::ProtocolViolation(msg) => write!(f, "Protocol error: {msg}"),
            Error::ConnectionFailure(msg) => write!(f, "Connection failure: {msg}"),
            Error::Server(err) => write!(f, "{err}"),
            Error::StatementCreation(msg) => write!(f, "Could not create statement: {msg}"),
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::TlsError(msg) => write!(f, "SSL error: {msg}"),
            Error::AuthError(msg) => write!(f, "Authentication failed: {msg}"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::ParseBytesError(msg) => write!(f, "Failed to parse bytes: {msg}"),
            Error::ConnectionClosed => write!(f, "This connection has been closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Self {
        Error::StatementCreation(format!(
            "Zero bytes may not occur in string parameters: {err}"
        ))
    }
}
