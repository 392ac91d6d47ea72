// Used in the StartupMessage to indicate regular handshake.
pub const PROTOCOL_VERSION_NUMBER: i32 = 196608;
pub const PROTOCOL_MAJOR_VERSION: i32 = 3;

// SSLRequest: used to indicate we want an SSL connection.
pub const SSL_REQUEST_CODE: i32 = 80877103;

// CancelRequest: length, then the code split in two int16 halves (1234, 5678).
pub const CANCEL_REQUEST_LEN: i32 = 16;
pub const CANCEL_REQUEST_MAJOR: i16 = 1234;
pub const CANCEL_REQUEST_MINOR: i16 = 5678;

// ErrorResponse: A code identifying the field type; if zero, this is the message terminator and no string follows.
pub const MESSAGE_TERMINATOR: u8 = 0;

// AuthenticationOk
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
// AuthenticationCleartextPassword
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
// AuthenticationMD5Password
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
// SASL
pub const SASL: i32 = 10;

// Fixed payload lengths, length field included.
pub const BACKEND_KEY_DATA_LEN: i32 = 12;
pub const READY_FOR_QUERY_LEN: i32 = 5;

// Upper bound on messages before the first ReadyForQuery.
pub const MAX_STARTUP_MESSAGES: usize = 1000;

pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

pub const DEFAULT_PORT: u16 = 5432;

// SQLSTATE codes the engine inspects or produces.
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";
pub const NOT_IMPLEMENTED: &str = "0A000";
pub const PROTOCOL_VIOLATION_STATE: &str = "08P01";
pub const CONNECTION_FAILURE_STATE: &str = "08006";
