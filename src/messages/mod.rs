// Frontend message builders, backend field decoding and socket helpers.

// Declare submodules
pub mod config_socket;
pub mod error;
pub mod protocol;
pub mod socket;
pub mod types;

// Re-export public items
pub use config_socket::configure_tcp_socket;
pub use error::ServerErrorMessage;
pub use protocol::{
    bind, cancel_request, cleartext_password, close, describe, execute, flush,
    md5_hash_password, parse, password_message, simple_query, ssl_request, startup_message, sync,
    terminate,
};
pub use socket::{read_eof, with_read_timeout, write_all_flush};
pub use types::BytesMutReader;

// Tests
#[cfg(test)]
mod tests;
