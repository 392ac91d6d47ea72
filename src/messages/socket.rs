// Standard library imports
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

// External crate imports
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

// Internal crate imports
use crate::errors::Error;

/// Write all the data in the buffer to the stream and flush the stream.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error flushing socket: {err:?}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Read until the peer closes the stream. Any byte received is a protocol error.
pub async fn read_eof<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    match stream.read_u8().await {
        Ok(code) => Err(Error::ProtocolViolation(format!(
            "Expected an EOF from server, got: {}",
            code as char
        ))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Error reading from socket: {err:?}"
        ))),
    }
}

/// Run a socket read under an optional deadline. An elapsed deadline is a
/// connection failure, the stream is left in an unknown position.
pub async fn with_read_timeout<T, F>(duration: Option<Duration>, fut: F) -> Result<T, Error>
where
    F: Future<Output = std::io::Result<T>>,
{
    let result = match duration {
        Some(duration) => match timeout(duration, fut).await {
            Ok(result) => result,
            Err(_) => {
                return Err(Error::ConnectionFailure(format!(
                    "Read timed out after {} ms",
                    duration.as_millis()
                )))
            }
        },
        None => fut.await,
    };

    result.map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => {
            Error::ConnectionFailure("The server closed the connection unexpectedly".to_string())
        }
        _ => Error::SocketError(format!("Error reading from socket: {err:?}")),
    })
}
