// Tests for the messages module
// Frontend message layouts, ErrorResponse decoding and the socket helpers.

// Standard library imports
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

// External crate imports
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

// Internal crate imports
use crate::constants::{PROTOCOL_VERSION_NUMBER, SSL_REQUEST_CODE};
use crate::encoding::Encoding;
use crate::errors::Error;
use crate::messages::{
    bind, cancel_request, cleartext_password, close, describe, execute, flush,
    md5_hash_password, parse, password_message, read_eof, simple_query, ssl_request,
    startup_message, sync, terminate, write_all_flush, BytesMutReader, ServerErrorMessage,
};

// Mock implementation for AsyncReadExt
struct MockReader {
    data: Vec<Vec<u8>>,
    current_index: usize,
}

impl AsyncRead for MockReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), IoError>> {
        if self.current_index >= self.data.len() {
            // Peer closed: a read of zero bytes.
            return Poll::Ready(Ok(()));
        }

        let data = &self.data[self.current_index];
        let to_copy = std::cmp::min(buf.remaining(), data.len());
        buf.put_slice(&data[..to_copy]);
        self.current_index += 1;

        Poll::Ready(Ok(()))
    }
}

// Mock implementation for AsyncWriteExt
struct MockWriter {
    written: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_flush: bool,
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, IoError>> {
        self.written.lock().unwrap().push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        if self.fail_flush {
            return Poll::Ready(Err(IoError::new(ErrorKind::BrokenPipe, "broken pipe")));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        Poll::Ready(Ok(()))
    }
}

/// Split a framed message into its code, declared length and body.
fn unframe(bytes: &[u8]) -> (u8, i32, &[u8]) {
    let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    (bytes[0], len, &bytes[5..])
}

// Tests for startup-phase packets
#[test]
fn test_startup_message_layout() {
    let result = startup_message(&[("user", "app"), ("database", "orders")]).unwrap();

    let len = i32::from_be_bytes([result[0], result[1], result[2], result[3]]);
    assert_eq!(len as usize, result.len());
    assert_eq!(&result[4..8], &PROTOCOL_VERSION_NUMBER.to_be_bytes());
    assert_eq!(&result[8..], b"user\0app\0database\0orders\0\0");
}

#[test]
fn test_startup_message_rejects_nul() {
    let result = startup_message(&[("user", "a\0b")]);
    assert!(result.is_err());
}

#[test]
fn test_ssl_request() {
    let result = ssl_request();
    assert_eq!(result.len(), 8);
    assert_eq!(&result[0..4], &8i32.to_be_bytes());
    assert_eq!(&result[4..8], &SSL_REQUEST_CODE.to_be_bytes());
}

#[test]
fn test_cancel_request() {
    let result = cancel_request(4242, -7);

    let mut expected = BytesMut::new();
    expected.put_i32(16);
    expected.put_i16(1234);
    expected.put_i16(5678);
    expected.put_i32(4242);
    expected.put_i32(-7);
    assert_eq!(result, expected);
}

#[test]
fn test_terminate_sync_flush() {
    assert_eq!(&terminate()[..], b"X\0\0\0\x04");
    assert_eq!(&sync()[..], b"S\0\0\0\x04");
    assert_eq!(&flush()[..], b"H\0\0\0\x04");
}

// Tests for password messages
#[test]
fn test_md5_hash_password() {
    // md5(md5("secret" + "app") + salt), as computed by libpq.
    let hash = md5_hash_password("app", "secret", &[1, 2, 3, 4]);
    assert_eq!(hash.len(), 3 + 32 + 1);
    assert!(hash.starts_with(b"md5"));
    assert_eq!(hash.last(), Some(&0));
    assert!(hash[3..35].iter().all(|b| b.is_ascii_hexdigit()));

    // Same input, same digest; different salt, different digest.
    assert_eq!(hash, md5_hash_password("app", "secret", &[1, 2, 3, 4]));
    assert_ne!(hash, md5_hash_password("app", "secret", &[4, 3, 2, 1]));
}

#[test]
fn test_password_messages() {
    let result = cleartext_password("secret").unwrap();
    let (code, len, body) = unframe(&result);
    assert_eq!(code, b'p');
    assert_eq!(len, 4 + 7);
    assert_eq!(body, b"secret\0");

    let digest = md5_hash_password("app", "secret", b"salt");
    let result = password_message(&digest);
    let (code, len, body) = unframe(&result);
    assert_eq!(code, b'p');
    assert_eq!(len as usize, 4 + digest.len());
    assert_eq!(body, &digest[..]);
}

// Tests for query messages
#[test]
fn test_simple_query() {
    let result = simple_query("select 1", &Encoding::Utf8).unwrap();
    let (code, len, body) = unframe(&result);
    assert_eq!(code, b'Q');
    assert_eq!(len as usize, result.len() - 1);
    assert_eq!(body, b"select 1\0");

    assert!(matches!(
        simple_query("select '\0'", &Encoding::Utf8),
        Err(Error::StatementCreation(_))
    ));
}

#[test]
fn test_simple_query_latin1() {
    let result = simple_query("select 'café'", &Encoding::Latin1).unwrap();
    let (_, _, body) = unframe(&result);
    assert_eq!(body, b"select 'caf\xE9'\0");
}

#[test]
fn test_parse_message() {
    let result = parse("S_1", "select $1::int", &[23], &Encoding::Utf8).unwrap();
    let (code, len, body) = unframe(&result);
    assert_eq!(code, b'P');
    assert_eq!(len as usize, result.len() - 1);

    let mut expected = BytesMut::new();
    expected.put_slice(b"S_1\0select $1::int\0");
    expected.put_i16(1);
    expected.put_i32(23);
    assert_eq!(body, &expected[..]);
}

#[test]
fn test_bind_message() {
    let params = vec![Some(Bytes::from_static(b"42")), None];
    let result = bind("", "S_1", &params, &Encoding::Utf8).unwrap();
    let (code, _, body) = unframe(&result);
    assert_eq!(code, b'B');

    let mut expected = BytesMut::new();
    expected.put_slice(b"\0S_1\0");
    expected.put_i16(0); // parameter formats
    expected.put_i16(2);
    expected.put_i32(2);
    expected.put_slice(b"42");
    expected.put_i32(-1);
    expected.put_i16(0); // result formats
    assert_eq!(body, &expected[..]);
}

#[test]
fn test_describe_execute_close() {
    let result = describe(b'P', "", &Encoding::Utf8).unwrap();
    assert_eq!(&result[..], b"D\0\0\0\x06P\0");

    let result = execute("", 100, &Encoding::Utf8).unwrap();
    let (code, len, body) = unframe(&result);
    assert_eq!(code, b'E');
    assert_eq!(len, 9);
    assert_eq!(body, b"\0\0\0\0\x64");

    let result = close(b'S', "S_7", &Encoding::Utf8).unwrap();
    assert_eq!(&result[..], b"C\0\0\0\x09SS_7\0");
}

// Tests for ErrorResponse decoding
#[test]
fn test_server_error_message_parse() {
    let body = "SERROR\0VERROR\0C42P01\0Mrelation \"t\" does not exist\0P15\0\
                Fparse_relation.c\0L1392\0RparserOpenTable\0\0";
    let message = ServerErrorMessage::parse(body);

    assert_eq!(message.severity, "ERROR");
    assert_eq!(message.code, "42P01");
    assert_eq!(message.message, "relation \"t\" does not exist");
    assert_eq!(message.position, Some(15));
    assert_eq!(message.file_name.as_deref(), Some("parse_relation.c"));
    assert_eq!(message.line, Some(1392));
    assert_eq!(message.routine.as_deref(), Some("parserOpenTable"));
    assert_eq!(message.detail, None);
}

#[test]
fn test_server_error_message_old_server() {
    // Before 9.6 there is no non-localized severity.
    let message = ServerErrorMessage::parse("SFEHLER\0C22012\0MDivision durch Null\0\0");
    assert_eq!(message.severity, "FEHLER");
    assert_eq!(message.severity_localized, "FEHLER");
    assert_eq!(message.code, "22012");
}

#[test]
fn test_server_error_message_render() {
    let message = ServerErrorMessage::parse(
        "SERROR\0VERROR\0C23505\0Mduplicate key value\0DKey (id)=(1) already exists.\0\
         Huse another id\0\0",
    );

    let full = message.render(true);
    assert!(full.starts_with("ERROR: duplicate key value"));
    assert!(full.contains("Detail: Key (id)=(1) already exists."));
    assert!(full.contains("Hint: use another id"));
    assert!(full.contains("Server SQLState: 23505"));

    let redacted = message.render(false);
    assert!(!redacted.contains("Key (id)=(1)"));
    assert!(!redacted.contains("Hint"));
    assert!(redacted.contains("Server SQLState: 23505"));
}

// Tests for BytesMutReader
#[test]
fn test_bytes_mut_reader() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"name\0");
    bytes.put_i32(23);
    bytes.put_i16(-1);

    assert_eq!(bytes.read_string(&Encoding::Utf8).unwrap(), "name");
    assert_eq!(bytes.read_i32_checked().unwrap(), 23);
    assert_eq!(bytes.read_i16_checked().unwrap(), -1);
    assert!(bytes.is_empty());

    assert!(matches!(
        bytes.read_i32_checked(),
        Err(Error::ParseBytesError(_))
    ));
    assert!(matches!(
        bytes.read_i16_checked(),
        Err(Error::ParseBytesError(_))
    ));
}

#[test]
fn test_bytes_mut_reader_unterminated() {
    let mut bytes = BytesMut::from(&b"no terminator"[..]);
    assert!(matches!(
        bytes.read_string(&Encoding::Utf8),
        Err(Error::ParseBytesError(_))
    ));
    // Nothing consumed.
    assert_eq!(bytes.len(), 13);
}

// Tests for socket helpers
#[tokio::test]
async fn test_write_all_flush() {
    let written = Arc::new(Mutex::new(Vec::new()));
    let mut writer = MockWriter {
        written: written.clone(),
        fail_flush: false,
    };

    write_all_flush(&mut writer, &sync()).await.unwrap();
    assert_eq!(written.lock().unwrap().concat(), b"S\0\0\0\x04".to_vec());
}

#[tokio::test]
async fn test_write_all_flush_error() {
    let mut writer = MockWriter {
        written: Arc::new(Mutex::new(Vec::new())),
        fail_flush: true,
    };

    let result = write_all_flush(&mut writer, &terminate()).await;
    assert!(matches!(result, Err(Error::SocketError(_))));
}

#[tokio::test]
async fn test_read_eof() {
    let mut reader = MockReader {
        data: vec![],
        current_index: 0,
    };
    assert!(read_eof(&mut reader).await.is_ok());

    let mut reader = MockReader {
        data: vec![b"N".to_vec()],
        current_index: 0,
    };
    assert!(matches!(
        read_eof(&mut reader).await,
        Err(Error::ProtocolViolation(_))
    ));
}
