// Standard library imports
use std::ffi::CString;

// External crate imports
use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};

// Internal crate imports
use crate::constants::{
    CANCEL_REQUEST_LEN, CANCEL_REQUEST_MAJOR, CANCEL_REQUEST_MINOR, PROTOCOL_VERSION_NUMBER,
    SSL_REQUEST_CODE,
};
use crate::encoding::Encoding;
use crate::errors::Error;

/// Encode `value` and append it null-terminated. Interior nulls are refused,
/// the server would read them as the end of the field.
fn put_cstring(buf: &mut BytesMut, value: &str, encoding: &Encoding) -> Result<(), Error> {
    let c_value = CString::new(encoding.encode(value))?;
    buf.put_slice(c_value.as_bytes_with_nul());
    Ok(())
}

/// Prefix a body with its message code and length.
fn frame(code: u8, body: BytesMut) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(body.len() + 5);
    bytes.put_u8(code);
    bytes.put_i32(body.len() as i32 + 4);
    bytes.put(body);
    bytes
}

/// Create the StartupMessage. Parameters are sent in the order given.
pub fn startup_message(params: &[(&str, &str)]) -> Result<BytesMut, Error> {
    let mut bytes = BytesMut::new();

    // Protocol version
    bytes.put_i32(PROTOCOL_VERSION_NUMBER); // Version 3.0

    for (name, value) in params {
        put_cstring(&mut bytes, name, &Encoding::Utf8)?;
        put_cstring(&mut bytes, value, &Encoding::Utf8)?;
    }
    bytes.put_u8(0); // Null terminator

    let len = bytes.len() as i32 + 4i32;

    let mut startup = BytesMut::with_capacity(len as usize);

    startup.put_i32(len);
    startup.put(bytes);

    Ok(startup)
}

/// Create an SSLRequest.
pub fn ssl_request() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(8);

    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);

    bytes
}

/// Create a CancelRequest for the given backend.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(CANCEL_REQUEST_LEN as usize);

    bytes.put_i32(CANCEL_REQUEST_LEN);
    bytes.put_i16(CANCEL_REQUEST_MAJOR);
    bytes.put_i16(CANCEL_REQUEST_MINOR);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);

    bytes
}

/// Create a Terminate message.
pub fn terminate() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// Create a PasswordMessage. `password` must already carry its terminator
/// when the auth method requires one.
pub fn password_message(password: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(password.len());
    body.put_slice(password);
    frame(b'p', body)
}

/// Cleartext password, null-terminated.
pub fn cleartext_password(password: &str) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    put_cstring(&mut body, password, &Encoding::Utf8)?;
    Ok(frame(b'p', body))
}

/// Create md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();

    // First pass
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());

    let output = md5.finalize_reset();

    // Second pass
    md5.update(format!("{output:x}"));
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);

    password
}

/// Create a simple query message.
pub fn simple_query(query: &str, encoding: &Encoding) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    put_cstring(&mut body, query, encoding)?;
    Ok(frame(b'Q', body))
}

/// Create a Parse message. Parameter types of 0 leave inference to the server.
pub fn parse(
    statement: &str,
    query: &str,
    param_types: &[i32],
    encoding: &Encoding,
) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    put_cstring(&mut body, statement, encoding)?;
    put_cstring(&mut body, query, encoding)?;
    body.put_i16(param_types.len() as i16);
    for oid in param_types {
        body.put_i32(*oid);
    }
    Ok(frame(b'P', body))
}

/// Create a Bind message with text-format parameters and results.
pub fn bind(
    portal: &str,
    statement: &str,
    params: &[Option<Bytes>],
    encoding: &Encoding,
) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    put_cstring(&mut body, portal, encoding)?;
    put_cstring(&mut body, statement, encoding)?;

    // All parameters in text format.
    body.put_i16(0);

    body.put_i16(params.len() as i16);
    for param in params {
        match param {
            Some(value) => {
                body.put_i32(value.len() as i32);
                body.put_slice(value);
            }
            None => body.put_i32(-1),
        }
    }

    // All result columns in text format.
    body.put_i16(0);

    Ok(frame(b'B', body))
}

/// Create a Describe message for a statement ('S') or portal ('P').
pub fn describe(kind: u8, name: &str, encoding: &Encoding) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    body.put_u8(kind);
    put_cstring(&mut body, name, encoding)?;
    Ok(frame(b'D', body))
}

/// Create an Execute message. `max_rows` of 0 fetches everything.
pub fn execute(portal: &str, max_rows: i32, encoding: &Encoding) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    put_cstring(&mut body, portal, encoding)?;
    body.put_i32(max_rows);
    Ok(frame(b'E', body))
}

/// Create a Close message for a statement ('S') or portal ('P').
pub fn close(kind: u8, name: &str, encoding: &Encoding) -> Result<BytesMut, Error> {
    let mut body = BytesMut::new();
    body.put_u8(kind);
    put_cstring(&mut body, name, encoding)?;
    Ok(frame(b'C', body))
}

/// Create a sync message.
pub fn sync() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'S');
    bytes.put_i32(4);
    bytes
}

/// Create a flush message.
pub fn flush() -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'H');
    bytes.put_i32(4);
    bytes
}
