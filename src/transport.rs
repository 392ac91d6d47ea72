//! Framed transport: the byte stream the protocol engine talks through.
//! Reads are buffered, writes are collected and sent on `flush`.

// Standard library imports
use std::time::Duration;

// External crate imports
use bytes::{BufMut, BytesMut};
use log::{debug, error};
use pin_project_lite::pin_project;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;

// Internal crate imports
use crate::constants::{DEFAULT_PORT, MAX_MESSAGE_SIZE};
use crate::encoding::Encoding;
use crate::errors::Error;
use crate::messages::{configure_tcp_socket, read_eof, with_read_timeout, write_all_flush};

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        TCPPlain {
            #[pin]
            stream: TcpStream,
        },
        TCPTls {
            #[pin]
            stream: tokio_native_tls::TlsStream<TcpStream>,
        },
        UnixSocket {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::TCPTls { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_flush(cx),
            StreamInnerProj::TCPTls { stream } => stream.poll_flush(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::TCPTls { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::TCPTls { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl StreamInner {
    pub fn is_tls(&self) -> bool {
        matches!(self, StreamInner::TCPTls { .. })
    }
}

/// Where a server lives. A host starting with `/` is a Unix socket directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
}

impl HostSpec {
    pub fn new(host: &str, port: u16) -> HostSpec {
        HostSpec {
            host: host.to_string(),
            port,
        }
    }

    pub fn is_unix_socket(&self) -> bool {
        self.host.starts_with('/')
    }

    pub fn socket_path(&self) -> String {
        format!("{}/.s.PGSQL.{}", self.host, self.port)
    }
}

impl Default for HostSpec {
    fn default() -> HostSpec {
        HostSpec::new("localhost", DEFAULT_PORT)
    }
}

impl std::fmt::Display for HostSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_unix_socket() {
            write!(f, "{}", self.socket_path())
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Open a plaintext socket to `host`, bounded by `connect_timeout`.
pub async fn connect_stream(
    host: &HostSpec,
    connect_timeout: Option<Duration>,
) -> Result<StreamInner, Error> {
    let connect = async {
        if host.is_unix_socket() {
            UnixStream::connect(host.socket_path())
                .await
                .map(|stream| StreamInner::UnixSocket { stream })
        } else {
            let stream = TcpStream::connect((host.host.as_str(), host.port)).await?;
            // TCP timeouts.
            configure_tcp_socket(&stream);
            Ok(StreamInner::TCPPlain { stream })
        }
    };

    let result = match connect_timeout {
        Some(duration) => match timeout(duration, connect).await {
            Ok(result) => result,
            Err(_) => {
                error!("Connect to {host} timed out");
                return Err(Error::ConnectionFailure(format!(
                    "Connection to {host} timed out after {} ms",
                    duration.as_millis()
                )));
            }
        },
        None => connect.await,
    };

    result.map_err(|err| {
        error!("Could not connect to server {host}: {err}");
        Error::ConnectionFailure(format!(
            "Connection to {host} refused. Check that the hostname and port are correct \
             and that the postmaster is accepting TCP/IP connections: {err}"
        ))
    })
}

/// A connected stream plus the framing and decoding state the protocol needs.
#[derive(Debug)]
pub struct PgStream<S> {
    stream: BufReader<S>,
    write_buffer: BytesMut,
    host: HostSpec,
    encoding: Encoding,
    network_timeout: Option<Duration>,
}

impl<S> PgStream<S> {
    pub fn host_spec(&self) -> &HostSpec {
        &self.host
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout
    }
}

impl<S> PgStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, host: HostSpec) -> PgStream<S> {
        PgStream {
            stream: BufReader::with_capacity(8192, stream),
            write_buffer: BytesMut::with_capacity(8192),
            host,
            encoding: Encoding::Utf8,
            network_timeout: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    /// Switch the charset used to decode every subsequent string.
    pub fn set_encoding(&mut self, encoding: Encoding) {
        debug!("Client encoding for {} set to {}", self.host, encoding);
        self.encoding = encoding;
    }

    /// `None` or a zero duration disables the read deadline.
    pub fn set_network_timeout(&mut self, duration: Option<Duration>) {
        self.network_timeout = duration.filter(|d| !d.is_zero());
    }

    /// True when bytes were read from the socket but not consumed yet.
    pub fn has_buffered_input(&self) -> bool {
        !self.stream.buffer().is_empty()
    }

    /// Give the socket back, refusing if unread bytes would be lost.
    pub fn into_inner(self) -> Result<(S, HostSpec, Option<Duration>), Error> {
        if self.has_buffered_input() {
            return Err(Error::ProtocolViolation(
                "Received unencrypted data after SSL request".to_string(),
            ));
        }
        Ok((self.stream.into_inner(), self.host, self.network_timeout))
    }

    pub async fn receive_char(&mut self) -> Result<u8, Error> {
        with_read_timeout(self.network_timeout, self.stream.read_u8()).await
    }

    pub async fn receive_integer4(&mut self) -> Result<i32, Error> {
        with_read_timeout(self.network_timeout, self.stream.read_i32()).await
    }

    pub async fn receive_integer2(&mut self) -> Result<i16, Error> {
        with_read_timeout(self.network_timeout, self.stream.read_i16()).await
    }

    /// Read exactly `len` raw bytes.
    pub async fn receive_bytes(&mut self, len: usize) -> Result<BytesMut, Error> {
        if len > MAX_MESSAGE_SIZE as usize {
            return Err(Error::ProtocolViolation(format!(
                "Message length is too large: {len}"
            )));
        }
        let mut buf = BytesMut::zeroed(len);
        with_read_timeout(self.network_timeout, self.stream.read_exact(&mut buf[..])).await?;
        Ok(buf)
    }

    /// Read `len` bytes and decode them with the current encoding.
    pub async fn receive_string(&mut self, len: usize) -> Result<String, Error> {
        let bytes = self.receive_bytes(len).await?;
        Ok(self.encoding.decode(&bytes))
    }

    /// Read the body of an ErrorResponse. A server that rejects us before
    /// client_encoding is known may answer in its own encoding, so invalid
    /// UTF-8 falls back to Latin-1 rather than losing the message.
    pub async fn receive_error_string(&mut self, len: usize) -> Result<String, Error> {
        let bytes = self.receive_bytes(len).await?;
        match (&self.encoding, std::str::from_utf8(&bytes)) {
            (Encoding::Utf8, Ok(text)) => Ok(text.to_string()),
            (Encoding::Utf8, Err(_)) => Ok(Encoding::Latin1.decode(&bytes)),
            (encoding, _) => Ok(encoding.decode(&bytes)),
        }
    }

    /// Read a null-terminated string, the terminator is consumed and dropped.
    pub async fn receive_cstring(&mut self) -> Result<String, Error> {
        let mut buf = Vec::new();
        let read =
            with_read_timeout(self.network_timeout, self.stream.read_until(0, &mut buf)).await?;
        if read == 0 || buf.last() != Some(&0) {
            return Err(Error::ConnectionFailure(
                "The server closed the connection unexpectedly".to_string(),
            ));
        }
        buf.pop();
        Ok(self.encoding.decode(&buf))
    }

    /// Discard `len` bytes.
    pub async fn skip(&mut self, len: usize) -> Result<(), Error> {
        self.receive_bytes(len).await.map(|_| ())
    }

    /// Wait for the peer to close the stream.
    pub async fn receive_eof(&mut self) -> Result<(), Error> {
        match self.network_timeout {
            Some(duration) => match timeout(duration, read_eof(&mut self.stream)).await {
                Ok(result) => result,
                Err(_) => Err(Error::ConnectionFailure(format!(
                    "Read timed out after {} ms",
                    duration.as_millis()
                ))),
            },
            None => read_eof(&mut self.stream).await,
        }
    }

    pub fn send_char(&mut self, code: u8) {
        self.write_buffer.put_u8(code);
    }

    pub fn send_integer4(&mut self, value: i32) {
        self.write_buffer.put_i32(value);
    }

    pub fn send_integer2(&mut self, value: i16) {
        self.write_buffer.put_i16(value);
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.write_buffer.put_slice(bytes);
    }

    /// Write everything queued by the send methods.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }
        let bytes = self.write_buffer.split();
        write_all_flush(&mut self.stream, &bytes).await
    }

    /// Shut the write half down. Errors are returned, callers on the close
    /// path log and drop them.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.write_buffer.clear();
        match self.stream.shutdown().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error closing socket: {err:?}"
            ))),
        }
    }
}
