//! Opening a connection: socket, SSL negotiation, StartupMessage and
//! authentication, up to the point where the protocol engine takes over.

// External crate imports
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite};

// Internal crate imports
use crate::config::{Config, Connection, ProtocolOptions};
use crate::constants::*;
use crate::errors::{Error, ServerError};
use crate::executor::QueryExecutorImpl;
use crate::messages::{
    cleartext_password, md5_hash_password, password_message, ssl_request, startup_message,
    ServerErrorMessage,
};
use crate::tls::{convert, SslFactory, SslMode, TlsOptions};
use crate::transport::{connect_stream, PgStream, StreamInner};

/// SQLSTATE the server uses when pg_hba.conf refuses the connection.
const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000";

/// Where a connection attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Socket,
    Ssl,
    Login,
}

#[derive(Debug)]
struct AttemptError {
    stage: Stage,
    error: Error,
}

impl AttemptError {
    fn at(stage: Stage) -> impl FnOnce(Error) -> AttemptError {
        move |error| AttemptError { stage, error }
    }

    /// The server refused this kind of connection, another kind may pass.
    fn is_rejected_login(&self) -> bool {
        self.stage == Stage::Login
            && self.error.sql_state() == Some(INVALID_AUTHORIZATION_SPECIFICATION)
    }
}

/// Open a connection as described by the configuration file.
pub async fn open(config: &Config) -> Result<QueryExecutorImpl<StreamInner>, Error> {
    open_with(&config.connection, &config.protocol, &config.tls.options()).await
}

/// Open a connection, negotiating SSL the way `tls.mode` asks for.
pub async fn open_with(
    connection: &Connection,
    protocol: &ProtocolOptions,
    tls: &TlsOptions,
) -> Result<QueryExecutorImpl<StreamInner>, Error> {
    if tls.mode == SslMode::Disable {
        return try_connect(connection, protocol, tls, Encryption::Off)
            .await
            .map_err(|err| err.error);
    }
    let factory = SslFactory::libpq(tls)?;

    let result = match tls.mode {
        SslMode::Allow => {
            match try_connect(connection, protocol, tls, Encryption::Off).await {
                Err(err) if err.is_rejected_login() => {
                    info!(
                        "Server {} refused a plaintext connection, retrying with SSL",
                        connection.host_spec()
                    );
                    try_connect(connection, protocol, tls, Encryption::Require(&factory)).await
                }
                result => result,
            }
        }
        SslMode::Prefer => {
            match try_connect(connection, protocol, tls, Encryption::Try(&factory)).await {
                Err(err) if err.stage == Stage::Ssl || err.is_rejected_login() => {
                    info!(
                        "SSL connection to {} failed ({}), retrying without SSL",
                        connection.host_spec(),
                        err.error
                    );
                    try_connect(connection, protocol, tls, Encryption::Off).await
                }
                result => result,
            }
        }
        _ => try_connect(connection, protocol, tls, Encryption::Require(&factory)).await,
    };

    result.map_err(|err| err.error)
}

/// What one attempt does about SSL.
#[derive(Debug, Clone, Copy)]
enum Encryption<'a> {
    Off,
    /// Ask for SSL, continue in plaintext if the server refuses.
    Try(&'a SslFactory),
    Require(&'a SslFactory),
}

async fn try_connect(
    connection: &Connection,
    protocol: &ProtocolOptions,
    tls: &TlsOptions,
    encryption: Encryption<'_>,
) -> Result<QueryExecutorImpl<StreamInner>, AttemptError> {
    let host = connection.host_spec();
    debug!("Trying to establish a protocol version 3 connection to {host}");

    let inner = connect_stream(&host, connection.connect_timeout())
        .await
        .map_err(AttemptError::at(Stage::Socket))?;
    let mut stream = PgStream::new(inner, host);
    // Login is bounded by the connect timeout, the session by the socket timeout.
    stream.set_network_timeout(connection.connect_timeout());

    stream = match encryption {
        Encryption::Off => Ok(stream),
        Encryption::Try(factory) => enable_ssl(stream, factory, tls, false).await,
        Encryption::Require(factory) => enable_ssl(stream, factory, tls, true).await,
    }
    .map_err(AttemptError::at(Stage::Ssl))?;

    let login: Result<(), Error> = async {
        send_startup(&mut stream, connection).await?;
        authenticate(&mut stream, connection, protocol.log_server_error_detail).await
    }
    .await;
    if let Err(err) = login {
        if let Err(close_err) = stream.close().await {
            debug!("Ignoring error closing rejected connection: {close_err}");
        }
        return Err(AttemptError::at(Stage::Login)(err));
    }

    stream.set_network_timeout(connection.socket_timeout());
    QueryExecutorImpl::new(
        stream,
        &connection.user,
        connection.database(),
        protocol.clone(),
    )
    .await
    .map_err(AttemptError::at(Stage::Login))
}

/// Ask for SSL and, when the server agrees, wrap the socket.
async fn enable_ssl(
    mut stream: PgStream<StreamInner>,
    factory: &SslFactory,
    tls: &TlsOptions,
    required: bool,
) -> Result<PgStream<StreamInner>, Error> {
    if stream.host_spec().is_unix_socket() {
        if required {
            return Err(Error::ConnectionFailure(format!(
                "SSL is not available over the Unix socket {}",
                stream.host_spec()
            )));
        }
        debug!("Skipping SSL negotiation on Unix socket {}", stream.host_spec());
        return Ok(stream);
    }

    match negotiate_ssl(&mut stream).await? {
        true => convert(stream, factory, tls).await,
        false if required => Err(Error::ConnectionFailure(
            "The server does not support SSL.".to_string(),
        )),
        false => {
            debug!("Server {} does not support SSL, continuing in plaintext", stream.host_spec());
            Ok(stream)
        }
    }
}

/// Send an SSLRequest and read the one-byte answer. `true` means the
/// server is ready for the TLS handshake.
pub async fn negotiate_ssl<S>(stream: &mut PgStream<S>) -> Result<bool, Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    trace!(" FE=> SSLRequest");
    stream.send(&ssl_request());
    stream.flush().await?;

    let response = stream.receive_char().await?;
    match response {
        b'S' => {
            trace!(" <=BE SSLOk");
            // Anything past the answer would be plaintext injected ahead of the handshake.
            if stream.has_buffered_input() {
                return Err(Error::ProtocolViolation(
                    "Received unencrypted data after SSL request".to_string(),
                ));
            }
            Ok(true)
        }
        b'N' => {
            trace!(" <=BE SSLRefused");
            Ok(false)
        }
        // Servers older than 7.0 answer with an ErrorResponse.
        b'E' => {
            trace!(" <=BE SSLError");
            Err(Error::ConnectionFailure(
                "The server does not support SSL.".to_string(),
            ))
        }
        other => Err(Error::ProtocolViolation(format!(
            "An error occurred while setting up the SSL connection, got: {}",
            other as char
        ))),
    }
}

/// Send the StartupMessage for `connection`.
pub async fn send_startup<S>(stream: &mut PgStream<S>, connection: &Connection) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let params = [
        ("user", connection.user.as_str()),
        ("database", connection.database()),
        ("application_name", connection.application_name.as_str()),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO"),
    ];

    for (name, value) in &params {
        trace!(" FE=> StartupPacket {name}={value}");
    }

    stream.send(&startup_message(&params)?);
    stream.flush().await
}

/// Answer authentication requests until AuthenticationOk.
pub async fn authenticate<S>(
    stream: &mut PgStream<S>,
    connection: &Connection,
    log_server_error_detail: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let code = stream.receive_char().await?;
        match code {
            // Authentication rejected, or anything else went wrong.
            b'E' => {
                let len = stream.receive_integer4().await?;
                if len <= 4 {
                    return Err(Error::ProtocolViolation(format!(
                        "Error response length must be greater than 4, got {len}"
                    )));
                }
                let body = stream.receive_error_string(len as usize - 4).await?;
                let message = ServerErrorMessage::parse(&body);
                trace!(" <=BE ErrorMessage({})", message.render(log_server_error_detail));
                return Err(Error::Server(ServerError::new(
                    message,
                    log_server_error_detail,
                )));
            }

            b'R' => {
                let len = stream.receive_integer4().await?;
                let auth_code = stream.receive_integer4().await?;

                match auth_code {
                    AUTHENTICATION_SUCCESSFUL => {
                        trace!(" <=BE AuthenticationOk");
                        return Ok(());
                    }

                    AUTHENTICATION_CLEAR_PASSWORD => {
                        trace!(" <=BE AuthenticationReqPassword");
                        let password = required_password(connection)?;
                        trace!(" FE=> Password(password=<not shown>)");
                        stream.send(&cleartext_password(password)?);
                        stream.flush().await?;
                    }

                    MD5_ENCRYPTED_PASSWORD => {
                        let salt = stream.receive_bytes(4).await?;
                        trace!(" <=BE AuthenticationReqMD5");
                        let password = required_password(connection)?;
                        let digest = md5_hash_password(&connection.user, password, &salt);
                        trace!(" FE=> Password(md5digest=<not shown>)");
                        stream.send(&password_message(&digest));
                        stream.flush().await?;
                    }

                    SASL => {
                        if len > 8 {
                            stream.skip(len as usize - 8).await?;
                        }
                        warn!("Server {} asked for SASL authentication", stream.host_spec());
                        return Err(Error::AuthError(
                            "SCRAM authentication is not supported by this client".to_string(),
                        ));
                    }

                    other => {
                        return Err(Error::AuthError(format!(
                            "The authentication type {other} is not supported. Check that you have \
                             configured the pg_hba.conf file to include the client's IP address \
                             or subnet, and that it is using an authentication scheme supported \
                             by the driver."
                        )));
                    }
                }
            }

            other => {
                return Err(Error::ProtocolViolation(format!(
                    "Protocol error. Expected authentication request, got: {}",
                    other as char
                )));
            }
        }
    }
}

fn required_password(connection: &Connection) -> Result<&str, Error> {
    match connection.password.as_deref() {
        Some(password) => Ok(password),
        None => Err(Error::AuthError(
            "The server requested password-based authentication, but no password was provided."
                .to_string(),
        )),
    }
}
