// Upgrade of an established plaintext connection to TLS.
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use native_tls::{Certificate, Identity, Protocol};
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;
use crate::transport::{PgStream, StreamInner};

/// Helper function to read a file into a byte vector
fn read_file(path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut file = std::fs::File::open(path)?;
    file.read_to_end(&mut content)?;
    Ok(content)
}

/// Load the client identity from certificate and key files
pub fn load_identity(cert: &Path, key: &Path) -> io::Result<Identity> {
    let cert_body = read_file(cert)?;
    let key_body = read_file(key)?;

    Identity::from_pkcs8(&cert_body, &key_body).map_err(|err| io::Error::other(err.to_string()))
}

/// Load a certificate from a PEM file
fn load_certificate(path: &Path) -> Result<Certificate, Error> {
    let cert_data = read_file(path).map_err(|err| {
        Error::BadConfig(format!(
            "Failed to read certificate file {}: {}",
            path.display(),
            err
        ))
    })?;

    Certificate::from_pem(&cert_data).map_err(|err| {
        Error::BadConfig(format!(
            "Failed to parse certificate {}: {}",
            path.display(),
            err
        ))
    })
}

/// How hard the client insists on encryption and server identity.
#[derive(Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Default)]
pub enum SslMode {
    #[serde(alias = "disable")]
    Disable,
    #[serde(alias = "allow")]
    Allow,
    #[default]
    #[serde(alias = "prefer")]
    Prefer,
    #[serde(alias = "require")]
    Require,
    #[serde(alias = "verify-ca", alias = "verify_ca")]
    VerifyCa,
    #[serde(alias = "verify-full", alias = "verify_full")]
    VerifyFull,
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslMode::Disable => write!(f, "disable"),
            SslMode::Allow => write!(f, "allow"),
            SslMode::Prefer => write!(f, "prefer"),
            SslMode::Require => write!(f, "require"),
            SslMode::VerifyCa => write!(f, "verify-ca"),
            SslMode::VerifyFull => write!(f, "verify-full"),
        }
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            _ => Err(Error::BadConfig(format!("Invalid sslmode value: {s}"))),
        }
    }
}

impl SslMode {
    /// Connection must fail rather than continue unencrypted.
    pub fn requires_encryption(&self) -> bool {
        *self >= SslMode::Require
    }

    pub fn verify_certificate(&self) -> bool {
        *self >= SslMode::VerifyCa
    }

    pub fn verify_hostname(&self) -> bool {
        *self == SslMode::VerifyFull
    }
}

/// Caller-supplied check of the server identity, run after the handshake.
pub trait HostnameVerifier: Send + Sync {
    /// Shown in error messages.
    fn name(&self) -> &str;
    fn verify(&self, host: &str, peer_certificate: Option<&Certificate>) -> bool;
}

/// Everything the upgrader needs, resolved once from the configuration.
#[derive(Clone, Default)]
pub struct TlsOptions {
    pub mode: SslMode,
    pub root_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsOptions")
            .field("mode", &self.mode)
            .field("root_cert", &self.root_cert)
            .field("cert", &self.cert)
            .field("key", &self.key)
            .field(
                "hostname_verifier",
                &self.hostname_verifier.as_ref().map(|v| v.name().to_string()),
            )
            .finish()
    }
}

/// Source of TLS connectors.
pub enum SslFactory {
    /// Built from the ssl_* options, verification follows the ssl mode.
    LibPq {
        connector: tokio_native_tls::TlsConnector,
        /// Client key material that failed to load. Reported if the
        /// handshake fails, since it is the likely reason.
        key_error: Option<String>,
    },
    /// Supplied by the application as is. It carries no hostname check
    /// the upgrader can rely on.
    Custom(tokio_native_tls::TlsConnector),
}

impl fmt::Debug for SslFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslFactory::LibPq { key_error, .. } => f
                .debug_struct("LibPq")
                .field("key_error", key_error)
                .finish(),
            SslFactory::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl SslFactory {
    /// Build a connector whose certificate and hostname checks match `options.mode`.
    pub fn libpq(options: &TlsOptions) -> Result<SslFactory, Error> {
        let mut builder = native_tls::TlsConnector::builder();
        builder.min_protocol_version(Some(Protocol::Tlsv12));

        if options.mode.verify_certificate() {
            if let Some(root_cert) = &options.root_cert {
                builder.add_root_certificate(load_certificate(root_cert)?);
            }
        } else {
            builder.danger_accept_invalid_certs(true);
        }

        // A caller-supplied verifier replaces the built-in hostname match.
        if !options.mode.verify_hostname() || options.hostname_verifier.is_some() {
            builder.danger_accept_invalid_hostnames(true);
        }

        let key_error = match (&options.cert, &options.key) {
            (Some(cert), Some(key)) => match load_identity(cert, key) {
                Ok(identity) => {
                    builder.identity(identity);
                    None
                }
                Err(err) => Some(format!(
                    "Could not read SSL key material from {} and {}: {err}",
                    cert.display(),
                    key.display()
                )),
            },
            _ => None,
        };

        let connector = builder
            .build()
            .map_err(|err| Error::TlsError(format!("Failed to create TLS connector: {err}")))?;

        Ok(SslFactory::LibPq {
            connector: tokio_native_tls::TlsConnector::from(connector),
            key_error,
        })
    }

    pub fn custom(connector: native_tls::TlsConnector) -> SslFactory {
        SslFactory::Custom(tokio_native_tls::TlsConnector::from(connector))
    }

    fn connector(&self) -> &tokio_native_tls::TlsConnector {
        match self {
            SslFactory::LibPq { connector, .. } => connector,
            SslFactory::Custom(connector) => connector,
        }
    }

    /// True when the connector itself matches the hostname during the handshake.
    pub fn verifies_hostname(&self) -> bool {
        matches!(self, SslFactory::LibPq { .. })
    }

    fn key_error(&self) -> Option<&str> {
        match self {
            SslFactory::LibPq { key_error, .. } => key_error.as_deref(),
            SslFactory::Custom(_) => None,
        }
    }
}

/// Who confirms the server hostname after the handshake.
#[derive(Debug, PartialEq, Eq)]
pub enum HostnameCheck {
    /// The mode does not ask for it.
    Skip,
    /// The caller's verifier decides.
    Custom,
    /// Already done by the connector during the handshake.
    BuiltIn,
    /// verify-full with nothing able to check: refuse the connection.
    Unavailable,
}

pub fn hostname_check(mode: SslMode, factory: &SslFactory, has_custom: bool) -> HostnameCheck {
    if mode == SslMode::Disable {
        return HostnameCheck::Skip;
    }
    if has_custom {
        return HostnameCheck::Custom;
    }
    if !mode.verify_hostname() {
        return HostnameCheck::Skip;
    }
    if factory.verifies_hostname() {
        HostnameCheck::BuiltIn
    } else {
        HostnameCheck::Unavailable
    }
}

/// Replace the plaintext socket of `stream` by a TLS session over it.
/// The handshake completes before this returns.
pub async fn convert(
    stream: PgStream<StreamInner>,
    factory: &SslFactory,
    options: &TlsOptions,
) -> Result<PgStream<StreamInner>, Error> {
    debug!("Converting regular socket connection to SSL");

    let (inner, host, network_timeout) = stream.into_inner()?;
    let tcp = match inner {
        StreamInner::TCPPlain { stream } => stream,
        _ => {
            return Err(Error::TlsError(format!(
                "SSL can only be negotiated over a plain TCP connection to {host}"
            )))
        }
    };

    let tls = match factory.connector().connect(&host.host, tcp).await {
        Ok(tls) => tls,
        Err(err) => {
            if let Some(key_error) = factory.key_error() {
                return Err(Error::ConnectionFailure(key_error.to_string()));
            }
            return Err(Error::ConnectionFailure(format!("SSL error: {err}")));
        }
    };

    match hostname_check(options.mode, factory, options.hostname_verifier.is_some()) {
        HostnameCheck::Skip | HostnameCheck::BuiltIn => (),
        HostnameCheck::Custom => {
            if let Some(verifier) = &options.hostname_verifier {
                let peer = tls.get_ref().peer_certificate().ok().flatten();
                if !verifier.verify(&host.host, peer.as_ref()) {
                    return Err(Error::ConnectionFailure(format!(
                        "The hostname {} could not be verified by hostnameverifier {}.",
                        host.host,
                        verifier.name()
                    )));
                }
            }
        }
        HostnameCheck::Unavailable => {
            return Err(Error::ConnectionFailure(format!(
                "The hostname {} could not be verified, no verifier available",
                host.host
            )));
        }
    }

    info!("SSL connection to {host} established ({})", options.mode);

    let mut upgraded = PgStream::new(StreamInner::TCPTls { stream: tls }, host);
    upgraded.set_network_timeout(network_timeout);
    Ok(upgraded)
}
