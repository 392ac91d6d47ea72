use log::info;
use serde_derive::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::constants::DEFAULT_PORT;
use crate::errors::Error;
use crate::tls::{SslMode, TlsOptions};
use crate::transport::HostSpec;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Whether a failed statement inside a transaction is rolled back to a savepoint
/// so the transaction can go on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AutoSave {
    #[default]
    #[serde(alias = "never")]
    Never,
    #[serde(alias = "always")]
    Always,
    #[serde(alias = "conservative")]
    Conservative,
}

impl Display for AutoSave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match *self {
            AutoSave::Never => "never",
            AutoSave::Always => "always",
            AutoSave::Conservative => "conservative",
        };
        write!(f, "{str}")
    }
}

impl FromStr for AutoSave {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "never" => Ok(AutoSave::Never),
            "always" => Ok(AutoSave::Always),
            "conservative" => Ok(AutoSave::Conservative),
            _ => Err(Error::BadConfig(format!("Invalid autosave value: {s}"))),
        }
    }
}

/// How `{call ...}` escapes are turned into SQL.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EscapeSyntaxCallMode {
    #[default]
    #[serde(alias = "select")]
    Select,
    #[serde(alias = "callIfNoReturn", alias = "call_if_no_return")]
    CallIfNoReturn,
    #[serde(alias = "call")]
    Call,
}

impl Display for EscapeSyntaxCallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match *self {
            EscapeSyntaxCallMode::Select => "select",
            EscapeSyntaxCallMode::CallIfNoReturn => "callIfNoReturn",
            EscapeSyntaxCallMode::Call => "call",
        };
        write!(f, "{str}")
    }
}

impl FromStr for EscapeSyntaxCallMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "select" => Ok(EscapeSyntaxCallMode::Select),
            "callIfNoReturn" | "call_if_no_return" => Ok(EscapeSyntaxCallMode::CallIfNoReturn),
            "call" => Ok(EscapeSyntaxCallMode::Call),
            _ => Err(Error::BadConfig(format!(
                "Invalid escapeSyntaxCallMode value: {s}"
            ))),
        }
    }
}

/// Which wire protocol flavour statements go through.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PreferQueryMode {
    #[serde(alias = "simple")]
    Simple,
    #[default]
    #[serde(alias = "extended")]
    Extended,
    #[serde(
        alias = "extendedForPrepared",
        alias = "extended_for_prepared"
    )]
    ExtendedForPrepared,
    #[serde(
        alias = "extendedCacheEverything",
        alias = "extended_cache_everything"
    )]
    ExtendedCacheEverything,
}

impl Display for PreferQueryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match *self {
            PreferQueryMode::Simple => "simple",
            PreferQueryMode::Extended => "extended",
            PreferQueryMode::ExtendedForPrepared => "extendedForPrepared",
            PreferQueryMode::ExtendedCacheEverything => "extendedCacheEverything",
        };
        write!(f, "{str}")
    }
}

impl FromStr for PreferQueryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(PreferQueryMode::Simple),
            "extended" => Ok(PreferQueryMode::Extended),
            "extendedForPrepared" | "extended_for_prepared" => {
                Ok(PreferQueryMode::ExtendedForPrepared)
            }
            "extendedCacheEverything" | "extended_cache_everything" => {
                Ok(PreferQueryMode::ExtendedCacheEverything)
            }
            _ => Err(Error::BadConfig(format!("Invalid preferQueryMode value: {s}"))),
        }
    }
}

/// Where and as whom to connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    #[serde(default = "Connection::default_host")]
    pub host: String,

    #[serde(default = "Connection::default_port")]
    pub port: u16,

    #[serde(default = "Connection::default_user")]
    pub user: String,

    /// Defaults to the user name.
    pub database: Option<String>,

    pub password: Option<String>,

    #[serde(default = "Connection::default_application_name")]
    pub application_name: String,

    #[serde(default = "Connection::default_connect_timeout")] // 10_000
    pub connect_timeout: u64,

    /// Read timeout in milliseconds, 0 waits forever.
    #[serde(default)]
    pub socket_timeout: u64,
}

impl Connection {
    pub fn default_host() -> String {
        "localhost".into()
    }

    pub fn default_port() -> u16 {
        DEFAULT_PORT
    }

    pub fn default_user() -> String {
        "postgres".into()
    }

    pub fn default_application_name() -> String {
        "pg_frontend".into()
    }

    pub fn default_connect_timeout() -> u64 {
        10_000
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.user)
    }

    pub fn host_spec(&self) -> HostSpec {
        HostSpec::new(&self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        millis(self.connect_timeout)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        millis(self.socket_timeout)
    }
}

impl Default for Connection {
    fn default() -> Connection {
        Connection {
            host: Self::default_host(),
            port: Self::default_port(),
            user: Self::default_user(),
            database: None,
            password: None,
            application_name: Self::default_application_name(),
            connect_timeout: Self::default_connect_timeout(),
            socket_timeout: 0,
        }
    }
}

/// Protocol engine settings, handed to the executor by value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolOptions {
    #[serde(default)] // false
    pub allow_encoding_changes: bool,

    #[serde(default)] // false
    pub rewrite_batched_inserts: bool,

    #[serde(default)] // false
    pub disable_column_sanitiser: bool,

    #[serde(default)]
    pub escape_syntax_call_mode: EscapeSyntaxCallMode,

    #[serde(default)]
    pub prefer_query_mode: PreferQueryMode,

    #[serde(default)]
    pub autosave: AutoSave,

    #[serde(default = "ProtocolOptions::default_log_server_error_detail")] // true
    pub log_server_error_detail: bool,

    #[serde(default = "ProtocolOptions::default_prepared_statement_cache_queries")] // 256
    pub prepared_statement_cache_queries: usize,

    #[serde(default = "ProtocolOptions::default_prepared_statement_cache_size_mib")] // 5
    pub prepared_statement_cache_size_mib: usize,

    /// Executions of a statement before it gets a named server-side statement.
    /// 0 never names statements.
    #[serde(default = "ProtocolOptions::default_prepare_threshold")] // 5
    pub prepare_threshold: usize,

    #[serde(default = "ProtocolOptions::default_cancel_signal_timeout")] // 10_000
    pub cancel_signal_timeout: u64,
}

impl ProtocolOptions {
    pub fn default_log_server_error_detail() -> bool {
        true
    }

    pub fn default_prepared_statement_cache_queries() -> usize {
        256
    }

    pub fn default_prepared_statement_cache_size_mib() -> usize {
        5
    }

    pub fn default_prepare_threshold() -> usize {
        5
    }

    pub fn default_cancel_signal_timeout() -> u64 {
        10_000
    }

    pub fn cache_max_bytes(&self) -> usize {
        self.prepared_statement_cache_size_mib
            .saturating_mul(1024 * 1024)
    }

    pub fn cancel_signal_timeout(&self) -> Option<Duration> {
        millis(self.cancel_signal_timeout)
    }
}

impl Default for ProtocolOptions {
    fn default() -> ProtocolOptions {
        ProtocolOptions {
            allow_encoding_changes: false,
            rewrite_batched_inserts: false,
            disable_column_sanitiser: false,
            escape_syntax_call_mode: EscapeSyntaxCallMode::default(),
            prefer_query_mode: PreferQueryMode::default(),
            autosave: AutoSave::default(),
            log_server_error_detail: Self::default_log_server_error_detail(),
            prepared_statement_cache_queries: Self::default_prepared_statement_cache_queries(),
            prepared_statement_cache_size_mib: Self::default_prepared_statement_cache_size_mib(),
            prepare_threshold: Self::default_prepare_threshold(),
            cancel_signal_timeout: Self::default_cancel_signal_timeout(),
        }
    }
}

/// TLS settings as they appear in the file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Tls {
    #[serde(default)]
    pub ssl_mode: SslMode,
    pub ssl_root_cert: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
}

impl Tls {
    pub fn options(&self) -> TlsOptions {
        TlsOptions {
            mode: self.ssl_mode,
            root_cert: self.ssl_root_cert.as_ref().map(PathBuf::from),
            cert: self.ssl_cert.as_ref().map(PathBuf::from),
            key: self.ssl_key.as_ref().map(PathBuf::from),
            hostname_verifier: None,
        }
    }
}

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    // Serializer maintains the order of fields in the struct
    // so we should always put simple fields before nested fields
    // in all serializable structs to avoid ValueAfterTable errors
    // These errors occur when the toml serializer is about to produce
    // ambiguous toml structure like the one below
    // [main]
    // field1_under_main = 1
    // field2_under_main = 2
    // [main.subconf]
    // field1_under_subconf = 1
    // field3_under_main = 3 # This field will be interpreted as being under subconf and not under main
    #[serde(skip)]
    pub path: String,

    #[serde(default)]
    pub connection: Connection,

    #[serde(default)]
    pub protocol: ProtocolOptions,

    #[serde(default)]
    pub tls: Tls,
}

impl Config {
    /// Print current configuration.
    pub fn show(&self) {
        info!("Server: {}", self.connection.host_spec());
        info!(
            "User: {}, database: {}",
            self.connection.user,
            self.connection.database()
        );
        info!("Application name: {}", self.connection.application_name);
        info!("Connection timeout: {}ms", self.connection.connect_timeout);
        info!("Socket timeout: {}ms", self.connection.socket_timeout);
        info!("SSL mode: {}", self.tls.ssl_mode);
        info!("Prefer query mode: {}", self.protocol.prefer_query_mode);
        info!("Autosave: {}", self.protocol.autosave);
        info!(
            "Prepared statement cache: {} queries, {} MiB",
            self.protocol.prepared_statement_cache_queries,
            self.protocol.prepared_statement_cache_size_mib
        );
        info!(
            "Cancel signal timeout: {}ms",
            self.protocol.cancel_signal_timeout
        );
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.connection.port == 0 {
            return Err(Error::BadConfig("port must not be 0".to_string()));
        }
        if self.connection.user.is_empty() {
            return Err(Error::BadConfig("user must not be empty".to_string()));
        }
        if self.tls.ssl_cert.is_some() != self.tls.ssl_key.is_some() {
            return Err(Error::BadConfig(
                "both the ssl_cert and ssl_key must be specified at the same time".to_string(),
            ));
        }
        if self.tls.ssl_mode == SslMode::Disable
            && (self.tls.ssl_root_cert.is_some() || self.tls.ssl_cert.is_some())
        {
            return Err(Error::BadConfig(
                "ssl_mode 'disable' cannot be combined with ssl certificates".to_string(),
            ));
        }
        Ok(())
    }
}

fn millis(value: u64) -> Option<Duration> {
    match value {
        0 => None,
        value => Some(Duration::from_millis(value)),
    }
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not open '{path}': {err}"
            )));
        }
    };
    match file.read_to_string(&mut contents).await {
        Ok(_) => (),
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not read config file: {err}"
            )));
        }
    };
    Ok(contents)
}

/// Parse the configuration file located at the path.
pub async fn parse(path: &str) -> Result<Config, Error> {
    let contents = load_file(path).await?;
    let mut config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not parse config file {path}: {err}"
            )));
        }
    };

    config.validate()?;
    config.path = path.to_string();

    Ok(config)
}
