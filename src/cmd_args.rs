use clap::{Parser, ValueEnum};
use tracing::Level;

/// pg_frontend: connect to PostgreSQL over the v3 wire protocol and report
/// what the server announced during startup.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(default_value_t = String::from("pg_frontend.toml"), env)]
    pub config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env)]
    pub log_level: Level,

    #[clap(short='F', long, value_enum, default_value_t=LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(
        short,
        long,
        default_value_t = false,
        env,
        help = "disable colors in the log output"
    )]
    pub no_color: bool,

    /// Statement to run through the simple query protocol once connected.
    #[arg(short, long, env)]
    pub query: Option<String>,

    /// Seconds to wait for LISTEN notifications after the query.
    #[arg(short = 'w', long, default_value_t = 0, env)]
    pub listen_wait: u64,
}

pub fn parse() -> Args {
    Args::parse()
}

#[derive(ValueEnum, Clone, Debug)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}
