use crate::cmd_args::{Args, LogFormat};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Records from the `log` facade used by the
/// library are forwarded to it.
pub fn init(args: &Args) {
    // RUST_LOG directives first, then the command line level on top (default: "info").
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!args.no_color);

    match args.log_format {
        LogFormat::Structured => subscriber.json().init(),
        LogFormat::Debug => subscriber.pretty().init(),
        LogFormat::Text => subscriber.init(),
    };
}
