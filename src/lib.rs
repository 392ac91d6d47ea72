pub mod cache;
pub mod cancel;
pub mod cmd_args;
pub mod config;
pub mod connect;
pub mod constants;
pub mod encoding;
pub mod errors;
pub mod executor;
pub mod logger;
pub mod messages;
pub mod query;
pub mod tls;
pub mod transport;

/// Format chrono::Duration to be more human-friendly.
///
/// # Arguments
///
/// * `duration` - A duration of time
pub fn format_duration(duration: &chrono::Duration) -> String {
    let milliseconds = format!("{:0>3}", duration.num_milliseconds() % 1000);

    let seconds = format!("{:0>2}", duration.num_seconds() % 60);

    let minutes = format!("{:0>2}", duration.num_minutes() % 60);

    let hours = format!("{:0>2}", duration.num_hours() % 24);

    let days = duration.num_days().to_string();

    format!("{days}d {hours}:{minutes}:{seconds}.{milliseconds}")
}
