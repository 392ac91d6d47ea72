// Standard library imports
use std::time::Duration;

// External crate imports
use log::error;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Keepalive idle time before the first probe.
const TCP_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
const TCP_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE_RETRIES: u32 = 5;

/// Configure TCP socket parameters. Failures are logged, the socket stays usable.
pub fn configure_tcp_socket(stream: &TcpStream) {
    let sock_ref = SockRef::from(stream);

    match sock_ref.set_nodelay(true) {
        Ok(_) => {}
        Err(err) => error!("Could not configure no delay for socket: {err}"),
    }

    match sock_ref.set_keepalive(true) {
        Ok(_) => {
            match sock_ref.set_tcp_keepalive(
                &TcpKeepalive::new()
                    .with_interval(TCP_KEEPALIVE_INTERVAL)
                    .with_retries(TCP_KEEPALIVE_RETRIES)
                    .with_time(TCP_KEEPALIVE_IDLE),
            ) {
                Ok(_) => (),
                Err(err) => error!("Could not configure tcp_keepalive for socket: {err}"),
            }
        }
        Err(err) => error!("Could not configure socket: {err}"),
    }
}
