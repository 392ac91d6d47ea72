//! Out-of-band query cancellation over a second, short-lived connection.

// Standard library imports
use std::sync::Arc;
use std::time::Duration;

// External crate imports
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};

// Internal crate imports
use crate::errors::Error;
use crate::executor::SharedState;
use crate::messages::cancel_request;
use crate::transport::{connect_stream, HostSpec, PgStream};

/// Everything needed to cancel the running query of one connection.
/// Cheap to clone and usable while the connection is busy.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: HostSpec,
    timeout: Option<Duration>,
    shared: Arc<SharedState>,
}

impl CancelToken {
    pub fn new(host: HostSpec, timeout: Option<Duration>, shared: Arc<SharedState>) -> CancelToken {
        CancelToken {
            host,
            timeout,
            shared,
        }
    }

    pub fn host_spec(&self) -> &HostSpec {
        &self.host
    }

    /// Ask the server to cancel whatever the connection is running. Best
    /// effort: failures are logged and never returned.
    pub async fn send_cancel(&self) {
        let key = match self.shared.backend_key() {
            Some(key) if key.process_id > 0 => key,
            // Startup has not finished, nothing to cancel.
            _ => return,
        };

        trace!(
            " FE=> CancelRequest(pid={},ckey={})",
            key.process_id,
            key.secret_key
        );

        let stream = match connect_stream(&self.host, self.timeout).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("Ignoring exception on cancel request: {err}");
                return;
            }
        };
        let mut stream = PgStream::new(stream, self.host.clone());
        stream.set_network_timeout(self.timeout);

        if let Err(err) = write_cancel(&mut stream, key.process_id, key.secret_key).await {
            debug!("Ignoring exception on cancel request: {err}");
        }
        if let Err(err) = stream.close().await {
            debug!("Ignoring exception closing cancel connection: {err}");
        }
    }
}

/// Send the 16-byte CancelRequest and wait for the server to hang up.
pub async fn write_cancel<S>(
    stream: &mut PgStream<S>,
    process_id: i32,
    secret_key: i32,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream.send(&cancel_request(process_id, secret_key));
    stream.flush().await?;
    stream.receive_eof().await
}
