// Protocol engine: the conversation with one backend over one connection.

// Standard library imports
use std::time::Duration;

// External crate imports
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

// Internal crate imports
use crate::cancel::CancelToken;
use crate::config::AutoSave;
use crate::encoding::Encoding;
use crate::errors::Error;
use crate::messages::ServerErrorMessage;
use crate::query::{CachedQuery, QueryKey, Returning};
use crate::transport::HostSpec;

// Declare submodules
pub mod base;
pub mod v3;

// Re-export public items
pub use base::{
    parse_server_version, BackendKey, ExecutorBase, Notification, ParameterName,
    ParameterStatuses, SharedState, TransactionState,
};
pub use v3::{FieldDescription, QueryExecutorImpl, ResultHandler, RowCollector};

// Tests
#[cfg(test)]
mod tests;

/// What callers can do with a connection, whatever wire protocol version it speaks.
/// Version-specific execution lives in the implementor, everything else is
/// served by the shared [`ExecutorBase`].
#[allow(async_fn_in_trait)]
pub trait QueryExecutor {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    fn base(&self) -> &ExecutorBase<Self::Stream>;
    fn base_mut(&mut self) -> &mut ExecutorBase<Self::Stream>;

    fn protocol_version(&self) -> i32;

    /// Run `sql` through the simple query protocol.
    async fn execute_simple(
        &mut self,
        sql: &str,
        handler: &mut dyn ResultHandler,
    ) -> Result<(), Error>;

    /// Run a borrowed statement through Parse/Bind/Describe/Execute/Sync.
    async fn execute_prepared(
        &mut self,
        query: &mut CachedQuery,
        params: &[Option<Bytes>],
        handler: &mut dyn ResultHandler,
    ) -> Result<(), Error>;

    /// Pick up notifications and notices that arrived while idle.
    async fn process_notifies(&mut self, timeout: Option<Duration>) -> Result<(), Error>;

    fn user(&self) -> &str {
        self.base().user()
    }

    fn database(&self) -> &str {
        self.base().database()
    }

    fn host_spec(&self) -> &HostSpec {
        self.base().host_spec()
    }

    fn backend_pid(&self) -> i32 {
        self.base().backend_pid()
    }

    fn server_version(&self) -> &str {
        self.base().server_version()
    }

    fn server_version_num(&self) -> i32 {
        self.base().server_version_num()
    }

    fn transaction_state(&self) -> TransactionState {
        self.base().transaction_state()
    }

    fn standard_conforming_strings(&self) -> bool {
        self.base().standard_conforming_strings()
    }

    fn encoding(&self) -> &Encoding {
        self.base().encoding()
    }

    fn parameter_statuses(&self) -> ParameterStatuses {
        self.base().parameter_statuses()
    }

    fn parameter_status(&self, name: &str) -> Option<&str> {
        self.base().parameter_status(name)
    }

    fn take_warnings(&self) -> Vec<ServerErrorMessage> {
        self.base().take_warnings()
    }

    fn take_notifications(&self) -> Vec<Notification> {
        self.base().take_notifications()
    }

    fn create_query_key(
        &self,
        sql: &str,
        escape_processing: bool,
        is_parameterized: bool,
        returning: Returning,
    ) -> QueryKey {
        self.base()
            .create_query_key(sql, escape_processing, is_parameterized, returning)
    }

    fn borrow_query(&mut self, sql: &str) -> Result<CachedQuery, Error> {
        self.base_mut().borrow_query(sql)
    }

    fn borrow_query_by_key(&mut self, key: QueryKey) -> Result<CachedQuery, Error> {
        self.base_mut().borrow_query_by_key(key)
    }

    fn release_query(&mut self, query: CachedQuery) {
        self.base_mut().release_query(query)
    }

    fn create_query_by_key(&self, key: &QueryKey) -> Result<CachedQuery, Error> {
        self.base().create_query_by_key(key)
    }

    fn will_heal_on_retry(&self, err: &Error) -> bool {
        self.base().will_heal_on_retry(err)
    }

    fn set_autosave(&mut self, autosave: AutoSave) {
        self.base_mut().set_autosave(autosave)
    }

    fn network_timeout(&self) -> Option<Duration> {
        self.base().network_timeout()
    }

    fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.base_mut().set_network_timeout(timeout)
    }

    fn cancel_token(&self) -> CancelToken {
        self.base().cancel_token()
    }

    async fn send_query_cancel(&self) {
        self.base().cancel_token().send_cancel().await
    }

    fn is_closed(&self) -> bool {
        self.base().is_closed()
    }

    async fn close(&mut self) {
        self.base_mut().close().await
    }

    async fn abort(&mut self) {
        self.base_mut().abort().await
    }
}
