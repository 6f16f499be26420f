//! Broker client seams
//!
//! The wire client (connect, fetch, commit, write) lives outside this crate.
//! A [`Writer`](crate::Writer) owns exactly one [`BrokerWriter`] and a
//! [`Reader`](crate::Reader) owns exactly one [`BrokerReader`]; handles are
//! never shared between components.

use crate::error;
use crate::message::Message;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a broker client implementation
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The in-flight call observed cancellation
    #[error("Cancelled")]
    Cancelled,

    #[error("Client closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Client statistics exposed to health checks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Messages written or fetched
    pub messages: u64,
    /// Payload bytes written or fetched
    pub bytes: u64,
    /// Write, fetch or commit calls issued
    pub requests: u64,
    /// Calls that failed
    pub errors: u64,
}

/// Producer side of the broker client
#[async_trait]
pub trait BrokerWriter: Send + Sync + 'static {
    /// Write a batch in one call. Order of `messages` must be preserved.
    async fn write_messages(&self, messages: &[Message]) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn stats(&self) -> BrokerStats;
}

/// Consumer side of the broker client
#[async_trait]
pub trait BrokerReader: Send + Sync + 'static {
    /// Wait for the next message.
    ///
    /// Must be cancel-safe: the poller drops this future when shutting down.
    async fn fetch_message(&self) -> Result<Message, BrokerError>;

    /// Acknowledge a batch of fetched messages in one call.
    async fn commit_messages(&self, messages: &[Message]) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn stats(&self) -> BrokerStats;
}

/// Run one broker call, bounded by `timeout` when set, and wrap its error
/// with the operation name.
pub(crate) async fn call<T, F>(
    timeout: Option<Duration>,
    operation: &'static str,
    fut: F,
) -> error::Result<T>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| error::Error::Timeout(operation))?,
        None => fut.await,
    };
    result.map_err(|e| error::Error::broker(operation, e))
}
