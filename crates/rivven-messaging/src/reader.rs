//! Commit buffer over a broker reader
//!
//! The [`Reader`] stages acknowledgements for fetched messages and commits
//! them in one broker call. It does not fetch on its own; the
//! [`Poller`](crate::Poller) drives it.

use crate::batch::{BatchRole, BufferedBatch};
use crate::broker::{self, BrokerReader, BrokerStats};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::message::Message;
use crate::tracer::{SpanKind, Tracer};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Consumer-side commit buffer
pub struct Reader {
    broker: Box<dyn BrokerReader>,
    batch: BufferedBatch,
    tracer: Arc<dyn Tracer>,
    operation_timeout: Option<Duration>,
    name: String,
    stats: ReaderCounters,
    closed: AtomicBool,
}

impl Reader {
    pub fn new(broker: impl BrokerReader, config: &PollerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            broker: Box::new(broker),
            batch: BufferedBatch::new(BatchRole::Reader, config.batch_capacity),
            tracer: Arc::clone(&config.tracer),
            operation_timeout: config.operation_timeout(),
            name: format!("reader:{}", config.resource()),
            stats: ReaderCounters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Stage the acknowledgement for a fetched message.
    ///
    /// Returns [`Error::ReaderBufferFull`] when the batch is at capacity;
    /// commit and retry.
    pub async fn store_message(&self, message: &Message) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("reader"));
        }
        self.batch.append(message.commit_marker()).await?;
        self.stats.messages_stored.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Commit every staged acknowledgement in one broker call.
    ///
    /// No-op when nothing is staged. On failure the batch is left intact.
    pub async fn commit(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("reader"));
        }
        self.commit_staged().await
    }

    async fn commit_staged(&self) -> Result<()> {
        let drain = self.batch.drain().await;
        if drain.is_empty() {
            return Ok(());
        }
        let count = drain.len();

        let mut span = self
            .tracer
            .start_span(None, "reader.commit", SpanKind::Consumer, &self.name);
        span.set_attribute("messaging.batch_size", count.into());

        let result = broker::call(
            self.operation_timeout,
            "commit messages",
            self.broker.commit_messages(drain.messages()),
        )
        .await;

        match result {
            Ok(()) => {
                drain.commit();
                self.stats.commits.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .messages_committed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(reader = %self.name, count, "Committed batch");
                span.finish();
                Ok(())
            }
            Err(e) => {
                self.stats.commit_errors.fetch_add(1, Ordering::Relaxed);
                span.record_error(&e);
                span.finish();
                Err(e)
            }
        }
    }

    /// Fetch the next message from the broker reader. Cancel-safe.
    pub(crate) async fn fetch_message(&self) -> Result<Message> {
        self.broker
            .fetch_message()
            .await
            .map_err(|e| Error::broker("fetch message", e))
    }

    /// Close the broker reader. Staged acknowledgements are not committed
    /// here; the poller commits them before closing.
    ///
    /// Returns [`Error::Closed`] if the reader was already closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("reader"));
        }
        self.batch.seal().await;
        let result = broker::call(self.operation_timeout, "close reader", self.broker.close()).await;
        info!(reader = %self.name, staged = self.batch.len(), "Reader closed");
        result
    }

    /// Number of staged acknowledgements
    pub fn staged(&self) -> usize {
        self.batch.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReaderStats {
        ReaderStats {
            messages_stored: self.stats.messages_stored.load(Ordering::Relaxed),
            messages_committed: self.stats.messages_committed.load(Ordering::Relaxed),
            commits: self.stats.commits.load(Ordering::Relaxed),
            commit_errors: self.stats.commit_errors.load(Ordering::Relaxed),
            staged: self.batch.len(),
            capacity: self.batch.capacity(),
        }
    }

    pub(crate) fn broker_stats(&self) -> BrokerStats {
        self.broker.stats()
    }
}

#[async_trait]
impl HealthCheck for Reader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status_check(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "reader": self.stats(),
            "broker": self.broker_stats(),
            "closed": self.is_closed(),
        }))
    }
}

#[derive(Default)]
struct ReaderCounters {
    messages_stored: AtomicU64,
    messages_committed: AtomicU64,
    commits: AtomicU64,
    commit_errors: AtomicU64,
}

/// Reader statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReaderStats {
    pub messages_stored: u64,
    pub messages_committed: u64,
    pub commits: u64,
    pub commit_errors: u64,
    pub staged: usize,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;

    fn config(capacity: usize) -> PollerConfig {
        PollerConfig::builder()
            .topic("orders")
            .group_id("billing")
            .batch_capacity(capacity)
            .build()
    }

    fn fetched(offset: u64) -> Message {
        Message::with_key("orders", "k", "payload")
            .partition(1)
            .offset(offset)
    }

    #[tokio::test]
    async fn test_store_and_commit() {
        let broker = MemoryBroker::new();
        let reader = Reader::new(broker.clone(), &config(3)).unwrap();

        for i in 0..3 {
            reader.store_message(&fetched(i)).await.unwrap();
        }
        assert!(matches!(
            reader.store_message(&fetched(3)).await,
            Err(Error::ReaderBufferFull)
        ));

        reader.commit().await.unwrap();
        assert_eq!(reader.staged(), 0);

        let commits = broker.commit_batches();
        assert_eq!(commits.len(), 1);
        let offsets: Vec<u64> = commits[0].iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        // only the acknowledgement is staged, not the payload
        assert!(commits[0].iter().all(|m| m.value.is_empty() && m.partition == 1));
    }

    #[tokio::test]
    async fn test_commit_empty_is_noop() {
        let broker = MemoryBroker::new();
        let reader = Reader::new(broker.clone(), &config(3)).unwrap();
        reader.commit().await.unwrap();
        assert_eq!(broker.commit_calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_batch() {
        let broker = MemoryBroker::new();
        let reader = Reader::new(broker.clone(), &config(3)).unwrap();
        reader.store_message(&fetched(7)).await.unwrap();

        broker.fail_next_commit();
        let err = reader.commit().await.unwrap_err();
        assert!(matches!(err, Error::Broker { operation: "commit messages", .. }));
        assert_eq!(reader.staged(), 1);
        assert_eq!(reader.stats().commit_errors, 1);

        reader.commit().await.unwrap();
        assert_eq!(reader.staged(), 0);
        assert_eq!(broker.commit_batches().len(), 1);
        assert_eq!(reader.stats().messages_committed, 1);
    }

    #[tokio::test]
    async fn test_close_once() {
        let broker = MemoryBroker::new();
        let reader = Reader::new(broker.clone(), &config(3)).unwrap();

        reader.close().await.unwrap();
        assert_eq!(broker.close_calls(), 1);
        assert!(matches!(reader.close().await, Err(Error::Closed("reader"))));
        assert!(matches!(
            reader.store_message(&fetched(0)).await,
            Err(Error::Closed("reader"))
        ));
        assert!(reader.batch.is_sealed().await);
        assert_eq!(broker.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let broker = MemoryBroker::new();
        let reader = Reader::new(broker, &config(3)).unwrap();
        reader.store_message(&fetched(0)).await.unwrap();

        assert_eq!(reader.name(), "reader:orders");
        let status = reader.status_check().await.unwrap();
        assert_eq!(status["reader"]["messages_stored"], 1);
        assert_eq!(status["closed"], false);
    }
}
