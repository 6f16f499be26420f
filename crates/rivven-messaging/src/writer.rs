//! Batching writer with explicit and timer-driven flush
//!
//! A [`Writer`] stages outbound messages in a [`BufferedBatch`] and writes
//! them to the broker in one call per flush. When the batch is full,
//! [`Writer::send`] returns [`Error::WriterBufferFull`]: the caller should
//! [`flush`](Writer::flush) and retry, or treat it as backpressure.
//!
//! In async mode every message is written straight through to the broker.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_messaging::{Message, Writer, WriterConfig};
//!
//! let config = WriterConfig::builder()
//!     .topic("events")
//!     .batch_capacity(500)
//!     .auto_flush_interval(Some(Duration::from_millis(200)))
//!     .build();
//!
//! let writer = Writer::new(broker_writer, config)?;
//!
//! match writer.send(Message::new("events", "payload")).await {
//!     Err(Error::WriterBufferFull) => writer.flush().await?,
//!     other => other?,
//! }
//!
//! writer.close().await?;
//! ```
//!
//! # Delivery
//!
//! The batch is reset only after the broker accepted the write, so a failed
//! flush keeps every staged message for the next attempt (at-least-once).

use crate::batch::{BatchDrain, BatchRole, BufferedBatch};
use crate::broker::{self, BrokerWriter};
use crate::config::WriterConfig;
use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::message::Message;
use crate::tracer::SpanKind;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Producer-side batching writer
pub struct Writer {
    inner: Arc<WriterInner>,
    /// Cancels the auto-flush task
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

struct WriterInner {
    broker: Box<dyn BrokerWriter>,
    batch: BufferedBatch,
    config: WriterConfig,
    name: String,
    stats: WriterCounters,
    closed: AtomicBool,
}

impl Writer {
    /// Create a writer owning `broker`.
    ///
    /// Spawns the auto-flush task when configured, so this must be called
    /// from within a Tokio runtime.
    pub fn new(broker: impl BrokerWriter, config: WriterConfig) -> Result<Self> {
        Self::with_shutdown(broker, config, CancellationToken::new())
    }

    /// Like [`Writer::new`], with the auto-flush task also stopped when
    /// `parent` is cancelled. The writer stays usable for explicit flushes.
    pub fn with_shutdown(
        broker: impl BrokerWriter,
        config: WriterConfig,
        parent: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let name = if config.topic.is_empty() {
            format!("writer:{}", config.broker.client_id)
        } else {
            format!("writer:{}", config.topic)
        };

        let inner = Arc::new(WriterInner {
            broker: Box::new(broker),
            batch: BufferedBatch::new(BatchRole::Writer, config.batch_capacity),
            config,
            name,
            stats: WriterCounters::default(),
            closed: AtomicBool::new(false),
        });

        let writer = Self {
            inner,
            shutdown: parent.child_token(),
            tracker: TaskTracker::new(),
        };

        let auto_flush = writer.inner.config.auto_flush_interval();
        match auto_flush {
            Some(interval) if !writer.inner.config.async_mode => writer.spawn_auto_flush(interval),
            _ => {}
        }

        info!(
            writer = %writer.inner.name,
            capacity = writer.inner.batch.capacity(),
            async_mode = writer.inner.config.async_mode,
            auto_flush_ms = auto_flush.map(|d| d.as_millis() as u64),
            "Writer initialized"
        );

        Ok(writer)
    }

    /// Stage a message, or write it through in async mode.
    ///
    /// Messages without a topic get the configured default topic. The send
    /// span's trace context is injected into the message headers first.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("writer"));
        }
        if message.topic.is_empty() {
            message.topic = inner.config.topic.clone();
        }

        let tracer = &inner.config.tracer;
        let parent = tracer.extract(&message);
        let mut span = tracer.start_span(
            parent.as_ref(),
            "writer.send",
            SpanKind::Producer,
            &message.topic,
        );
        span.set_attribute("messaging.destination", message.topic.as_str().into());
        span.set_attribute("messaging.key", message.key_str().into_owned().into());
        span.set_attribute(
            "messaging.timestamp",
            message.timestamp.timestamp_millis().into(),
        );
        tracer.inject(span.as_ref(), &mut message);

        let result = if inner.config.async_mode {
            inner.write(std::slice::from_ref(&message)).await
        } else {
            inner.batch.append(message).await
        };

        match &result {
            Ok(()) => {
                inner.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                if e.is_backpressure() {
                    inner.stats.backpressure.fetch_add(1, Ordering::Relaxed);
                }
                span.record_error(e);
            }
        }
        span.finish();
        result
    }

    /// Write all staged messages in one broker call.
    ///
    /// No-op when nothing is staged. On failure the batch is left intact.
    pub async fn flush(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed("writer"));
        }
        self.inner.flush().await
    }

    /// Stop the auto-flush task, flush what is left and close the broker
    /// writer. Flush and close failures are both reported.
    ///
    /// Returns [`Error::Closed`] if the writer was already closed.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("writer"));
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        // Seal under the batch lock: a send that passed the closed check
        // above either staged before this drain or is rejected after it
        let mut drain = inner.batch.drain().await;
        drain.seal();
        let flush_err = inner.flush_drained(drain).await.err();
        if let Some(ref e) = flush_err {
            error!(writer = %inner.name, error = %e, staged = inner.batch.len(), "Final flush failed");
        }

        let close_err = broker::call(
            inner.config.operation_timeout(),
            "close writer",
            inner.broker.close(),
        )
        .await
        .err();

        info!(writer = %inner.name, "Writer closed");

        match Error::combine(flush_err, close_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of staged messages
    pub fn staged(&self) -> usize {
        self.inner.batch.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WriterStats {
        self.inner.snapshot()
    }

    fn spawn_auto_flush(&self, interval: Duration) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.shutdown.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.flush().await {
                            error!(
                                writer = %inner.name,
                                error = %e,
                                staged = inner.batch.len(),
                                "Auto-flush failed"
                            );
                        }
                    }
                }
            }

            // Cancelled: flush once more so nothing staged is stranded
            if let Err(e) = inner.flush().await {
                warn!(writer = %inner.name, error = %e, "Flush on shutdown failed");
            }
            debug!(writer = %inner.name, "Auto-flush task stopped");
        });
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            warn!(
                writer = %self.inner.name,
                staged = self.inner.batch.len(),
                "Writer dropped without close"
            );
        }
        self.shutdown.cancel();
    }
}

impl WriterInner {
    async fn flush(&self) -> Result<()> {
        let drain = self.batch.drain().await;
        self.flush_drained(drain).await
    }

    async fn flush_drained(&self, drain: BatchDrain<'_>) -> Result<()> {
        if drain.is_empty() {
            return Ok(());
        }
        let count = drain.len();

        let tracer = &self.config.tracer;
        let mut span = tracer.start_span(None, "writer.flush", SpanKind::Producer, &self.name);
        span.set_attribute("messaging.batch_size", count.into());

        match self.write(drain.messages()).await {
            Ok(()) => {
                drain.commit();
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .messages_flushed
                    .fetch_add(count as u64, Ordering::Relaxed);
                debug!(writer = %self.name, count, "Flushed batch");
                span.finish();
                Ok(())
            }
            Err(e) => {
                self.stats.flush_errors.fetch_add(1, Ordering::Relaxed);
                span.record_error(&e);
                span.finish();
                Err(e)
            }
        }
    }

    async fn write(&self, messages: &[Message]) -> Result<()> {
        broker::call(
            self.config.operation_timeout(),
            "write messages",
            self.broker.write_messages(messages),
        )
        .await
    }

    fn snapshot(&self) -> WriterStats {
        WriterStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_flushed: self.stats.messages_flushed.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            flush_errors: self.stats.flush_errors.load(Ordering::Relaxed),
            backpressure: self.stats.backpressure.load(Ordering::Relaxed),
            staged: self.batch.len(),
            capacity: self.batch.capacity(),
        }
    }
}

#[async_trait]
impl HealthCheck for Writer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn status_check(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "writer": self.inner.snapshot(),
            "broker": self.inner.broker.stats(),
            "closed": self.is_closed(),
        }))
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Default)]
struct WriterCounters {
    messages_sent: AtomicU64,
    messages_flushed: AtomicU64,
    flushes: AtomicU64,
    flush_errors: AtomicU64,
    backpressure: AtomicU64,
}

/// Writer statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    /// Messages accepted by `send`
    pub messages_sent: u64,
    /// Messages written by successful flushes
    pub messages_flushed: u64,
    /// Successful flushes
    pub flushes: u64,
    /// Failed flushes
    pub flush_errors: u64,
    /// Sends rejected with `WriterBufferFull`
    pub backpressure: u64,
    /// Currently staged messages
    pub staged: usize,
    pub capacity: usize,
}
