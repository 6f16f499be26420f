//! In-memory broker and tracer for tests
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for downstream crates that want to exercise a [`Writer`](crate::Writer)
//! or [`Poller`](crate::Poller) without a broker.
//!
//! ```rust,ignore
//! let broker = MemoryBroker::new();
//! broker.push_fetch(Message::new("orders", "payload").offset(0));
//!
//! let poller = Poller::new(broker.clone(), config)?;
//! // ...
//! assert_eq!(broker.commit_batches().len(), 1);
//! ```

use crate::broker::{BrokerError, BrokerReader, BrokerStats, BrokerWriter};
use crate::message::Message;
use crate::tracer::{AttributeValue, Span, SpanKind, TraceContext, Tracer};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Memory Broker
// ============================================================================

/// Broker client double implementing both [`BrokerWriter`] and
/// [`BrokerReader`].
///
/// Clones share state, so a test keeps one clone for inspection and hands
/// another to the component under test.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    fetch_ready: Arc<Notify>,
}

#[derive(Debug, Default)]
struct BrokerState {
    pending: VecDeque<Result<Message, BrokerError>>,
    write_batches: Vec<Vec<Message>>,
    commit_batches: Vec<Vec<Message>>,
    write_calls: usize,
    commit_calls: usize,
    close_calls: usize,
    closed: bool,
    fail_next_write: bool,
    fail_next_commit: bool,
    fail_close: bool,
    delay: Duration,
    stats: BrokerStats,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for `fetch_message`
    pub fn push_fetch(&self, message: Message) {
        self.state.lock().pending.push_back(Ok(message));
        self.fetch_ready.notify_one();
    }

    /// Queue a fetch failure
    pub fn push_fetch_error(&self, error: BrokerError) {
        self.state.lock().pending.push_back(Err(error));
        self.fetch_ready.notify_one();
    }

    /// Fail the next `write_messages` call
    pub fn fail_next_write(&self) {
        self.state.lock().fail_next_write = true;
    }

    /// Fail the next `commit_messages` call
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next_commit = true;
    }

    /// Fail every `close` call
    pub fn fail_close(&self) {
        self.state.lock().fail_close = true;
    }

    /// Delay every write and commit by `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Successfully written messages in write order
    pub fn written(&self) -> Vec<Message> {
        self.state
            .lock()
            .write_batches
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Successful write calls, one entry per call
    pub fn write_batches(&self) -> Vec<Vec<Message>> {
        self.state.lock().write_batches.clone()
    }

    /// Successful commit calls, one entry per call
    pub fn commit_batches(&self) -> Vec<Vec<Message>> {
        self.state.lock().commit_batches.clone()
    }

    /// Committed offsets in commit order
    pub fn committed_offsets(&self) -> Vec<u64> {
        self.state
            .lock()
            .commit_batches
            .iter()
            .flatten()
            .map(|m| m.offset)
            .collect()
    }

    /// All `write_messages` calls, including failed ones
    pub fn write_calls(&self) -> usize {
        self.state.lock().write_calls
    }

    /// All `commit_messages` calls, including failed ones
    pub fn commit_calls(&self) -> usize {
        self.state.lock().commit_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Messages queued but not yet fetched
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn delay(&self) -> Duration {
        self.state.lock().delay
    }
}

#[async_trait]
impl BrokerWriter for MemoryBroker {
    async fn write_messages(&self, messages: &[Message]) -> Result<(), BrokerError> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.write_calls += 1;
        state.stats.requests += 1;
        if state.closed {
            state.stats.errors += 1;
            return Err(BrokerError::Closed);
        }
        if std::mem::take(&mut state.fail_next_write) {
            state.stats.errors += 1;
            return Err(BrokerError::Server("injected write failure".into()));
        }

        state.stats.messages += messages.len() as u64;
        state.stats.bytes += messages.iter().map(|m| m.value.len() as u64).sum::<u64>();
        state.write_batches.push(messages.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        close_broker(self)
    }

    fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }
}

#[async_trait]
impl BrokerReader for MemoryBroker {
    async fn fetch_message(&self) -> Result<Message, BrokerError> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(next) = state.pending.pop_front() {
                    state.stats.requests += 1;
                    match next {
                        Ok(ref message) => {
                            state.stats.messages += 1;
                            state.stats.bytes += message.value.len() as u64;
                        }
                        Err(_) => state.stats.errors += 1,
                    }
                    return next;
                }
                if state.closed {
                    return Err(BrokerError::Closed);
                }
            }
            // notify_one keeps a permit, so a push racing this wait is not lost
            self.fetch_ready.notified().await;
        }
    }

    async fn commit_messages(&self, messages: &[Message]) -> Result<(), BrokerError> {
        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.commit_calls += 1;
        state.stats.requests += 1;
        if state.closed {
            state.stats.errors += 1;
            return Err(BrokerError::Closed);
        }
        if std::mem::take(&mut state.fail_next_commit) {
            state.stats.errors += 1;
            return Err(BrokerError::Server("injected commit failure".into()));
        }
        state.commit_batches.push(messages.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        close_broker(self)
    }

    fn stats(&self) -> BrokerStats {
        self.state.lock().stats.clone()
    }
}

fn close_broker(broker: &MemoryBroker) -> Result<(), BrokerError> {
    let result = {
        let mut state = broker.state.lock();
        state.close_calls += 1;
        state.closed = true;
        if state.fail_close {
            Err(BrokerError::Connection("injected close failure".into()))
        } else {
            Ok(())
        }
    };
    // Wake a parked fetch so it observes the close
    broker.fetch_ready.notify_one();
    result
}

// ============================================================================
// Recording Tracer
// ============================================================================

/// A finished span captured by [`RecordingTracer`]
#[derive(Debug, Clone)]
pub struct RecordedSpan {
    pub name: &'static str,
    pub kind: SpanKind,
    pub resource: String,
    pub parent: Option<TraceContext>,
    pub context: TraceContext,
    pub attributes: Vec<(&'static str, AttributeValue)>,
}

impl RecordedSpan {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }
}

/// Tracer that keeps every finished span in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished spans in finish order
    pub fn spans(&self) -> Vec<RecordedSpan> {
        self.spans.lock().clone()
    }

    pub fn spans_named(&self, name: &str) -> Vec<RecordedSpan> {
        self.spans
            .lock()
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }
}

struct RecordingSpan {
    record: RecordedSpan,
    sink: Arc<Mutex<Vec<RecordedSpan>>>,
}

impl Span for RecordingSpan {
    fn set_attribute(&mut self, key: &'static str, value: AttributeValue) {
        self.record.attributes.push((key, value));
    }

    fn context(&self) -> TraceContext {
        self.record.context.clone()
    }

    fn finish(self: Box<Self>) {
        self.sink.lock().push(self.record);
    }
}

impl Tracer for RecordingTracer {
    fn start_span(
        &self,
        parent: Option<&TraceContext>,
        name: &'static str,
        kind: SpanKind,
        resource: &str,
    ) -> Box<dyn Span> {
        let context = match parent {
            Some(parent) => parent.child(),
            None => TraceContext::new_root(),
        };
        Box::new(RecordingSpan {
            record: RecordedSpan {
                name,
                kind,
                resource: resource.to_string(),
                parent: parent.cloned(),
                context,
                attributes: Vec::new(),
            },
            sink: Arc::clone(&self.spans),
        })
    }
}
