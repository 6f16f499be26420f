//! Tracing hooks for send, flush, commit and consume boundaries
//!
//! Components call a [`Tracer`] at each boundary to open a [`Span`], and
//! propagate the span's [`TraceContext`] through message headers using the
//! W3C Trace Context header names (`traceparent`, `tracestate`, `baggage`).
//!
//! Two implementations ship with the crate:
//!
//! - [`NoopTracer`]: the default; opens nothing and writes no headers
//! - [`LogTracer`]: bridges spans onto the `tracing` crate so any installed
//!   subscriber (fmt, OpenTelemetry layer, ...) sees them
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_messaging::{LogTracer, WriterConfig};
//! use std::sync::Arc;
//!
//! let config = WriterConfig::builder()
//!     .topic("events")
//!     .tracer(Arc::new(LogTracer::new("billing-service")))
//!     .build();
//! ```

use crate::message::Message;
use std::collections::BTreeMap;
use std::fmt;

const TRACEPARENT: &str = "traceparent";
const TRACESTATE: &str = "tracestate";
const BAGGAGE: &str = "baggage";

/// Role of a span in a messaging exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Span attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Int(i) => write!(f, "{}", i),
            AttributeValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::Int(value.min(i64::MAX as u64) as i64)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Int(value as i64)
    }
}

impl From<usize> for AttributeValue {
    fn from(value: usize) -> Self {
        AttributeValue::from(value as u64)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// Propagation context carried in message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    /// W3C traceparent header value
    pub traceparent: Option<String>,
    /// W3C tracestate header value
    pub tracestate: Option<String>,
    /// Baggage items
    pub baggage: BTreeMap<String, String>,
}

impl TraceContext {
    /// Start a new trace with a random trace id
    pub fn new_root() -> Self {
        Self::with_ids(random_trace_id(), random_span_id())
    }

    /// New span id within the same trace; baggage and tracestate are kept.
    ///
    /// Falls back to a new root when this context has no valid traceparent.
    pub fn child(&self) -> Self {
        match self.trace_id() {
            Some(trace_id) => Self {
                traceparent: Some(format_traceparent(trace_id, &random_span_id())),
                tracestate: self.tracestate.clone(),
                baggage: self.baggage.clone(),
            },
            None => Self {
                baggage: self.baggage.clone(),
                ..Self::new_root()
            },
        }
    }

    fn with_ids(trace_id: String, span_id: String) -> Self {
        Self {
            traceparent: Some(format_traceparent(&trace_id, &span_id)),
            tracestate: None,
            baggage: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.traceparent.is_none() && self.tracestate.is_none() && self.baggage.is_empty()
    }

    /// Trace id part of a well-formed traceparent
    pub fn trace_id(&self) -> Option<&str> {
        self.traceparent_part(1, 32)
    }

    /// Span id (parent id) part of a well-formed traceparent
    pub fn span_id(&self) -> Option<&str> {
        self.traceparent_part(2, 16)
    }

    fn traceparent_part(&self, index: usize, len: usize) -> Option<&str> {
        let traceparent = self.traceparent.as_deref()?;
        let parts: Vec<&str> = traceparent.split('-').collect();
        if parts.len() != 4 {
            return None;
        }
        let part = parts[index];
        (part.len() == len && part.bytes().all(|b| b.is_ascii_hexdigit())).then_some(part)
    }

    /// Read propagation headers from a message; `None` when there are none.
    pub fn from_message(message: &Message) -> Option<Self> {
        let ctx = Self {
            traceparent: message.header(TRACEPARENT).map(str::to_string),
            tracestate: message.header(TRACESTATE).map(str::to_string),
            baggage: message
                .header(BAGGAGE)
                .map(parse_baggage)
                .unwrap_or_default(),
        };
        (!ctx.is_empty()).then_some(ctx)
    }

    /// Write propagation headers into a message, replacing stale values.
    pub fn inject_into(&self, message: &mut Message) {
        if let Some(ref tp) = self.traceparent {
            message.set_header(TRACEPARENT, tp.clone());
        }
        if let Some(ref ts) = self.tracestate {
            message.set_header(TRACESTATE, ts.clone());
        }
        if !self.baggage.is_empty() {
            message.set_header(BAGGAGE, format_baggage(&self.baggage));
        }
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage.insert(key.into(), value.into());
    }

    pub fn get_baggage(&self, key: &str) -> Option<&String> {
        self.baggage.get(key)
    }
}

fn random_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>().max(1))
}

fn random_span_id() -> String {
    format!("{:016x}", rand::random::<u64>().max(1))
}

fn format_traceparent(trace_id: &str, span_id: &str) -> String {
    format!("00-{}-{}-01", trace_id, span_id)
}

fn parse_baggage(baggage: &str) -> BTreeMap<String, String> {
    baggage
        .split(',')
        .filter_map(|item| {
            let mut parts = item.trim().splitn(2, '=');
            match (parts.next(), parts.next()) {
                (Some(key), Some(value)) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

fn format_baggage(baggage: &BTreeMap<String, String>) -> String {
    baggage
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// One traced unit of work
pub trait Span: Send {
    fn set_attribute(&mut self, key: &'static str, value: AttributeValue);

    /// Context to propagate downstream of this span
    fn context(&self) -> TraceContext;

    fn finish(self: Box<Self>);

    fn record_error(&mut self, error: &dyn std::error::Error) {
        self.set_attribute("error", AttributeValue::String(error.to_string()));
    }
}

/// Span factory and header propagator
pub trait Tracer: Send + Sync + fmt::Debug {
    /// Open a span. `resource` names the topic or component the span is about.
    fn start_span(
        &self,
        parent: Option<&TraceContext>,
        name: &'static str,
        kind: SpanKind,
        resource: &str,
    ) -> Box<dyn Span>;

    /// Write the span's context into the message headers
    fn inject(&self, span: &dyn Span, message: &mut Message) {
        let ctx = span.context();
        if !ctx.is_empty() {
            ctx.inject_into(message);
        }
    }

    /// Read a parent context from message headers
    fn extract(&self, message: &Message) -> Option<TraceContext> {
        TraceContext::from_message(message)
    }
}

/// Tracer that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _key: &'static str, _value: AttributeValue) {}

    fn context(&self) -> TraceContext {
        TraceContext::default()
    }

    fn finish(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(
        &self,
        _parent: Option<&TraceContext>,
        _name: &'static str,
        _kind: SpanKind,
        _resource: &str,
    ) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }

    fn extract(&self, _message: &Message) -> Option<TraceContext> {
        None
    }
}

/// Tracer that emits spans through the `tracing` crate
#[derive(Debug, Clone)]
pub struct LogTracer {
    service_name: String,
}

impl LogTracer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

struct LogSpan {
    span: tracing::Span,
    context: TraceContext,
    started: std::time::Instant,
}

impl Span for LogSpan {
    fn set_attribute(&mut self, key: &'static str, value: AttributeValue) {
        // Only fields declared in `start_span` are recorded
        self.span.record(key, tracing::field::display(&value));
    }

    fn context(&self) -> TraceContext {
        self.context.clone()
    }

    fn finish(self: Box<Self>) {
        let elapsed_us = self.started.elapsed().as_micros() as u64;
        tracing::debug!(parent: &self.span, elapsed_us, "span finished");
    }
}

impl Tracer for LogTracer {
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
        let span = tracing::info_span!(
            "messaging",
            otel.name = name,
            otel.kind = kind.as_str(),
            service.name = %self.service_name,
            resource = %resource,
            trace_id = context.trace_id().unwrap_or_default(),
            span_id = context.span_id().unwrap_or_default(),
            parent_span_id = parent.and_then(|p| p.span_id()).unwrap_or_default(),
            messaging.system = "rivven",
            messaging.destination = tracing::field::Empty,
            messaging.key = tracing::field::Empty,
            messaging.timestamp = tracing::field::Empty,
            messaging.partition = tracing::field::Empty,
            messaging.offset = tracing::field::Empty,
            messaging.batch_size = tracing::field::Empty,
            error = tracing::field::Empty,
        );
        Box::new(LogSpan {
            span,
            context,
            started: std::time::Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_context_is_well_formed() {
        let ctx = TraceContext::new_root();
        assert_eq!(ctx.trace_id().map(str::len), Some(32));
        assert_eq!(ctx.span_id().map(str::len), Some(16));
        assert!(ctx.traceparent.as_deref().unwrap().starts_with("00-"));
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let mut root = TraceContext::new_root();
        root.set_baggage("tenant", "acme");

        let child = root.child();
        assert_eq!(child.trace_id(), root.trace_id());
        assert_ne!(child.span_id(), root.span_id());
        assert_eq!(child.get_baggage("tenant"), Some(&"acme".to_string()));
    }

    #[test]
    fn test_child_of_malformed_starts_new_trace() {
        let bogus = TraceContext {
            traceparent: Some("not-a-traceparent".to_string()),
            ..Default::default()
        };
        assert!(bogus.trace_id().is_none());
        assert!(bogus.child().trace_id().is_some());
    }

    #[test]
    fn test_header_round_trip() {
        let mut ctx = TraceContext::new_root();
        ctx.tracestate = Some("vendor=1".to_string());
        ctx.set_baggage("user_id", "123");

        let mut msg = Message::new("events", "v").add_header("traceparent", "stale");
        ctx.inject_into(&mut msg);

        assert_eq!(msg.header("traceparent"), ctx.traceparent.as_deref());
        assert_eq!(
            msg.headers.iter().filter(|(k, _)| k == "traceparent").count(),
            1
        );
        assert_eq!(TraceContext::from_message(&msg), Some(ctx));
    }

    #[test]
    fn test_from_message_without_headers() {
        assert!(TraceContext::from_message(&Message::new("events", "v")).is_none());
    }

    #[test]
    fn test_parse_baggage() {
        let parsed = parse_baggage("key1=value1,key2=value2, key3=value3,broken,=x");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed.get("key3"), Some(&"value3".to_string()));
        assert_eq!(format_baggage(&parsed), "key1=value1,key2=value2,key3=value3");
    }

    #[test]
    fn test_noop_tracer_writes_nothing() {
        let tracer = NoopTracer;
        let mut span = tracer.start_span(None, "writer.send", SpanKind::Producer, "events");
        span.set_attribute("messaging.key", "k".into());

        let mut msg = Message::new("events", "v");
        tracer.inject(span.as_ref(), &mut msg);
        span.finish();

        assert!(msg.headers.is_empty());
    }

    #[test]
    fn test_log_tracer_injects_child_of_parent() {
        let tracer = LogTracer::new("test");
        let parent = TraceContext::new_root();

        let mut span = tracer.start_span(Some(&parent), "writer.send", SpanKind::Producer, "events");
        span.set_attribute("messaging.destination", "events".into());
        span.set_attribute("undeclared.field", 1u64.into());

        let mut msg = Message::new("events", "v");
        tracer.inject(span.as_ref(), &mut msg);
        span.finish();

        let injected = tracer.extract(&msg).unwrap();
        assert_eq!(injected.trace_id(), parent.trace_id());
        assert_ne!(injected.span_id(), parent.span_id());
    }

    #[test]
    fn test_attribute_conversions() {
        assert_eq!(AttributeValue::from(u64::MAX), AttributeValue::Int(i64::MAX));
        assert_eq!(AttributeValue::from(3usize).to_string(), "3");
        assert_eq!(AttributeValue::from(true).to_string(), "true");
    }
}
