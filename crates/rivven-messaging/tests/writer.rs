//! Writer integration tests against the in-memory broker

mod common;

use anyhow::Result;
use common::init_tracing;
use rivven_messaging::testing::{MemoryBroker, RecordingTracer};
use rivven_messaging::{
    Error, HealthCheck, LogTracer, Message, NoopTracer, Span, SpanKind, TraceContext, Tracer,
    Writer, WriterConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Parks the first `writer.send` span until the test releases it
#[derive(Debug)]
struct GatedTracer {
    entered: Arc<Barrier>,
    release: Arc<Barrier>,
    armed: AtomicBool,
}

impl Tracer for GatedTracer {
    fn start_span(
        &self,
        parent: Option<&TraceContext>,
        name: &'static str,
        kind: SpanKind,
        resource: &str,
    ) -> Box<dyn Span> {
        if name == "writer.send" && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        NoopTracer.start_span(parent, name, kind, resource)
    }

    fn extract(&self, message: &Message) -> Option<TraceContext> {
        NoopTracer.extract(message)
    }
}

fn manual_flush(capacity: usize) -> WriterConfig {
    WriterConfig::builder()
        .topic("events")
        .batch_capacity(capacity)
        .auto_flush_interval(None)
        .build()
}

#[tokio::test]
async fn test_backpressure_recovery() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let writer = Writer::new(broker.clone(), manual_flush(3))?;

    for i in 0..3 {
        writer.send(Message::new("events", format!("m-{}", i))).await?;
    }
    let err = writer
        .send(Message::new("events", "m-3"))
        .await
        .expect_err("fourth send must report backpressure");
    assert!(matches!(err, Error::WriterBufferFull));

    writer.flush().await?;
    writer.send(Message::new("events", "m-3")).await?;
    writer.close().await?;

    let batches = broker.write_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 3);
    assert_eq!(batches[1].len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_flush_preserves_send_order() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let writer = Writer::new(broker.clone(), manual_flush(4))?;

    for i in 0..10 {
        let message = Message::with_key("events", format!("k-{}", i), format!("v-{}", i));
        if let Err(e) = writer.send(message.clone()).await {
            assert!(e.is_backpressure());
            writer.flush().await?;
            writer.send(message).await?;
        }
    }
    writer.flush().await?;

    let keys: Vec<String> = broker
        .written()
        .iter()
        .map(|m| m.key_str().into_owned())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("k-{}", i)).collect();
    assert_eq!(keys, expected);
    Ok(())
}

#[tokio::test]
async fn test_failed_flush_retains_batch_until_success() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let writer = Writer::new(broker.clone(), manual_flush(5))?;

    writer.send(Message::new("events", "a")).await?;
    writer.send(Message::new("events", "b")).await?;

    broker.fail_next_write();
    assert!(writer.flush().await.is_err());
    assert_eq!(writer.staged(), 2);
    assert!(broker.written().is_empty());

    writer.flush().await?;
    assert_eq!(writer.staged(), 0);
    assert_eq!(broker.written().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_senders() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let writer = Arc::new(Writer::new(broker.clone(), manual_flush(10))?);

    let mut handles = Vec::new();
    for task in 0..4 {
        let writer = Arc::clone(&writer);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let message = Message::with_key("events", format!("t{}", task), format!("{}", i));
                loop {
                    match writer.send(message.clone()).await {
                        Ok(()) => break,
                        Err(e) if e.is_backpressure() => writer.flush().await?,
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok::<_, Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    writer.flush().await?;

    assert!(broker.write_batches().iter().all(|b| b.len() <= 10));
    let written = broker.written();
    assert_eq!(written.len(), 100);

    // per-sender order survives interleaving
    for task in 0..4 {
        let key = format!("t{}", task);
        let values: Vec<u32> = written
            .iter()
            .filter(|m| m.key_str() == key.as_str())
            .map(|m| String::from_utf8_lossy(&m.value).parse().unwrap())
            .collect();
        assert_eq!(values, (0..25).collect::<Vec<u32>>());
    }
    assert_eq!(writer.stats().messages_flushed, 100);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auto_flush_then_close_stops_writes() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let config = WriterConfig::builder()
        .topic("events")
        .batch_capacity(10)
        .auto_flush_interval(Some(Duration::from_millis(100)))
        .build();
    let writer = Writer::new(broker.clone(), config)?;

    writer.send(Message::new("", "a")).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(broker.write_calls(), 1);

    writer.send(Message::new("", "b")).await?;
    writer.close().await?;
    assert_eq!(broker.write_calls(), 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.write_calls(), 2);
    assert_eq!(broker.close_calls(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_parent_cancellation_stops_auto_flush() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let parent = CancellationToken::new();
    let config = WriterConfig::builder()
        .topic("events")
        .auto_flush_interval(Some(Duration::from_secs(1)))
        .build();
    let writer = Writer::with_shutdown(broker.clone(), config, parent.clone())?;

    writer.send(Message::new("", "a")).await?;
    parent.cancel();
    // the task flushes once on its way out
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(broker.write_calls(), 1);

    writer.send(Message::new("", "b")).await?;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(broker.write_calls(), 1);
    assert_eq!(writer.staged(), 1);

    writer.flush().await?;
    assert_eq!(broker.write_calls(), 2);
    writer.close().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_keeps_batch() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    broker.set_delay(Duration::from_secs(1));
    let config = WriterConfig::builder()
        .topic("events")
        .auto_flush_interval(None)
        .operation_timeout(Some(Duration::from_millis(100)))
        .build();
    let writer = Writer::new(broker.clone(), config)?;

    writer.send(Message::new("", "a")).await?;
    let err = writer.flush().await.expect_err("slow write must time out");
    assert!(matches!(err, Error::Timeout("write messages")));
    assert_eq!(writer.staged(), 1);

    broker.set_delay(Duration::ZERO);
    writer.flush().await?;
    assert_eq!(broker.written().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_send_injects_trace_context() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let tracer = RecordingTracer::new();
    let config = WriterConfig::builder()
        .topic("events")
        .auto_flush_interval(None)
        .tracer(Arc::new(tracer.clone()))
        .build();
    let writer = Writer::new(broker.clone(), config)?;

    let upstream = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
    writer
        .send(Message::with_key("", "user-1", "a").add_header("traceparent", upstream))
        .await?;
    writer.send(Message::new("", "b")).await?;
    writer.flush().await?;

    let written = broker.written();
    let first = written[0].header("traceparent").expect("traceparent injected");
    assert!(first.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
    assert_ne!(first, upstream);
    assert_eq!(written[0].headers.len(), 1);
    assert!(written[1].header("traceparent").is_some());

    let sends = tracer.spans_named("writer.send");
    assert_eq!(sends.len(), 2);
    assert_eq!(
        sends[0].attribute("messaging.destination").map(|v| v.to_string()),
        Some("events".to_string())
    );
    assert_eq!(
        sends[0].attribute("messaging.key").map(|v| v.to_string()),
        Some("user-1".to_string())
    );
    assert!(sends[0].attribute("messaging.timestamp").is_some());

    let flushes = tracer.spans_named("writer.flush");
    assert_eq!(flushes.len(), 1);
    assert_eq!(
        flushes[0].attribute("messaging.batch_size").map(|v| v.to_string()),
        Some("2".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_log_tracer_and_noop_tracer() -> Result<()> {
    init_tracing();

    let traced = MemoryBroker::new();
    let config = WriterConfig::builder()
        .topic("events")
        .auto_flush_interval(None)
        .tracer(Arc::new(LogTracer::new("writer-tests")))
        .build();
    let writer = Writer::new(traced.clone(), config)?;
    writer.send(Message::new("", "a")).await?;
    writer.close().await?;
    assert!(traced.written()[0].header("traceparent").is_some());

    let untraced = MemoryBroker::new();
    let writer = Writer::new(untraced.clone(), manual_flush(5))?;
    writer.send(Message::new("", "a")).await?;
    writer.close().await?;
    assert!(untraced.written()[0].headers.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_status_check_reports_broker_stats() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let writer = Writer::new(broker, manual_flush(5))?;
    writer.send(Message::new("", "abc")).await?;
    writer.flush().await?;

    let status = writer.status_check().await?;
    assert_eq!(status["writer"]["messages_flushed"], 1);
    assert_eq!(status["broker"]["messages"], 1);
    assert_eq!(status["broker"]["bytes"], 3);
    writer.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_racing_close_is_rejected() -> Result<()> {
    init_tracing();
    let broker = MemoryBroker::new();
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let tracer = GatedTracer {
        entered: Arc::clone(&entered),
        release: Arc::clone(&release),
        armed: AtomicBool::new(true),
    };
    let config = WriterConfig::builder()
        .topic("events")
        .batch_capacity(5)
        .auto_flush_interval(None)
        .tracer(Arc::new(tracer))
        .build();
    let writer = Arc::new(Writer::new(broker.clone(), config)?);

    // the send passes the closed check, then parks inside its span
    let sending = {
        let writer = Arc::clone(&writer);
        tokio::spawn(async move { writer.send(Message::new("", "late")).await })
    };
    tokio::task::spawn_blocking(move || entered.wait()).await?;

    writer.close().await?;
    tokio::task::spawn_blocking(move || release.wait()).await?;

    let result = sending.await?;
    assert!(matches!(result, Err(Error::Closed("writer"))));
    assert_eq!(writer.staged(), 0);
    assert!(broker.written().is_empty());
    assert_eq!(broker.close_calls(), 1);
    Ok(())
}
