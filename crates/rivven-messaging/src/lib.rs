//! # rivven-messaging
//!
//! Batching producer and polling consumer layered over a broker client.
//!
//! - [`Writer`] stages outbound messages and writes them in batches, on an
//!   explicit [`flush`](Writer::flush) or a background timer
//! - [`Poller`] runs the fetch loop, hands each message to a channel and
//!   stages its acknowledgement in a [`Reader`]
//! - [`Reader`] commits staged acknowledgements in batches, on a timer, when
//!   its buffer fills, or on shutdown
//!
//! Buffers are reset only after the broker confirms a write or commit, so
//! delivery is at-least-once. A full buffer is reported as
//! [`Error::WriterBufferFull`] / [`Error::ReaderBufferFull`] rather than
//! growing without bound.
//!
//! The wire client is supplied by the caller through the [`BrokerWriter`] and
//! [`BrokerReader`] traits.
//!
//! ## Example
//!
//! ```rust,ignore
//! use rivven_messaging::{Message, Poller, PollerConfig, Writer, WriterConfig};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! let writer = Writer::new(broker_writer, WriterConfig::builder().topic("orders").build())?;
//! writer.send(Message::with_key("orders", "user-1", "created")).await?;
//! writer.close().await?;
//!
//! let config = PollerConfig::builder().topic("orders").group_id("billing").build();
//! let poller = Poller::new(broker_reader, config)?;
//! let (tx, mut rx) = mpsc::channel(1);
//! let cancel = CancellationToken::new();
//! tokio::spawn(async move { poller.poll(cancel, tx).await });
//!
//! while let Some(message) = rx.recv().await {
//!     println!("{}: {:?}", message.offset, message.value);
//! }
//! ```

pub mod batch;
pub mod broker;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod poller;
pub mod reader;
pub mod tracer;
pub mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use batch::{BatchDrain, BatchRole, BufferedBatch};
pub use broker::{BrokerError, BrokerReader, BrokerStats, BrokerWriter};
pub use config::{
    BrokerConfig, PollerConfig, PollerConfigBuilder, WriterConfig, WriterConfigBuilder,
};
pub use error::{Error, Result};
pub use health::HealthCheck;
pub use message::Message;
pub use poller::{Poller, PollerState, PollerStats};
pub use reader::{Reader, ReaderStats};
pub use tracer::{AttributeValue, LogTracer, NoopTracer, Span, SpanKind, TraceContext, Tracer};
pub use writer::{Writer, WriterStats};
