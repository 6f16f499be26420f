use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single message flowing through a [`Writer`](crate::Writer) or a
/// [`Poller`](crate::Poller).
///
/// Headers stay mutable until the message is handed to the broker client;
/// trace propagation writes into them at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is written to or was fetched from
    pub topic: String,

    /// Partition (assigned by the broker client on write)
    pub partition: u32,

    /// Offset within the partition (meaningful for fetched messages only)
    pub offset: u64,

    /// Message key; empty when the message has no key
    pub key: Bytes,

    /// Message payload
    pub value: Bytes,

    /// Ordered header pairs
    pub headers: Vec<(String, String)>,

    /// Timestamp when the message was created or appended
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message for a topic
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: Bytes::new(),
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a message with a key
    pub fn with_key(
        topic: impl Into<String>,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            ..Self::new(topic, value)
        }
    }

    pub fn partition(mut self, partition: u32) -> Self {
        self.partition = partition;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append a header (builder style)
    pub fn add_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Value of the first header named `key`
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Replace the first header named `key` in place, or append it.
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.headers.push((key, value)),
        }
    }

    /// Key as UTF-8 text, lossy; used for span attributes
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// The part of a fetched message needed to acknowledge it.
    ///
    /// Payload and headers are dropped so staged acknowledgements do not pin
    /// message bodies in memory.
    pub fn commit_marker(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: Bytes::new(),
            value: Bytes::new(),
            headers: Vec::new(),
            timestamp: self.timestamp,
        }
    }
}
