//! Writer and poller configuration
//!
//! Configs are plain structs with public fields, builders for programmatic
//! use, and serde support (millisecond `_ms` fields) for loading from files.
//! The tracer is attached programmatically and never deserialized.

use crate::error::{Error, Result};
use crate::tracer::{NoopTracer, Tracer};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default number of staged messages per batch
const DEFAULT_BATCH_CAPACITY: usize = 100;
/// Default auto-flush / auto-commit period
const DEFAULT_INTERVAL_MS: u64 = 1000;
/// Default bound on a single broker call
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

fn default_batch_capacity() -> usize {
    DEFAULT_BATCH_CAPACITY
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

fn default_operation_timeout_ms() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_MS
}

fn default_auto_commit() -> bool {
    true
}

fn default_tracer() -> Arc<dyn Tracer> {
    Arc::new(NoopTracer)
}

fn default_bootstrap_servers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_client_id() -> String {
    "rivven-messaging".to_string()
}

/// `0` means disabled
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ============================================================================
// Broker
// ============================================================================

/// Connection details handed to the broker client
#[derive(Clone, Deserialize)]
pub struct BrokerConfig {
    /// Bootstrap servers (host:port)
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: Vec<String>,
    /// Client id reported to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// SASL username
    #[serde(default)]
    pub username: Option<String>,
    /// SASL password
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl BrokerConfig {
    fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(Error::Config(
                "No bootstrap servers configured".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::Config(
                "password configured without username".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Writer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Topic applied to messages that do not name one
    #[serde(default)]
    pub topic: String,
    /// Maximum number of staged messages before `send` reports backpressure
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
    /// Auto-flush period in milliseconds (0 = explicit flush only)
    #[serde(default = "default_interval_ms")]
    pub auto_flush_interval_ms: u64,
    /// Write every message straight through to the broker
    #[serde(default)]
    pub async_mode: bool,
    /// Bound on each broker call in milliseconds (0 = unbounded)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(skip, default = "default_tracer")]
    pub tracer: Arc<dyn Tracer>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topic: String::new(),
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            auto_flush_interval_ms: DEFAULT_INTERVAL_MS,
            async_mode: false,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            tracer: default_tracer(),
        }
    }
}

impl WriterConfig {
    pub fn builder() -> WriterConfigBuilder {
        WriterConfigBuilder::default()
    }

    pub fn auto_flush_interval(&self) -> Option<Duration> {
        millis(self.auto_flush_interval_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if !self.async_mode && self.batch_capacity == 0 {
            return Err(Error::Config(
                "batch_capacity must be at least 1 for a buffered writer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`WriterConfig`]
#[derive(Default)]
pub struct WriterConfigBuilder {
    config: WriterConfig,
}

impl WriterConfigBuilder {
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.config.broker = broker;
        self
    }

    pub fn bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.config.broker.bootstrap_servers = servers;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.broker.username = Some(username.into());
        self.config.broker.password = Some(password.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.config.batch_capacity = capacity;
        self
    }

    /// `None` disables the background flush
    pub fn auto_flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.auto_flush_interval_ms = interval.map_or(0, |d| d.as_millis() as u64);
        self
    }

    pub fn async_mode(mut self, enabled: bool) -> Self {
        self.config.async_mode = enabled;
        self
    }

    /// `None` leaves broker calls unbounded
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.operation_timeout_ms = timeout.map_or(0, |d| d.as_millis() as u64);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.config.tracer = tracer;
        self
    }

    pub fn build(self) -> WriterConfig {
        self.config
    }
}

// ============================================================================
// Poller
// ============================================================================

/// Poller (and reader) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Topics the broker client is subscribed to
    #[serde(default)]
    pub topics: Vec<String>,
    /// Consumer group id
    #[serde(default)]
    pub group_id: String,
    /// Maximum number of acknowledgements staged before a commit is forced
    #[serde(default = "default_batch_capacity")]
    pub batch_capacity: usize,
    /// Run the background commit task
    #[serde(default = "default_auto_commit")]
    pub auto_commit: bool,
    /// Auto-commit period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub auto_commit_interval_ms: u64,
    /// Bound on each broker commit in milliseconds (0 = unbounded)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(skip, default = "default_tracer")]
    pub tracer: Arc<dyn Tracer>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: Vec::new(),
            group_id: String::new(),
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            auto_commit: true,
            auto_commit_interval_ms: DEFAULT_INTERVAL_MS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            tracer: default_tracer(),
        }
    }
}

impl PollerConfig {
    pub fn builder() -> PollerConfigBuilder {
        PollerConfigBuilder::default()
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        millis(self.operation_timeout_ms)
    }

    /// Name used for logs, spans and health checks
    pub fn resource(&self) -> String {
        if self.topics.is_empty() {
            self.group_id.clone()
        } else {
            self.topics.join(",")
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if self.batch_capacity == 0 {
            return Err(Error::Config(
                "batch_capacity must be at least 1".to_string(),
            ));
        }
        if self.auto_commit && self.auto_commit_interval_ms == 0 {
            return Err(Error::Config(
                "auto_commit_interval_ms must be positive when auto_commit is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`PollerConfig`]
#[derive(Default)]
pub struct PollerConfigBuilder {
    config: PollerConfig,
}

impl PollerConfigBuilder {
    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.config.broker = broker;
        self
    }

    pub fn bootstrap_servers(mut self, servers: Vec<String>) -> Self {
        self.config.broker.bootstrap_servers = servers;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.broker.username = Some(username.into());
        self.config.broker.password = Some(password.into());
        self
    }

    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.config.topics = topics;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topics.push(topic.into());
        self
    }

    pub fn group_id(mut self, group: impl Into<String>) -> Self {
        self.config.group_id = group.into();
        self
    }

    pub fn batch_capacity(mut self, capacity: usize) -> Self {
        self.config.batch_capacity = capacity;
        self
    }

    pub fn enable_auto_commit(mut self, enabled: bool) -> Self {
        self.config.auto_commit = enabled;
        self
    }

    pub fn auto_commit_interval(mut self, interval: Duration) -> Self {
        self.config.auto_commit_interval_ms = interval.as_millis() as u64;
        self
    }

    /// `None` leaves broker commits unbounded
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.operation_timeout_ms = timeout.map_or(0, |d| d.as_millis() as u64);
        self
    }

    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.config.tracer = tracer;
        self
    }

    pub fn build(self) -> PollerConfig {
        self.config
    }
}
