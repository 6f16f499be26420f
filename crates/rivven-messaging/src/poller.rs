//! Consumer fetch loop with hand-off backpressure and batched commits
//!
//! A [`Poller`] fetches from the broker, pushes each message into a
//! caller-supplied channel and stages its acknowledgement in a [`Reader`].
//! The push waits until the channel has room, so the fetch loop never runs
//! ahead of the caller.
//!
//! ```text
//!          poll()                   cancel / fetch error
//!   Idle ──────────► Polling ─────────────────────────► Draining ──► Closed
//!     │                                                                ▲
//!     └──────────────────────────── close() ───────────────────────────┘
//! ```
//!
//! Draining commits what is staged, drops the output sender (closing the
//! channel) and returns the fetch error, if any, combined with the commit
//! error. Cancellation is a clean shutdown, not an error.
//!
//! # Example
//!
//! ```rust,ignore
//! let poller = Poller::new(broker_reader, config)?;
//! let (tx, mut rx) = mpsc::channel(1);
//! let cancel = CancellationToken::new();
//!
//! let handle = tokio::spawn({
//!     let cancel = cancel.clone();
//!     async move { poller.poll(cancel, tx).await }
//! });
//!
//! while let Some(message) = rx.recv().await {
//!     process(message).await;
//! }
//! ```

use crate::broker::BrokerReader;
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::message::Message;
use crate::reader::{Reader, ReaderStats};
use crate::tracer::{SpanKind, Tracer};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`Poller`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    /// Constructed, not yet polling
    Idle,
    /// Fetch loop running
    Polling,
    /// Issuing the final commit
    Draining,
    /// Output channel closed; terminal
    Closed,
}

impl PollerState {
    /// True while a `poll` call is in progress
    pub fn is_active(&self) -> bool {
        matches!(self, PollerState::Polling | PollerState::Draining)
    }
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PollerState::Idle => "idle",
            PollerState::Polling => "polling",
            PollerState::Draining => "draining",
            PollerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Consumer orchestrator
pub struct Poller {
    reader: Arc<Reader>,
    tracer: Arc<dyn Tracer>,
    name: String,
    state: watch::Sender<PollerState>,
    /// Stops `poll` and the auto-commit task
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    stats: PollerCounters,
}

/// Moves the poller to `Closed` when `poll` returns or its future is
/// dropped mid-flight, so `close` never waits on an abandoned poll.
struct PollGuard<'a> {
    state: &'a watch::Sender<PollerState>,
    name: &'a str,
    finished: bool,
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(poller = %self.name, "Poll abandoned before draining");
        }
        self.state.send_replace(PollerState::Closed);
    }
}

/// How a hand-off ended
enum HandOff {
    Delivered,
    Cancelled,
}

impl Poller {
    /// Create a poller owning `broker`.
    ///
    /// Spawns the auto-commit task when enabled, so this must be called
    /// from within a Tokio runtime.
    pub fn new(broker: impl BrokerReader, config: PollerConfig) -> Result<Self> {
        let reader = Arc::new(Reader::new(broker, &config)?);
        let (state, _) = watch::channel(PollerState::Idle);

        let poller = Self {
            reader,
            tracer: Arc::clone(&config.tracer),
            name: format!("poller:{}", config.resource()),
            state,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
            stats: PollerCounters::default(),
        };

        if config.auto_commit {
            poller.spawn_auto_commit(config.auto_commit_interval());
        }

        info!(
            poller = %poller.name,
            group_id = %config.group_id,
            capacity = config.batch_capacity,
            auto_commit = config.auto_commit,
            "Poller initialized"
        );

        Ok(poller)
    }

    /// Run the fetch loop until `cancel` fires, the poller is closed, or a
    /// fetch, hand-off or staging error occurs.
    ///
    /// `out` is dropped on return, which closes the channel for the caller.
    /// Dropping the returned future also leaves the poller `Closed`; anything
    /// it staged is committed by [`close`](Poller::close).
    /// Returns [`Error::InvalidState`] unless the poller is idle.
    pub async fn poll(&self, cancel: CancellationToken, out: mpsc::Sender<Message>) -> Result<()> {
        let mut started = false;
        self.state.send_if_modified(|state| {
            if *state == PollerState::Idle {
                *state = PollerState::Polling;
                started = true;
            }
            started
        });
        if !started {
            return Err(Error::InvalidState(format!(
                "poll requires an idle poller, current state is {}",
                self.state()
            )));
        }
        let mut guard = PollGuard {
            state: &self.state,
            name: &self.name,
            finished: false,
        };
        info!(poller = %self.name, "Polling started");

        let poll_err = self.fetch_loop(&cancel, &out).await.err();

        self.state.send_replace(PollerState::Draining);
        debug!(poller = %self.name, staged = self.reader.staged(), "Draining");

        let commit_err = self.reader.commit().await.err();
        if let Some(ref e) = commit_err {
            error!(poller = %self.name, error = %e, "Final commit failed");
        }
        drop(out);

        let result = Error::combine(poll_err, commit_err);
        guard.finished = true;
        drop(guard);

        match result {
            Some(e) => {
                warn!(poller = %self.name, error = %e, "Polling stopped with error");
                Err(e)
            }
            None => {
                info!(poller = %self.name, "Polling stopped");
                Ok(())
            }
        }
    }

    async fn fetch_loop(&self, cancel: &CancellationToken, out: &mpsc::Sender<Message>) -> Result<()> {
        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = self.shutdown.cancelled() => return Ok(()),
                result = self.reader.fetch_message() => result,
            };

            let message = match fetched {
                Ok(message) => message,
                Err(e) if e.is_cancelled() => {
                    debug!(poller = %self.name, "Fetch cancelled");
                    return Ok(());
                }
                Err(e) => {
                    self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
                    error!(poller = %self.name, error = %e, "Fetch failed");
                    return Err(e);
                }
            };

            match self.hand_off(message, cancel, out).await? {
                HandOff::Delivered => {}
                HandOff::Cancelled => return Ok(()),
            }
        }
    }

    /// Push one message to the caller and stage its acknowledgement.
    async fn hand_off(
        &self,
        message: Message,
        cancel: &CancellationToken,
        out: &mpsc::Sender<Message>,
    ) -> Result<HandOff> {
        let parent = self.tracer.extract(&message);
        let mut span = self.tracer.start_span(
            parent.as_ref(),
            "poller.consume",
            SpanKind::Consumer,
            &message.topic,
        );
        span.set_attribute("messaging.destination", message.topic.as_str().into());
        span.set_attribute("messaging.partition", message.partition.into());
        span.set_attribute("messaging.offset", message.offset.into());

        let marker = message.commit_marker();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = self.shutdown.cancelled() => None,
            permit = out.reserve() => Some(permit),
        };
        match permit {
            // Not handed off, so not committed; the broker redelivers it
            None => {
                span.finish();
                return Ok(HandOff::Cancelled);
            }
            Some(Err(_)) => {
                let e = Error::OutputClosed;
                span.record_error(&e);
                span.finish();
                return Err(e);
            }
            Some(Ok(permit)) => permit.send(message),
        }
        self.stats.messages_polled.fetch_add(1, Ordering::Relaxed);

        let stored = self.store_message(&marker).await;
        if let Err(ref e) = stored {
            span.record_error(e);
        }
        span.finish();
        stored.map(|()| HandOff::Delivered)
    }

    /// Stage an acknowledgement, committing once to make room when full.
    async fn store_message(&self, message: &Message) -> Result<()> {
        match self.reader.store_message(message).await {
            Err(Error::ReaderBufferFull) => {
                debug!(poller = %self.name, "Reader buffer full, committing");
                self.stats.forced_commits.fetch_add(1, Ordering::Relaxed);
                self.reader.commit().await?;
                self.reader.store_message(message).await
            }
            other => other,
        }
    }

    /// Stop polling and the auto-commit task, commit what is staged and
    /// close the broker reader.
    ///
    /// Returns [`Error::Closed`] if the poller was already closed.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("poller"));
        }

        self.shutdown.cancel();
        self.state.send_if_modified(|state| {
            if *state == PollerState::Idle {
                *state = PollerState::Closed;
                return true;
            }
            false
        });

        // Wait for an in-flight poll to finish its drain
        let mut state = self.state.subscribe();
        if state.wait_for(|s| !s.is_active()).await.is_err() {
            warn!(poller = %self.name, "State channel closed while waiting for poll");
        }

        self.tracker.close();
        self.tracker.wait().await;

        // No-op when the auto-commit task already committed everything
        let commit_err = self.reader.commit().await.err();
        let close_err = self.reader.close().await.err();

        info!(poller = %self.name, "Poller closed");

        match Error::combine(commit_err, close_err) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    /// The commit buffer, for callers that commit explicitly
    pub fn reader(&self) -> &Reader {
        &self.reader
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            state: self.state(),
            messages_polled: self.stats.messages_polled.load(Ordering::Relaxed),
            fetch_errors: self.stats.fetch_errors.load(Ordering::Relaxed),
            forced_commits: self.stats.forced_commits.load(Ordering::Relaxed),
            reader: self.reader.stats(),
        }
    }

    fn spawn_auto_commit(&self, interval: Duration) {
        let reader = Arc::clone(&self.reader);
        let cancel = self.shutdown.clone();
        let name = self.name.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = reader.commit().await {
                            error!(
                                poller = %name,
                                severity = "emergency",
                                error = %e,
                                staged = reader.staged(),
                                "Auto-commit failed"
                            );
                        }
                    }
                }
            }

            if let Err(e) = reader.commit().await {
                error!(poller = %name, severity = "emergency", error = %e, "Commit on shutdown failed");
            }
            debug!(poller = %name, "Auto-commit task stopped");
        });
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl HealthCheck for Poller {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status_check(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "poller": self.stats(),
            "broker": self.reader.broker_stats(),
            "closed": self.closed.load(Ordering::Acquire),
        }))
    }
}

#[derive(Default)]
struct PollerCounters {
    messages_polled: AtomicU64,
    fetch_errors: AtomicU64,
    forced_commits: AtomicU64,
}

/// Poller statistics snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerStats {
    pub state: PollerState,
    /// Messages handed off to the output channel
    pub messages_polled: u64,
    pub fetch_errors: u64,
    /// Commits forced by a full reader buffer
    pub forced_commits: u64,
    pub reader: ReaderStats,
}
